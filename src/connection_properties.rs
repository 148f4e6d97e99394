use crate::types::{AMQPValue, FieldTable, LongString};
use executor_trait::FullExecutor;
use std::sync::Arc;

/// What the client advertises and overrides for a connection: the locale,
/// the client-properties table sent in `Connection.StartOk` and optionally
/// the executor running consumer delegates and internal futures.
#[derive(Clone)]
pub struct ConnectionProperties {
    pub locale: String,
    pub client_properties: FieldTable,
    pub executor: Option<Arc<dyn FullExecutor + Send + Sync>>,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            locale: "en_US".into(),
            client_properties: FieldTable::default(),
            executor: None,
        }
    }
}

impl ConnectionProperties {
    pub fn with_connection_name(mut self, connection_name: LongString) -> Self {
        self.client_properties
            .insert("connection_name".into(), AMQPValue::LongString(connection_name));
        self
    }

    pub fn with_executor<E: FullExecutor + Send + Sync + 'static>(mut self, executor: E) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }
}

impl std::fmt::Debug for ConnectionProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionProperties")
            .field("locale", &self.locale)
            .field("client_properties", &self.client_properties)
            .finish()
    }
}
