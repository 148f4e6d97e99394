use crate::{consumer::Consumer, types::ShortString, Error};
use parking_lot::Mutex;
use std::{collections::HashMap, fmt, sync::Arc};

/// The consumer callbacks of the channel, keyed by consumer tag.
#[derive(Clone, Default)]
pub(crate) struct Consumers(Arc<Mutex<HashMap<ShortString, Consumer>>>);

impl Consumers {
    pub(crate) fn register(&self, tag: ShortString, consumer: Consumer) {
        self.0.lock().insert(tag, consumer);
    }

    pub(crate) fn deregister(&self, tag: &str) -> Option<Consumer> {
        let consumer = self.0.lock().remove(&ShortString::from(tag));
        if let Some(consumer) = consumer.as_ref() {
            consumer.cancel();
        }
        consumer
    }

    pub(crate) fn get(&self, tag: &str) -> Option<Consumer> {
        self.0.lock().get(&ShortString::from(tag)).cloned()
    }

    pub(crate) fn drop_prefetched_messages(&self) {
        for consumer in self.0.lock().values() {
            consumer.drop_prefetched_messages();
        }
    }

    pub(crate) fn cancel_all(&self) {
        for (_, consumer) in self.0.lock().drain() {
            consumer.cancel();
        }
    }

    pub(crate) fn error_all(&self, error: Error) {
        for (_, consumer) in self.0.lock().drain() {
            consumer.set_error(error.clone());
        }
    }
}

impl fmt::Debug for Consumers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumers")
            .field("tags", &self.0.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}
