use crate::{auth::Credentials, connection_properties::ConnectionProperties, Connection, PromiseResolver};
use amq_protocol::auth::SASLMechanism;
use parking_lot::Mutex;
use std::{fmt, sync::Arc};

/// The state of the connection, as seen by the state machine driving the handshake,
/// the close sequence and every API precondition check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Initial,
    Connecting,
    Connected,
    Closing,
    Closed,
    Error,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Initial
    }
}

/// Which step of the handshake we're currently waiting on.
///
/// Each step carries the resolver for the pending connect call so that the
/// handler of the next inbound frame can either move forward or fault it.
pub(crate) enum ConnectionStep {
    ProtocolHeader(
        PromiseResolver<Connection>,
        Connection,
        Credentials,
        SASLMechanism,
        ConnectionProperties,
    ),
    StartOk(PromiseResolver<Connection>, Connection, Credentials),
    Open(PromiseResolver<Connection>, Connection),
}

impl ConnectionStep {
    pub(crate) fn into_connection_resolver(self) -> PromiseResolver<Connection> {
        match self {
            ConnectionStep::ProtocolHeader(resolver, ..) => resolver,
            ConnectionStep::StartOk(resolver, ..) => resolver,
            ConnectionStep::Open(resolver, ..) => resolver,
        }
    }
}

impl fmt::Debug for ConnectionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStep::ProtocolHeader(..) => f.write_str("ProtocolHeader"),
            ConnectionStep::StartOk(..) => f.write_str("StartOk"),
            ConnectionStep::Open(..) => f.write_str("Open"),
        }
    }
}

#[derive(Clone, Default)]
pub struct ConnectionStatus {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    connection_step: Option<ConnectionStep>,
    vhost: String,
    username: String,
    blocked: bool,
}

impl ConnectionStatus {
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.inner.lock().state = state;
    }

    pub(crate) fn set_connection_step(&self, step: ConnectionStep) {
        self.inner.lock().connection_step = Some(step);
    }

    pub(crate) fn connection_step(&self) -> Option<ConnectionStep> {
        self.inner.lock().connection_step.take()
    }

    /// Pull out the resolver of a pending connect, whichever step it reached
    pub(crate) fn connection_resolver(&self) -> Option<PromiseResolver<Connection>> {
        self.connection_step()
            .map(ConnectionStep::into_connection_resolver)
    }

    pub fn vhost(&self) -> String {
        self.inner.lock().vhost.clone()
    }

    pub(crate) fn set_vhost(&self, vhost: &str) {
        self.inner.lock().vhost = vhost.into();
    }

    pub fn username(&self) -> String {
        self.inner.lock().username.clone()
    }

    pub(crate) fn set_username(&self, username: &str) {
        self.inner.lock().username = username.into();
    }

    pub(crate) fn block(&self) {
        self.inner.lock().blocked = true;
    }

    pub(crate) fn unblock(&self) {
        self.inner.lock().blocked = false;
    }

    pub fn blocked(&self) -> bool {
        self.inner.lock().blocked
    }

    pub fn connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn closing(&self) -> bool {
        self.state() == ConnectionState::Closing
    }

    pub fn closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn errored(&self) -> bool {
        self.state() == ConnectionState::Error
    }
}

impl fmt::Debug for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectionStatus")
            .field("state", &inner.state)
            .field("connection_step", &inner.connection_step)
            .field("vhost", &inner.vhost)
            .field("username", &inner.username)
            .field("blocked", &inner.blocked)
            .finish()
    }
}
