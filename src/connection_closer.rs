use crate::{connection_status::ConnectionStatus, internal_rpc::InternalRPCHandle};
use std::fmt;

/// Gracefully closes the connection once the last user-held handle is gone,
/// so scoped usage releases the broker connection on every exit path,
/// including unwinding.
pub(crate) struct ConnectionCloser {
    status: ConnectionStatus,
    internal_rpc: InternalRPCHandle,
}

impl ConnectionCloser {
    pub(crate) fn new(status: ConnectionStatus, internal_rpc: InternalRPCHandle) -> Self {
        Self {
            status,
            internal_rpc,
        }
    }
}

impl Drop for ConnectionCloser {
    fn drop(&mut self) {
        if self.status.connected() || self.status.connecting() {
            self.internal_rpc.close_connection_cleanly();
        }
    }
}

impl fmt::Debug for ConnectionCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCloser").finish()
    }
}
