use mio::{Ready, Registration, SetReadiness};

/// The io-loop side of the wakeup channel: a mio `Registration` the loop
/// polls alongside the socket so that API calls can interrupt a blocking
/// poll when they queue frames.
pub(crate) struct SocketState {
    registration: Registration,
    handle: SocketStateHandle,
}

/// The cheap, cloneable side handed to every channel and to the internal RPC.
#[derive(Clone)]
pub(crate) struct SocketStateHandle {
    set_readiness: SetReadiness,
}

impl Default for SocketState {
    fn default() -> Self {
        let (registration, set_readiness) = Registration::new2();
        Self {
            registration,
            handle: SocketStateHandle { set_readiness },
        }
    }
}

impl SocketState {
    pub(crate) fn handle(&self) -> SocketStateHandle {
        self.handle.clone()
    }

    pub(crate) fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Re-arm the wakeup token after the io loop noticed it
    pub(crate) fn reset(&self) {
        let _ = self.handle.set_readiness.set_readiness(Ready::empty());
    }
}

impl SocketStateHandle {
    pub(crate) fn wake(&self) {
        let _ = self.set_readiness.set_readiness(Ready::readable());
    }
}

impl std::fmt::Debug for SocketStateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketStateHandle").finish()
    }
}
