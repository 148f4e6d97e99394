use parking_lot::RwLock;
use std::{fmt, sync::Arc};

/// The connection tuning as negotiated during the handshake: the minimum of
/// what we requested and what the server proposed, `0` standing for "take
/// the other side's value".
#[derive(Clone, Default)]
pub struct Configuration {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    channel_max: u16,
    frame_max: u32,
    heartbeat: u16,
}

impl Configuration {
    pub fn channel_max(&self) -> u16 {
        self.inner.read().channel_max
    }

    pub(crate) fn set_channel_max(&self, channel_max: u16) {
        self.inner.write().channel_max = channel_max;
    }

    pub fn frame_max(&self) -> u32 {
        self.inner.read().frame_max
    }

    pub(crate) fn set_frame_max(&self, frame_max: u32) {
        self.inner.write().frame_max = frame_max;
    }

    pub fn heartbeat(&self) -> u16 {
        self.inner.read().heartbeat
    }

    pub(crate) fn set_heartbeat(&self, heartbeat: u16) {
        self.inner.write().heartbeat = heartbeat;
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Configuration")
            .field("channel_max", &inner.channel_max)
            .field("frame_max", &inner.frame_max)
            .field("heartbeat", &inner.heartbeat)
            .finish()
    }
}
