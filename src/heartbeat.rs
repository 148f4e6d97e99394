use parking_lot::Mutex;
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

/// Tracks transport activity so the io loop knows when to emit a heartbeat
/// frame and when to declare the broker dead.
///
/// We send a heartbeat after one idle interval on the write side; we declare
/// the connection lost after two intervals of silence on the read side, as
/// the protocol recommends.
#[derive(Clone, Default)]
pub(crate) struct Heartbeat {
    inner: Arc<Mutex<Option<Inner>>>,
}

struct Inner {
    interval: Duration,
    last_read: Instant,
    last_write: Instant,
}

impl Heartbeat {
    pub(crate) fn set_timeout(&self, interval: Duration) {
        let now = Instant::now();
        *self.inner.lock() = Some(Inner {
            interval,
            last_read: now,
            last_write: now,
        });
    }

    pub(crate) fn update_last_read(&self) {
        if let Some(inner) = self.inner.lock().as_mut() {
            inner.last_read = Instant::now();
        }
    }

    pub(crate) fn update_last_write(&self) {
        if let Some(inner) = self.inner.lock().as_mut() {
            inner.last_write = Instant::now();
        }
    }

    /// How long the io loop may sleep before it needs to check on us again
    pub(crate) fn poll_timeout(&self) -> Option<Duration> {
        self.inner.lock().as_ref().map(|inner| {
            inner
                .interval
                .checked_sub(inner.last_write.elapsed())
                .unwrap_or_default()
        })
    }

    /// An outbound heartbeat is due
    pub(crate) fn should_send(&self) -> bool {
        self.inner
            .lock()
            .as_ref()
            .map_or(false, |inner| inner.last_write.elapsed() >= inner.interval)
    }

    /// The broker missed two intervals, consider the connection dead
    pub(crate) fn dead(&self) -> bool {
        self.inner
            .lock()
            .as_ref()
            .map_or(false, |inner| inner.last_read.elapsed() >= inner.interval * 2)
    }

    pub(crate) fn cancel(&self) {
        *self.inner.lock() = None;
    }
}

impl fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Heartbeat");
        if let Some(inner) = self.inner.lock().as_ref() {
            debug.field("interval", &inner.interval);
        }
        debug.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_heartbeat_never_fires() {
        let heartbeat = Heartbeat::default();
        assert!(heartbeat.poll_timeout().is_none());
        assert!(!heartbeat.should_send());
        assert!(!heartbeat.dead());
    }

    #[test]
    fn idle_write_side_triggers_a_send() {
        let heartbeat = Heartbeat::default();
        heartbeat.set_timeout(Duration::from_millis(0));
        assert!(heartbeat.should_send());
    }

    #[test]
    fn fresh_activity_postpones_everything() {
        let heartbeat = Heartbeat::default();
        heartbeat.set_timeout(Duration::from_secs(60));
        assert!(!heartbeat.should_send());
        assert!(!heartbeat.dead());
        assert!(heartbeat.poll_timeout().unwrap() <= Duration::from_secs(60));
    }
}
