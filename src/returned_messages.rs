use crate::{message::BasicReturnMessage, BasicProperties};
use parking_lot::Mutex;
use std::{collections::VecDeque, fmt, sync::Arc};
use tracing::trace;

/// Collects the messages the broker hands back through `Basic.Return`.
///
/// A return arriving while confirms are enabled is kept aside so the
/// matching `Basic.Ack`/`Basic.Nack` can carry it; the other ones accumulate
/// until `wait_for_confirms` drains them. A registered return handler
/// observes every completed returned message either way.
#[derive(Clone, Default)]
pub(crate) struct ReturnedMessages {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    current: Option<BasicReturnMessage>,
    waiting_confirm: VecDeque<BasicReturnMessage>,
    returned: VecDeque<BasicReturnMessage>,
    handler: Option<Box<dyn FnMut(BasicReturnMessage) + Send>>,
}

impl ReturnedMessages {
    pub(crate) fn start_new_delivery(&self, message: BasicReturnMessage) {
        self.inner.lock().current = Some(message);
    }

    pub(crate) fn set_delivery_properties(&self, properties: BasicProperties) {
        if let Some(message) = self.inner.lock().current.as_mut() {
            message.delivery.properties = properties;
        }
    }

    pub(crate) fn receive_delivery_content(&self, data: Vec<u8>) {
        if let Some(message) = self.inner.lock().current.as_mut() {
            message.delivery.receive_content(data);
        }
    }

    pub(crate) fn new_delivery_complete(&self, confirm_mode: bool) {
        let mut inner = self.inner.lock();
        if let Some(message) = inner.current.take() {
            trace!(?message, "new returned message");
            if let Some(handler) = inner.handler.as_mut() {
                handler(message.clone());
            }
            if confirm_mode {
                inner.waiting_confirm.push_back(message);
            } else {
                inner.returned.push_back(message);
            }
        }
    }

    /// Attach the oldest completed return to the confirmation being resolved
    pub(crate) fn take_waiting(&self) -> Option<BasicReturnMessage> {
        self.inner.lock().waiting_confirm.pop_front()
    }

    pub(crate) fn set_handler<E: FnMut(BasicReturnMessage) + Send + 'static>(&self, handler: E) {
        self.inner.lock().handler = Some(Box::new(handler));
    }

    pub(crate) fn drain(&self) -> Vec<BasicReturnMessage> {
        let mut inner = self.inner.lock();
        let returned: Vec<_> = inner.returned.drain(..).collect();
        let waiting_confirm: Vec<_> = inner.waiting_confirm.drain(..).collect();
        returned.into_iter().chain(waiting_confirm).collect()
    }

    /// Forget a partially assembled return when the channel goes away
    pub(crate) fn reset_current(&self) {
        self.inner.lock().current = None;
    }
}

impl fmt::Debug for ReturnedMessages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ReturnedMessages")
            .field("current", &inner.current)
            .field("waiting_confirm", &inner.waiting_confirm.len())
            .field("returned", &inner.returned.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> BasicReturnMessage {
        BasicReturnMessage::new("ex".into(), "rk".into(), 312, "NO_ROUTE".into())
    }

    #[test]
    fn content_is_assembled_before_completion() {
        let returned = ReturnedMessages::default();
        returned.start_new_delivery(message());
        returned.receive_delivery_content(b"he".to_vec());
        returned.receive_delivery_content(b"llo".to_vec());
        returned.new_delivery_complete(false);
        let drained = returned.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].delivery.data, b"hello");
    }

    #[test]
    fn handler_observes_completed_returns() {
        let returned = ReturnedMessages::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let witness = seen.clone();
        returned.set_handler(move |message| witness.lock().push(message));
        returned.start_new_delivery(message());
        returned.new_delivery_complete(true);
        assert_eq!(seen.lock().len(), 1);
        assert!(returned.take_waiting().is_some());
        assert!(returned.take_waiting().is_none());
    }
}
