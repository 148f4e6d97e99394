use crate::{
    protocol::{AMQPError, AMQPSoftError},
    publisher_confirm::{Confirmation, PublisherConfirm},
    returned_messages::ReturnedMessages,
    types::LongLongUInt,
    Error, Promise, PromiseResolver,
};
use parking_lot::Mutex;
use std::{collections::BTreeMap, fmt, sync::Arc};

pub type DeliveryTag = LongLongUInt;

/// The pending publisher-confirm set: one entry per sequence number handed
/// out by `basic_publish` while confirms are enabled, resolved by the
/// matching `Basic.Ack`/`Basic.Nack` (possibly `multiple`).
#[derive(Clone)]
pub(crate) struct Acknowledgements {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    returned_messages: ReturnedMessages,
    pending: BTreeMap<DeliveryTag, PromiseResolver<Confirmation>>,
    on_empty: Vec<PromiseResolver<()>>,
}

impl Acknowledgements {
    pub(crate) fn new(returned_messages: ReturnedMessages) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                returned_messages,
                pending: BTreeMap::new(),
                on_empty: Vec::new(),
            })),
        }
    }

    pub(crate) fn register_pending(&self, delivery_tag: DeliveryTag) -> PublisherConfirm {
        let (promise, resolver) = Promise::new();
        self.inner.lock().pending.insert(delivery_tag, resolver);
        PublisherConfirm::new(promise)
    }

    pub(crate) fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), AMQPError> {
        self.inner.lock().complete(delivery_tag, true)
    }

    pub(crate) fn nack(&self, delivery_tag: DeliveryTag) -> Result<(), AMQPError> {
        self.inner.lock().complete(delivery_tag, false)
    }

    pub(crate) fn ack_all_before(&self, delivery_tag: DeliveryTag) -> Result<(), AMQPError> {
        self.inner.lock().complete_all_before(delivery_tag, true);
        Ok(())
    }

    pub(crate) fn nack_all_before(&self, delivery_tag: DeliveryTag) -> Result<(), AMQPError> {
        self.inner.lock().complete_all_before(delivery_tag, false);
        Ok(())
    }

    pub(crate) fn ack_all_pending(&self) {
        self.inner.lock().complete_all(true);
    }

    pub(crate) fn nack_all_pending(&self) {
        self.inner.lock().complete_all(false);
    }

    /// A promise resolving once every currently pending confirm is settled
    pub(crate) fn get_last_pending(&self) -> Option<Promise<()>> {
        let mut inner = self.inner.lock();
        if inner.pending.is_empty() {
            None
        } else {
            let (promise, resolver) = Promise::new();
            inner.on_empty.push(resolver);
            Some(promise)
        }
    }

    /// The channel died: fault every pending confirm
    pub(crate) fn on_channel_error(&self, error: Error) {
        let mut inner = self.inner.lock();
        let pending = std::mem::take(&mut inner.pending);
        for (_, resolver) in pending {
            resolver.swear(Err(error.clone()));
        }
        for resolver in inner.on_empty.drain(..) {
            resolver.swear(Err(error.clone()));
        }
    }
}

impl Inner {
    fn complete(&mut self, delivery_tag: DeliveryTag, positive: bool) -> Result<(), AMQPError> {
        let resolver = self.pending.remove(&delivery_tag).ok_or_else(|| {
            AMQPError::new(
                AMQPSoftError::PRECONDITIONFAILED.into(),
                format!("unknown delivery tag {}", delivery_tag).into(),
            )
        })?;
        self.resolve(resolver, positive);
        self.notify_if_empty();
        Ok(())
    }

    fn complete_all_before(&mut self, delivery_tag: DeliveryTag, positive: bool) {
        let keep = self.pending.split_off(&(delivery_tag + 1));
        let settled = std::mem::replace(&mut self.pending, keep);
        for (_, resolver) in settled {
            self.resolve(resolver, positive);
        }
        self.notify_if_empty();
    }

    fn complete_all(&mut self, positive: bool) {
        let settled = std::mem::take(&mut self.pending);
        for (_, resolver) in settled {
            self.resolve(resolver, positive);
        }
        self.notify_if_empty();
    }

    fn resolve(&self, resolver: PromiseResolver<Confirmation>, positive: bool) {
        let message = self.returned_messages.take_waiting().map(Box::new);
        let confirmation = if positive {
            Confirmation::Ack(message)
        } else {
            Confirmation::Nack(message)
        };
        resolver.swear(Ok(confirmation));
    }

    fn notify_if_empty(&mut self) {
        if self.pending.is_empty() {
            for resolver in self.on_empty.drain(..) {
                resolver.swear(Ok(()));
            }
        }
    }
}

impl fmt::Debug for Acknowledgements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Acknowledgements")
            .field("pending", &inner.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{future::Future, pin::Pin, task::Poll};

    fn poll_confirm(confirm: &mut PublisherConfirm) -> Poll<crate::Result<Confirmation>> {
        let waker = waker_fn::waker_fn(|| {});
        let mut cx = std::task::Context::from_waker(&waker);
        Pin::new(confirm).poll(&mut cx)
    }

    #[test]
    fn single_ack_resolves_its_sequence_number() {
        let acknowledgements = Acknowledgements::new(ReturnedMessages::default());
        let mut confirm = acknowledgements.register_pending(1);
        assert!(poll_confirm(&mut confirm).is_pending());
        acknowledgements.ack(1).unwrap();
        match poll_confirm(&mut confirm) {
            Poll::Ready(Ok(confirmation)) => assert!(confirmation.is_ack()),
            other => panic!("unexpected confirm state: {:?}", other.is_ready()),
        }
    }

    #[test]
    fn unknown_tag_is_a_precondition_failure() {
        let acknowledgements = Acknowledgements::new(ReturnedMessages::default());
        let error = acknowledgements.ack(42).unwrap_err();
        assert_eq!(error.get_id(), 406);
    }

    #[test]
    fn multiple_nack_settles_everything_up_to_the_tag() {
        let acknowledgements = Acknowledgements::new(ReturnedMessages::default());
        let mut first = acknowledgements.register_pending(1);
        let mut second = acknowledgements.register_pending(2);
        let mut third = acknowledgements.register_pending(3);
        acknowledgements.nack_all_before(2).unwrap();
        assert!(matches!(
            poll_confirm(&mut first),
            Poll::Ready(Ok(Confirmation::Nack(None)))
        ));
        assert!(matches!(
            poll_confirm(&mut second),
            Poll::Ready(Ok(Confirmation::Nack(None)))
        ));
        assert!(poll_confirm(&mut third).is_pending());
    }

    #[test]
    fn last_pending_resolves_once_empty() {
        let acknowledgements = Acknowledgements::new(ReturnedMessages::default());
        assert!(acknowledgements.get_last_pending().is_none());
        let _confirm = acknowledgements.register_pending(1);
        let promise = acknowledgements.get_last_pending().unwrap();
        acknowledgements.ack(1).unwrap();
        let waker = waker_fn::waker_fn(|| {});
        let mut cx = std::task::Context::from_waker(&waker);
        let mut promise = promise;
        assert!(Pin::new(&mut promise).poll(&mut cx).is_ready());
    }

    #[test]
    fn channel_error_faults_every_pending_confirm() {
        let acknowledgements = Acknowledgements::new(ReturnedMessages::default());
        let mut confirm = acknowledgements.register_pending(1);
        acknowledgements.on_channel_error(Error::SyncMethodPending);
        assert!(matches!(poll_confirm(&mut confirm), Poll::Ready(Err(_))));
    }
}
