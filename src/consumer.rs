use crate::{
    killswitch::KillSwitch,
    message::{Delivery, DeliveryResult},
    types::ShortString,
    BasicProperties, Error,
};
use async_trait::async_trait;
use executor_trait::FullExecutor;
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tracing::trace;

/// The callback invoked for every delivery of a subscription.
///
/// Deliveries of one consumer are handed over strictly in broker order: the
/// future returned for delivery N is awaited to completion before delivery
/// N+1 is dispatched. `Ok(None)` signals the consumer got canceled, `Err`
/// that the channel died.
#[async_trait]
pub trait ConsumerDelegate: Send + Sync {
    async fn on_new_delivery(&self, delivery: DeliveryResult);
}

/// A registered subscription, identified by its consumer tag.
///
/// Deliveries are buffered until a delegate gets registered with
/// [`Consumer::set_delegate`], then dispatched to it FIFO.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<Mutex<ConsumerInner>>,
}

struct ConsumerInner {
    tag: ShortString,
    current: Option<Delivery>,
    deliveries_in: Sender<DeliveryResult>,
    deliveries_out: Receiver<DeliveryResult>,
    executor: Arc<dyn FullExecutor + Send + Sync>,
    worker: KillSwitch,
    canceled: bool,
}

impl Consumer {
    pub(crate) fn new(tag: ShortString, executor: Arc<dyn FullExecutor + Send + Sync>) -> Self {
        let (deliveries_in, deliveries_out) = flume::unbounded();
        Self {
            inner: Arc::new(Mutex::new(ConsumerInner {
                tag,
                current: None,
                deliveries_in,
                deliveries_out,
                executor,
                worker: KillSwitch::default(),
                canceled: false,
            })),
        }
    }

    pub fn tag(&self) -> ShortString {
        self.inner.lock().tag.clone()
    }

    /// Register the delivery callback, dispatching anything already buffered
    pub fn set_delegate<D: ConsumerDelegate + 'static>(&self, delegate: D) {
        let mut inner = self.inner.lock();
        inner.worker.kill();
        let killswitch = KillSwitch::default();
        inner.worker = killswitch.clone();
        let receiver = inner.deliveries_out.clone();
        let delegate: Arc<dyn ConsumerDelegate> = Arc::new(delegate);
        let tag = inner.tag.clone();
        inner.executor.spawn(Box::pin(async move {
            trace!(consumer_tag = %tag, "consumer worker started");
            while let Ok(delivery) = receiver.recv_async().await {
                if killswitch.killed() {
                    break;
                }
                let last = !matches!(delivery, Ok(Some(_)));
                delegate.on_new_delivery(delivery).await;
                if last {
                    break;
                }
            }
        }));
    }

    pub(crate) fn start_new_delivery(&self, delivery: Delivery) {
        self.inner.lock().current = Some(delivery);
    }

    pub(crate) fn set_delivery_properties(&self, properties: BasicProperties) {
        if let Some(delivery) = self.inner.lock().current.as_mut() {
            delivery.properties = properties;
        }
    }

    pub(crate) fn receive_delivery_content(&self, data: Vec<u8>) {
        if let Some(delivery) = self.inner.lock().current.as_mut() {
            delivery.receive_content(data);
        }
    }

    pub(crate) fn new_delivery_complete(&self) {
        let mut inner = self.inner.lock();
        if let Some(delivery) = inner.current.take() {
            trace!(consumer_tag = %inner.tag, delivery_tag = delivery.delivery_tag, "new delivery");
            let _ = inner.deliveries_in.send(Ok(Some(delivery)));
        }
    }

    pub(crate) fn drop_prefetched_messages(&self) {
        let inner = self.inner.lock();
        while inner.deliveries_out.try_recv().is_ok() {}
    }

    pub(crate) fn cancel(&self) {
        let mut inner = self.inner.lock();
        if !inner.canceled {
            inner.canceled = true;
            inner.current = None;
            let _ = inner.deliveries_in.send(Ok(None));
        }
    }

    pub(crate) fn set_error(&self, error: Error) {
        let mut inner = self.inner.lock();
        inner.current = None;
        let _ = inner.deliveries_in.send(Err(error));
    }

    #[cfg(test)]
    pub(crate) fn next_delivery(&self) -> Option<DeliveryResult> {
        self.inner.lock().deliveries_out.try_recv().ok()
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Consumer")
            .field("tag", &inner.tag)
            .field("canceled", &inner.canceled)
            .finish()
    }
}
