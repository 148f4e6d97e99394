use crate::{
    acknowledgement::{Acknowledgements, DeliveryTag},
    auth::Credentials,
    channel_receiver_state::DeliveryCause,
    channel_status::{ChannelState, ChannelStatus},
    configuration::Configuration,
    connection_closer::ConnectionCloser,
    connection_status::{ConnectionState, ConnectionStatus, ConnectionStep},
    consumer::Consumer,
    consumers::Consumers,
    error_handler::ChannelCloseHandler,
    exchange::ExchangeKind,
    frames::{ExpectedReply, Frames, Reply},
    id_sequence::IdSequence,
    internal_rpc::InternalRPCHandle,
    message::{BasicGetMessage, BasicReturnMessage, Delivery},
    options::*,
    protocol::{self, AMQPClass, AMQPError, AMQPHardError},
    publisher_confirm::PublisherConfirm,
    queue::Queue,
    returned_messages::ReturnedMessages,
    socket_state::SocketStateHandle,
    types::*,
    BasicProperties, Connection, Error, Promise, PromiseResolver, Result,
};
use amq_protocol::frame::{AMQPContentHeader, AMQPFrame};
use executor_trait::FullExecutor;
use parking_lot::Mutex;
use std::{
    convert::TryFrom,
    fmt,
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
};
use tracing::{debug, error, info, trace};

/// The channel number, shared between every handle of the application
/// channel so that a recycle is transparent to the callers.
#[derive(Clone, Debug, Default)]
pub(crate) struct ChannelId(Arc<AtomicU16>);

impl ChannelId {
    pub(crate) fn new(id: u16) -> Self {
        Self(Arc::new(AtomicU16::new(id)))
    }

    pub(crate) fn get(&self) -> u16 {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn set(&self, id: u16) {
        self.0.store(id, Ordering::SeqCst)
    }
}

type PendingBasicGet =
    Arc<Mutex<Option<(PromiseResolver<Option<BasicGetMessage>>, BasicGetMessage)>>>;

/// Main entry point for most AMQP operations.
///
/// There is exactly one application channel per connection, obtained with
/// [`Connection::channel`]. When the broker closes it with a soft error the
/// channel gets recycled under a fresh number and every handle keeps
/// working; publisher-confirms mode is re-enabled automatically.
///
/// See also the RabbitMQ documentation on [channels](https://www.rabbitmq.com/channels.html).
///
/// [`Connection::channel`]: ./struct.Connection.html#method.channel
#[derive(Clone)]
pub struct Channel {
    id: ChannelId,
    configuration: Configuration,
    status: ChannelStatus,
    connection_status: ConnectionStatus,
    acknowledgements: Acknowledgements,
    delivery_tag: IdSequence<DeliveryTag>,
    consumers: Consumers,
    returned_messages: ReturnedMessages,
    pending_basic_get: PendingBasicGet,
    close_handler: ChannelCloseHandler,
    waker: SocketStateHandle,
    internal_rpc: InternalRPCHandle,
    frames: Frames,
    executor: Arc<dyn FullExecutor + Send + Sync>,
    _connection_closer: Option<Arc<ConnectionCloser>>,
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.id.get() == other.id.get()
    }
}

impl Channel {
    pub(crate) fn new(
        channel_id: u16,
        configuration: Configuration,
        connection_status: ConnectionStatus,
        waker: SocketStateHandle,
        internal_rpc: InternalRPCHandle,
        frames: Frames,
        executor: Arc<dyn FullExecutor + Send + Sync>,
    ) -> Channel {
        let returned_messages = ReturnedMessages::default();
        Channel {
            id: ChannelId::new(channel_id),
            configuration,
            status: ChannelStatus::default(),
            connection_status,
            acknowledgements: Acknowledgements::new(returned_messages.clone()),
            delivery_tag: IdSequence::new(false),
            consumers: Consumers::default(),
            returned_messages,
            pending_basic_get: PendingBasicGet::default(),
            close_handler: ChannelCloseHandler::default(),
            waker,
            internal_rpc,
            frames,
            executor,
            _connection_closer: None,
        }
    }

    pub fn status(&self) -> &ChannelStatus {
        &self.status
    }

    pub fn id(&self) -> u16 {
        self.id.get()
    }

    /// A user-facing handle, carrying a reference on the connection closer
    /// so the connection outlives every channel handle.
    pub(crate) fn clone_external(&self, connection_closer: Arc<ConnectionCloser>) -> Self {
        let mut channel = self.clone();
        channel._connection_closer = Some(connection_closer);
        channel
    }

    /// Invoke `handler` with `(reply-code, reply-text)` whenever the broker
    /// closes the channel. The registration survives channel recycling.
    pub fn on_close<E: FnMut(ShortUInt, ShortString) + Send + 'static>(&self, handler: E) {
        self.close_handler.set_handler(handler);
    }

    /// Invoke `handler` for every returned (unroutable mandatory) message.
    pub fn on_return<E: FnMut(BasicReturnMessage) + Send + 'static>(&self, handler: E) {
        self.returned_messages.set_handler(handler);
    }

    fn wake(&self) {
        trace!(channel = self.id.get(), "wake");
        self.waker.wake()
    }

    fn assert_connected(&self) -> Result<()> {
        if !self.connection_status.connected() {
            Err(Error::InvalidConnectionState(self.connection_status.state()))
        } else if !self.status.connected() {
            Err(Error::InvalidChannelState(self.status.state()))
        } else {
            Ok(())
        }
    }

    fn assert_channel0(&self, class_id: u16, method_id: u16) -> Result<()> {
        if self.id.get() == 0 {
            Ok(())
        } else {
            error!(
                channel = self.id.get(),
                "got a connection frame on a non-zero channel, closing connection"
            );
            let error = AMQPError::new(
                AMQPHardError::COMMANDINVALID.into(),
                format!("connection frame received on channel {}", self.id.get()).into(),
            );
            self.internal_rpc.close_connection(
                error.get_id(),
                error.get_message().to_string(),
                class_id,
                method_id,
            );
            Err(Error::ProtocolError(error))
        }
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.status.set_state(state);
    }

    pub(crate) fn set_closed(&self, error: Error) {
        self.set_state(ChannelState::Closed);
        self.error_publisher_confirms(error);
        self.cancel_consumers();
    }

    pub(crate) fn set_error(&self, error: Error) {
        self.set_state(ChannelState::Error);
        self.error_publisher_confirms(error.clone());
        self.error_consumers(error);
    }

    pub(crate) fn error_publisher_confirms(&self, error: Error) {
        self.acknowledgements.on_channel_error(error);
    }

    pub(crate) fn cancel_consumers(&self) {
        self.consumers.cancel_all();
    }

    pub(crate) fn error_consumers(&self, error: Error) {
        self.consumers.error_all(error);
    }

    /// Tear the channel state down before reopening it under a new number
    pub(crate) fn prepare_recycle(&self, error: Error) {
        self.error_publisher_confirms(error.clone());
        self.cancel_consumers();
        self.returned_messages.reset_current();
        if let Some((resolver, _)) = self.pending_basic_get.lock().take() {
            resolver.swear(Err(error.clone()));
        }
        self.frames
            .clear_expected_replies(self.id.get(), error.clone());
        self.frames.drop_channel_frames(self.id.get(), error);
        self.delivery_tag.reset();
        self.status.reset();
    }

    pub(crate) fn set_channel_id(&self, channel_id: u16) {
        self.id.set(channel_id);
    }

    // Frame submission

    pub(crate) fn send_method_frame(
        &self,
        method: AMQPClass,
        resolver: PromiseResolver<()>,
        expected_reply: Option<ExpectedReply>,
    ) -> Result<()> {
        self.send_frame(
            AMQPFrame::Method(self.id.get(), method),
            resolver,
            expected_reply,
        )
    }

    pub(crate) fn send_frame(
        &self,
        frame: AMQPFrame,
        resolver: PromiseResolver<()>,
        expected_reply: Option<ExpectedReply>,
    ) -> Result<()> {
        trace!(channel = self.id.get(), "send_frame");
        self.frames
            .push(self.id.get(), frame, resolver, expected_reply)?;
        self.wake();
        Ok(())
    }

    /// Protocol replies jump ahead of the queued methods
    fn send_priority_frame(&self, method: AMQPClass) -> Promise<()> {
        let (promise, resolver) = Promise::new();
        self.frames
            .push_priority(AMQPFrame::Method(self.id.get(), method), resolver);
        self.wake();
        promise
    }

    async fn send_method_frame_with_body(
        &self,
        method: AMQPClass,
        payload: Vec<u8>,
        properties: BasicProperties,
        publisher_confirms_result: Option<PublisherConfirm>,
    ) -> Result<PublisherConfirm> {
        let class_id = method.get_amqp_class_id();
        let header = AMQPContentHeader {
            class_id,
            body_size: payload.len() as u64,
            properties,
        };
        let frame_max = self.configuration.frame_max();
        let channel_id = self.id.get();
        let mut frames = vec![
            AMQPFrame::Method(channel_id, method),
            AMQPFrame::Header(channel_id, class_id, Box::new(header)),
        ];

        // a content body frame has 8 bytes of overhead
        frames.extend(
            payload
                .as_slice()
                .chunks(frame_max as usize - 8)
                .map(|chunk| AMQPFrame::Body(channel_id, chunk.into())),
        );

        trace!(channel = channel_id, frames = frames.len(), "send_frames");
        let promise = self.frames.push_frames(frames);
        self.wake();
        promise.await?;
        Ok(publisher_confirms_result.unwrap_or_else(PublisherConfirm::not_requested))
    }

    /// The synchronous method pattern: queue the method frame along with
    /// its expected reply, await the write, then await the reply.
    async fn method_rpc<T: Send + 'static>(
        &self,
        method: AMQPClass,
        promise: Promise<T>,
        expected_reply: ExpectedReply,
    ) -> Result<T> {
        let (send_promise, send_resolver) = Promise::new();
        self.send_method_frame(method, send_resolver, Some(expected_reply))?;
        send_promise.await?;
        promise.await
    }

    async fn send_and_forget(&self, method: AMQPClass) -> Result<()> {
        let (promise, resolver) = Promise::new();
        self.send_method_frame(method, resolver, None)?;
        promise.await
    }

    // Public API

    pub async fn close(&self, reply_code: ShortUInt, reply_text: &str) -> Result<()> {
        self.do_channel_close(reply_code, reply_text, 0, 0).await
    }

    pub async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<()> {
        self.assert_connected()?;
        validate_short_string("exchange", exchange)?;
        let ExchangeDeclareOptions {
            passive,
            durable,
            auto_delete,
            internal,
            nowait,
        } = options;
        let method = AMQPClass::Exchange(protocol::exchange::AMQPMethod::Declare(
            protocol::exchange::Declare {
                exchange: exchange.into(),
                kind: kind.kind().into(),
                passive,
                durable,
                auto_delete,
                internal,
                nowait,
                arguments,
            },
        ));
        if nowait {
            return self.send_and_forget(method).await;
        }
        let (promise, resolver) = Promise::new();
        self.method_rpc(method, promise, ExpectedReply(Reply::ExchangeDeclareOk(resolver)))
            .await
    }

    pub async fn exchange_delete(
        &self,
        exchange: &str,
        options: ExchangeDeleteOptions,
    ) -> Result<()> {
        self.assert_connected()?;
        validate_short_string("exchange", exchange)?;
        let ExchangeDeleteOptions { if_unused, nowait } = options;
        let method = AMQPClass::Exchange(protocol::exchange::AMQPMethod::Delete(
            protocol::exchange::Delete {
                exchange: exchange.into(),
                if_unused,
                nowait,
            },
        ));
        if nowait {
            return self.send_and_forget(method).await;
        }
        let (promise, resolver) = Promise::new();
        self.method_rpc(method, promise, ExpectedReply(Reply::ExchangeDeleteOk(resolver)))
            .await
    }

    pub async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<Queue> {
        self.assert_connected()?;
        validate_short_string("queue", queue)?;
        let QueueDeclareOptions {
            passive,
            durable,
            exclusive,
            auto_delete,
            nowait,
        } = options;
        let method = AMQPClass::Queue(protocol::queue::AMQPMethod::Declare(
            protocol::queue::Declare {
                queue: queue.into(),
                passive,
                durable,
                exclusive,
                auto_delete,
                nowait,
                arguments,
            },
        ));
        if nowait {
            self.send_and_forget(method).await?;
            return Ok(Queue::new(queue.into(), 0, 0));
        }
        let (promise, resolver) = Promise::new();
        self.method_rpc(method, promise, ExpectedReply(Reply::QueueDeclareOk(resolver)))
            .await
    }

    pub async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<()> {
        self.assert_connected()?;
        validate_short_string("queue", queue)?;
        validate_short_string("exchange", exchange)?;
        validate_short_string("routing_key", routing_key)?;
        let QueueBindOptions { nowait } = options;
        let method = AMQPClass::Queue(protocol::queue::AMQPMethod::Bind(protocol::queue::Bind {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            nowait,
            arguments,
        }));
        if nowait {
            return self.send_and_forget(method).await;
        }
        let (promise, resolver) = Promise::new();
        self.method_rpc(method, promise, ExpectedReply(Reply::QueueBindOk(resolver)))
            .await
    }

    pub async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        self.assert_connected()?;
        validate_short_string("queue", queue)?;
        validate_short_string("exchange", exchange)?;
        validate_short_string("routing_key", routing_key)?;
        let method = AMQPClass::Queue(protocol::queue::AMQPMethod::Unbind(
            protocol::queue::Unbind {
                queue: queue.into(),
                exchange: exchange.into(),
                routing_key: routing_key.into(),
                arguments,
            },
        ));
        let (promise, resolver) = Promise::new();
        self.method_rpc(method, promise, ExpectedReply(Reply::QueueUnbindOk(resolver)))
            .await
    }

    pub async fn queue_purge(&self, queue: &str, options: QueuePurgeOptions) -> Result<LongUInt> {
        self.assert_connected()?;
        validate_short_string("queue", queue)?;
        let QueuePurgeOptions { nowait } = options;
        let method = AMQPClass::Queue(protocol::queue::AMQPMethod::Purge(protocol::queue::Purge {
            queue: queue.into(),
            nowait,
        }));
        if nowait {
            self.send_and_forget(method).await?;
            return Ok(0);
        }
        let (promise, resolver) = Promise::new();
        self.method_rpc(method, promise, ExpectedReply(Reply::QueuePurgeOk(resolver)))
            .await
    }

    pub async fn queue_delete(&self, queue: &str, options: QueueDeleteOptions) -> Result<LongUInt> {
        self.assert_connected()?;
        validate_short_string("queue", queue)?;
        let QueueDeleteOptions {
            if_unused,
            if_empty,
            nowait,
        } = options;
        let method = AMQPClass::Queue(protocol::queue::AMQPMethod::Delete(
            protocol::queue::Delete {
                queue: queue.into(),
                if_unused,
                if_empty,
                nowait,
            },
        ));
        if nowait {
            self.send_and_forget(method).await?;
            return Ok(0);
        }
        let (promise, resolver) = Promise::new();
        self.method_rpc(method, promise, ExpectedReply(Reply::QueueDeleteOk(resolver)))
            .await
    }

    /// RabbitMQ does not implement nonzero `prefetch_size`; it is refused
    /// here before reaching the wire.
    pub async fn basic_qos(
        &self,
        prefetch_count: ShortUInt,
        options: BasicQosOptions,
    ) -> Result<()> {
        self.assert_connected()?;
        if options.prefetch_size != 0 {
            return Err(Error::NotImplementedOnServer(
                "basic_qos with nonzero prefetch_size",
            ));
        }
        let BasicQosOptions { global, .. } = options;
        let method = AMQPClass::Basic(protocol::basic::AMQPMethod::Qos(protocol::basic::Qos {
            prefetch_count,
            global,
        }));
        let (promise, resolver) = Promise::new();
        self.method_rpc(method, promise, ExpectedReply(Reply::BasicQosOk(resolver)))
            .await
    }

    /// Subscribe to a queue. The returned [`Consumer`] buffers deliveries
    /// until a delegate gets registered with [`Consumer::set_delegate`].
    pub async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Result<Consumer> {
        self.assert_connected()?;
        validate_short_string("queue", queue)?;
        validate_short_string("consumer_tag", consumer_tag)?;
        let BasicConsumeOptions {
            no_local,
            no_ack,
            exclusive,
            nowait,
        } = options;
        let method = AMQPClass::Basic(protocol::basic::AMQPMethod::Consume(
            protocol::basic::Consume {
                queue: queue.into(),
                consumer_tag: consumer_tag.into(),
                no_local,
                no_ack,
                exclusive,
                nowait,
                arguments,
            },
        ));
        if nowait {
            if consumer_tag.is_empty() {
                return Err(Error::InvalidArgument(
                    "basic_consume with nowait requires a consumer_tag".into(),
                ));
            }
            let consumer = Consumer::new(consumer_tag.into(), self.executor.clone());
            self.consumers.register(consumer_tag.into(), consumer.clone());
            self.send_and_forget(method).await?;
            return Ok(consumer);
        }
        let (promise, resolver) = Promise::new();
        self.method_rpc(method, promise, ExpectedReply(Reply::BasicConsumeOk(resolver)))
            .await
    }

    pub async fn basic_cancel(
        &self,
        consumer_tag: &str,
        options: BasicCancelOptions,
    ) -> Result<()> {
        self.assert_connected()?;
        validate_short_string("consumer_tag", consumer_tag)?;
        let BasicCancelOptions { nowait } = options;
        let method = AMQPClass::Basic(protocol::basic::AMQPMethod::Cancel(
            protocol::basic::Cancel {
                consumer_tag: consumer_tag.into(),
                nowait,
            },
        ));
        if nowait {
            self.consumers.deregister(consumer_tag);
            return self.send_and_forget(method).await;
        }
        let (promise, resolver) = Promise::new();
        self.method_rpc(method, promise, ExpectedReply(Reply::BasicCancelOk(resolver)))
            .await
    }

    /// Fetch a single message, `None` when the queue is empty.
    pub async fn basic_get(
        &self,
        queue: &str,
        options: BasicGetOptions,
    ) -> Result<Option<BasicGetMessage>> {
        self.assert_connected()?;
        validate_short_string("queue", queue)?;
        let BasicGetOptions { no_ack } = options;
        let method = AMQPClass::Basic(protocol::basic::AMQPMethod::Get(protocol::basic::Get {
            queue: queue.into(),
            no_ack,
        }));
        let (promise, resolver) = Promise::new();
        self.method_rpc(method, promise, ExpectedReply(Reply::BasicGetOk(resolver)))
            .await
    }

    pub async fn basic_ack(
        &self,
        delivery_tag: DeliveryTag,
        options: BasicAckOptions,
    ) -> Result<()> {
        self.assert_connected()?;
        let BasicAckOptions { multiple } = options;
        let method = AMQPClass::Basic(protocol::basic::AMQPMethod::Ack(protocol::basic::Ack {
            delivery_tag,
            multiple,
        }));
        self.send_and_forget(method).await?;
        if multiple && delivery_tag == 0 {
            self.consumers.drop_prefetched_messages();
        }
        Ok(())
    }

    pub async fn basic_nack(
        &self,
        delivery_tag: DeliveryTag,
        options: BasicNackOptions,
    ) -> Result<()> {
        self.assert_connected()?;
        let BasicNackOptions { multiple, requeue } = options;
        let method = AMQPClass::Basic(protocol::basic::AMQPMethod::Nack(protocol::basic::Nack {
            delivery_tag,
            multiple,
            requeue,
        }));
        self.send_and_forget(method).await?;
        if multiple && delivery_tag == 0 {
            self.consumers.drop_prefetched_messages();
        }
        Ok(())
    }

    pub async fn basic_reject(
        &self,
        delivery_tag: DeliveryTag,
        options: BasicRejectOptions,
    ) -> Result<()> {
        self.assert_connected()?;
        let BasicRejectOptions { requeue } = options;
        let method = AMQPClass::Basic(protocol::basic::AMQPMethod::Reject(
            protocol::basic::Reject {
                delivery_tag,
                requeue,
            },
        ));
        self.send_and_forget(method).await
    }

    /// RabbitMQ only implements `requeue = true`; recovering without
    /// requeueing is refused here before reaching the wire.
    pub async fn basic_recover(&self, options: BasicRecoverOptions) -> Result<()> {
        self.assert_connected()?;
        if !options.requeue {
            return Err(Error::NotImplementedOnServer("basic_recover without requeue"));
        }
        let BasicRecoverOptions { requeue } = options;
        let method = AMQPClass::Basic(protocol::basic::AMQPMethod::Recover(
            protocol::basic::Recover { requeue },
        ));
        let (promise, resolver) = Promise::new();
        self.method_rpc(method, promise, ExpectedReply(Reply::BasicRecoverOk(resolver)))
            .await
    }

    /// Publish `payload`, fragmenting it to the negotiated frame size.
    ///
    /// With confirms enabled the returned [`PublisherConfirm`] resolves to
    /// the broker's `Ack`/`Nack` for this message; otherwise it resolves
    /// immediately with `NotRequested`.
    pub async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: Vec<u8>,
        properties: BasicProperties,
    ) -> Result<PublisherConfirm> {
        self.assert_connected()?;
        validate_short_string("exchange", exchange)?;
        validate_short_string("routing_key", routing_key)?;
        validate_properties(&properties)?;
        let BasicPublishOptions {
            mandatory,
            immediate,
        } = options;
        let method = AMQPClass::Basic(protocol::basic::AMQPMethod::Publish(
            protocol::basic::Publish {
                exchange: exchange.into(),
                routing_key: routing_key.into(),
                mandatory,
                immediate,
            },
        ));
        let publisher_confirms_result = self.before_basic_publish();
        self.send_method_frame_with_body(method, payload, properties, publisher_confirms_result)
            .await
    }

    /// Enable publisher confirms. Asking twice is an API misuse and fails
    /// locally, the broker would treat it as a soft error.
    pub async fn confirm_select(&self, options: ConfirmSelectOptions) -> Result<()> {
        self.assert_connected()?;
        if self.status.confirm() {
            return Err(Error::ConfirmsAlreadyEnabled);
        }
        let ConfirmSelectOptions { nowait } = options;
        let method = AMQPClass::Confirm(protocol::confirm::AMQPMethod::Select(
            protocol::confirm::Select { nowait },
        ));
        if nowait {
            self.send_and_forget(method).await?;
            self.status.set_confirm();
            return Ok(());
        }
        let (promise, resolver) = Promise::new();
        self.method_rpc(method, promise, ExpectedReply(Reply::ConfirmSelectOk(resolver)))
            .await
    }

    /// Wait until every pending confirm is settled, returning the messages
    /// the broker handed back meanwhile.
    pub async fn wait_for_confirms(&self) -> Result<Vec<BasicReturnMessage>> {
        if let Some(promise) = self.acknowledgements.get_last_pending() {
            trace!("waiting for pending confirms");
            promise.await?;
        } else {
            trace!("no confirms to wait for");
        }
        Ok(self.returned_messages.drain())
    }

    // Internal protocol methods

    fn before_basic_publish(&self) -> Option<PublisherConfirm> {
        if self.status.confirm() {
            let delivery_tag = self.delivery_tag.next();
            Some(self.acknowledgements.register_pending(delivery_tag))
        } else {
            None
        }
    }

    pub(crate) async fn channel_open(&self) -> Result<()> {
        if !self.status.initializing() {
            return Err(Error::InvalidChannelState(self.status.state()));
        }
        self.set_state(ChannelState::Connecting);
        let method =
            AMQPClass::Channel(protocol::channel::AMQPMethod::Open(protocol::channel::Open {}));
        let (promise, resolver) = Promise::new();
        self.method_rpc(method, promise, ExpectedReply(Reply::ChannelOpenOk(resolver)))
            .await
    }

    async fn do_channel_close(
        &self,
        reply_code: ShortUInt,
        reply_text: &str,
        class_id: u16,
        method_id: u16,
    ) -> Result<()> {
        if !self.status.connected() {
            return Err(Error::InvalidChannelState(self.status.state()));
        }
        self.set_state(ChannelState::Closing);
        // a close supersedes whatever request was in flight
        self.frames.clear_expected_replies(
            self.id.get(),
            Error::InvalidChannelState(ChannelState::Closing),
        );
        let method = AMQPClass::Channel(protocol::channel::AMQPMethod::Close(
            protocol::channel::Close {
                reply_code,
                reply_text: reply_text.into(),
                class_id,
                method_id,
            },
        ));
        let (promise, resolver) = Promise::new();
        self.method_rpc(method, promise, ExpectedReply(Reply::ChannelCloseOk(resolver)))
            .await
    }

    pub(crate) async fn channel_close_ok(&self) -> Result<()> {
        let method = AMQPClass::Channel(protocol::channel::AMQPMethod::CloseOk(
            protocol::channel::CloseOk {},
        ));
        self.send_priority_frame(method).await
    }

    async fn channel_flow_ok(&self, options: ChannelFlowOkOptions) -> Result<()> {
        let method = AMQPClass::Channel(protocol::channel::AMQPMethod::FlowOk(
            protocol::channel::FlowOk {
                active: options.active,
            },
        ));
        self.send_priority_frame(method).await
    }

    async fn basic_cancel_ok(&self, consumer_tag: &str) -> Result<()> {
        let method = AMQPClass::Basic(protocol::basic::AMQPMethod::CancelOk(
            protocol::basic::CancelOk {
                consumer_tag: consumer_tag.into(),
            },
        ));
        self.send_priority_frame(method).await
    }

    async fn connection_start_ok(
        &self,
        client_properties: FieldTable,
        mechanism: &str,
        response: &str,
        locale: &str,
        resolver: PromiseResolver<Connection>,
        connection: Connection,
        credentials: Credentials,
    ) -> Result<()> {
        // register the next step before the frame hits the wire so the
        // server's Tune can never race us
        self.connection_status
            .set_connection_step(ConnectionStep::StartOk(resolver, connection, credentials));
        let method = AMQPClass::Connection(protocol::connection::AMQPMethod::StartOk(
            protocol::connection::StartOk {
                client_properties,
                mechanism: mechanism.into(),
                response: response.into(),
                locale: locale.into(),
            },
        ));
        self.send_and_forget(method).await
    }

    async fn connection_secure_ok(&self, response: &str) -> Result<()> {
        let method = AMQPClass::Connection(protocol::connection::AMQPMethod::SecureOk(
            protocol::connection::SecureOk {
                response: response.into(),
            },
        ));
        self.send_and_forget(method).await
    }

    async fn connection_tune_ok(
        &self,
        channel_max: ShortUInt,
        frame_max: LongUInt,
        heartbeat: ShortUInt,
    ) -> Result<()> {
        let method = AMQPClass::Connection(protocol::connection::AMQPMethod::TuneOk(
            protocol::connection::TuneOk {
                channel_max,
                frame_max,
                heartbeat,
            },
        ));
        self.send_and_forget(method).await
    }

    async fn connection_open(
        &self,
        vhost: &str,
        connection: Connection,
        resolver: PromiseResolver<Connection>,
    ) -> Result<()> {
        self.connection_status
            .set_connection_step(ConnectionStep::Open(resolver, connection));
        let method = AMQPClass::Connection(protocol::connection::AMQPMethod::Open(
            protocol::connection::Open {
                virtual_host: vhost.into(),
            },
        ));
        self.send_and_forget(method).await
    }

    pub(crate) async fn connection_close(
        &self,
        reply_code: ShortUInt,
        reply_text: &str,
        class_id: u16,
        method_id: u16,
    ) -> Result<()> {
        let method = AMQPClass::Connection(protocol::connection::AMQPMethod::Close(
            protocol::connection::Close {
                reply_code,
                reply_text: reply_text.into(),
                class_id,
                method_id,
            },
        ));
        self.internal_rpc.set_connection_closing();
        let (promise, resolver) = Promise::new();
        self.method_rpc(method, promise, ExpectedReply(Reply::ConnectionCloseOk(resolver)))
            .await
    }

    pub(crate) async fn connection_close_ok(&self, error: Error) -> Result<()> {
        let method = AMQPClass::Connection(protocol::connection::AMQPMethod::CloseOk(
            protocol::connection::CloseOk {},
        ));
        self.send_priority_frame(method).await?;
        if let Error::ProtocolError(_) = error {
            self.internal_rpc.set_connection_error(error);
        } else {
            self.internal_rpc.set_connection_closed(error);
        }
        Ok(())
    }

    // Inbound dispatch

    pub(crate) fn handle_method(&self, method: AMQPClass) -> Result<()> {
        if self.status.receiving_content() {
            return self.handle_invalid_contents(
                format!(
                    "unexpected method frame on channel {} while receiving content",
                    self.id.get()
                ),
                method.get_amqp_class_id(),
                0,
            );
        }
        match method {
            AMQPClass::Connection(method) => {
                self.assert_channel0(10, 0)?;
                match method {
                    protocol::connection::AMQPMethod::Start(m) => {
                        self.on_connection_start_received(m)
                    }
                    protocol::connection::AMQPMethod::Secure(m) => {
                        self.on_connection_secure_received(m)
                    }
                    protocol::connection::AMQPMethod::Tune(m) => {
                        self.on_connection_tune_received(m)
                    }
                    protocol::connection::AMQPMethod::OpenOk(m) => {
                        self.on_connection_open_ok_received(m)
                    }
                    protocol::connection::AMQPMethod::Close(m) => {
                        self.on_connection_close_received(m)
                    }
                    protocol::connection::AMQPMethod::CloseOk(m) => {
                        self.on_connection_close_ok_received(m)
                    }
                    protocol::connection::AMQPMethod::Blocked(m) => {
                        self.on_connection_blocked_received(m)
                    }
                    protocol::connection::AMQPMethod::Unblocked(m) => {
                        self.on_connection_unblocked_received(m)
                    }
                    m => self.handle_unexpected_frame(
                        format!("unexpected connection method {:?}", m),
                        10,
                        0,
                    ),
                }
            }
            AMQPClass::Channel(method) => match method {
                protocol::channel::AMQPMethod::OpenOk(m) => self.on_channel_open_ok_received(m),
                protocol::channel::AMQPMethod::Flow(m) => self.on_channel_flow_received(m),
                protocol::channel::AMQPMethod::FlowOk(m) => self.on_channel_flow_ok_received(m),
                protocol::channel::AMQPMethod::Close(m) => self.on_channel_close_received(m),
                protocol::channel::AMQPMethod::CloseOk(m) => self.on_channel_close_ok_received(m),
                m => self.handle_unexpected_frame(
                    format!("unexpected channel method {:?}", m),
                    20,
                    0,
                ),
            },
            AMQPClass::Exchange(method) => match method {
                protocol::exchange::AMQPMethod::DeclareOk(m) => {
                    self.on_exchange_declare_ok_received(m)
                }
                protocol::exchange::AMQPMethod::DeleteOk(m) => {
                    self.on_exchange_delete_ok_received(m)
                }
                m => self.handle_unexpected_frame(
                    format!("unexpected exchange method {:?}", m),
                    40,
                    0,
                ),
            },
            AMQPClass::Queue(method) => match method {
                protocol::queue::AMQPMethod::DeclareOk(m) => self.on_queue_declare_ok_received(m),
                protocol::queue::AMQPMethod::BindOk(m) => self.on_queue_bind_ok_received(m),
                protocol::queue::AMQPMethod::UnbindOk(m) => self.on_queue_unbind_ok_received(m),
                protocol::queue::AMQPMethod::PurgeOk(m) => self.on_queue_purge_ok_received(m),
                protocol::queue::AMQPMethod::DeleteOk(m) => self.on_queue_delete_ok_received(m),
                m => self.handle_unexpected_frame(
                    format!("unexpected queue method {:?}", m),
                    50,
                    0,
                ),
            },
            AMQPClass::Basic(method) => match method {
                protocol::basic::AMQPMethod::QosOk(m) => self.on_basic_qos_ok_received(m),
                protocol::basic::AMQPMethod::ConsumeOk(m) => self.on_basic_consume_ok_received(m),
                protocol::basic::AMQPMethod::Cancel(m) => self.on_basic_cancel_received(m),
                protocol::basic::AMQPMethod::CancelOk(m) => self.on_basic_cancel_ok_received(m),
                protocol::basic::AMQPMethod::Deliver(m) => self.on_basic_deliver_received(m),
                protocol::basic::AMQPMethod::GetOk(m) => self.on_basic_get_ok_received(m),
                protocol::basic::AMQPMethod::GetEmpty(m) => self.on_basic_get_empty_received(m),
                protocol::basic::AMQPMethod::Ack(m) => self.on_basic_ack_received(m),
                protocol::basic::AMQPMethod::Nack(m) => self.on_basic_nack_received(m),
                protocol::basic::AMQPMethod::Return(m) => self.on_basic_return_received(m),
                protocol::basic::AMQPMethod::RecoverOk(m) => self.on_basic_recover_ok_received(m),
                m => self.handle_unexpected_frame(
                    format!("unexpected basic method {:?}", m),
                    60,
                    0,
                ),
            },
            AMQPClass::Confirm(method) => match method {
                protocol::confirm::AMQPMethod::SelectOk(m) => {
                    self.on_confirm_select_ok_received(m)
                }
                m => self.handle_unexpected_frame(
                    format!("unexpected confirm method {:?}", m),
                    85,
                    0,
                ),
            },
            m => self.handle_unexpected_frame(
                format!("unexpected method {:?}", m),
                m.get_amqp_class_id(),
                0,
            ),
        }
    }

    /// An out-of-sequence frame inside a content train faults the channel,
    /// which then gets recycled.
    fn handle_invalid_contents(&self, error: String, class_id: u16, method_id: u16) -> Result<()> {
        error!(channel = self.id.get(), class_id, method_id, "{}", error);
        let amqp_error = AMQPError::new(AMQPHardError::UNEXPECTEDFRAME.into(), error.into());
        let error = Error::ProtocolError(amqp_error.clone());
        self.internal_rpc.recycle_channel(
            amqp_error.get_id(),
            amqp_error.get_message().clone(),
            error.clone(),
        );
        Err(error)
    }

    /// A frame we can't map to any pending operation faults the connection.
    fn handle_unexpected_frame(&self, error: String, class_id: u16, method_id: u16) -> Result<()> {
        error!(channel = self.id.get(), "{}", error);
        let error = AMQPError::new(AMQPHardError::UNEXPECTEDFRAME.into(), error.into());
        self.internal_rpc.close_connection(
            error.get_id(),
            error.get_message().to_string(),
            class_id,
            method_id,
        );
        Err(Error::ProtocolError(error))
    }

    pub(crate) fn handle_content_header_frame(
        &self,
        class_id: u16,
        size: u64,
        properties: BasicProperties,
    ) -> Result<()> {
        match self.status.set_content_length(class_id, size as usize) {
            Ok((cause, complete)) => {
                match &cause {
                    DeliveryCause::Consume(consumer_tag) => {
                        if let Some(consumer) = self.consumers.get(consumer_tag.as_str()) {
                            consumer.set_delivery_properties(properties);
                        }
                    }
                    DeliveryCause::Get => {
                        if let Some((_, message)) = self.pending_basic_get.lock().as_mut() {
                            message.delivery.properties = properties;
                        }
                    }
                    DeliveryCause::Return => {
                        self.returned_messages.set_delivery_properties(properties);
                    }
                }
                if complete {
                    self.new_delivery_complete(cause);
                }
                Ok(())
            }
            Err(error) => self.handle_invalid_contents(error, class_id, 0),
        }
    }

    pub(crate) fn handle_body_frame(&self, payload: Vec<u8>) -> Result<()> {
        match self.status.receive(payload.len()) {
            Ok((cause, remaining)) => {
                match &cause {
                    DeliveryCause::Consume(consumer_tag) => {
                        if let Some(consumer) = self.consumers.get(consumer_tag.as_str()) {
                            consumer.receive_delivery_content(payload);
                        }
                    }
                    DeliveryCause::Get => {
                        if let Some((_, message)) = self.pending_basic_get.lock().as_mut() {
                            message.delivery.receive_content(payload);
                        }
                    }
                    DeliveryCause::Return => {
                        self.returned_messages.receive_delivery_content(payload);
                    }
                }
                if remaining == 0 {
                    self.new_delivery_complete(cause);
                }
                Ok(())
            }
            Err(error) => self.handle_invalid_contents(error, 0, 0),
        }
    }

    fn new_delivery_complete(&self, cause: DeliveryCause) {
        match cause {
            DeliveryCause::Consume(consumer_tag) => {
                if let Some(consumer) = self.consumers.get(consumer_tag.as_str()) {
                    consumer.new_delivery_complete();
                } else {
                    info!(consumer_tag = %consumer_tag, "dropping delivery for unknown consumer");
                }
            }
            DeliveryCause::Get => {
                if let Some((resolver, message)) = self.pending_basic_get.lock().take() {
                    resolver.swear(Ok(Some(message)));
                }
            }
            DeliveryCause::Return => {
                self.returned_messages
                    .new_delivery_complete(self.status.confirm());
            }
        }
    }

    fn acknowledgement_error(&self, error: AMQPError, class_id: u16, method_id: u16) -> Result<()> {
        error!("got a bad acknowledgement from the server, closing channel");
        let channel = self.clone();
        let err = error.clone();
        self.internal_rpc.register_internal_future(async move {
            channel
                .do_channel_close(
                    error.get_id(),
                    error.get_message().as_str(),
                    class_id,
                    method_id,
                )
                .await
        });
        Err(Error::ProtocolError(err))
    }

    fn invalid_connection_state(&self, state: ConnectionState) -> Result<()> {
        error!(?state, "invalid connection state");
        let error = Error::InvalidConnectionState(state);
        self.internal_rpc.set_connection_error(error.clone());
        Err(error)
    }

    // Connection method handlers (channel 0)

    fn on_connection_start_received(&self, method: protocol::connection::Start) -> Result<()> {
        trace!(?method, "server sent Connection::Start");
        let state = self.connection_status.state();
        if let (
            ConnectionState::Connecting,
            Some(ConnectionStep::ProtocolHeader(
                resolver,
                connection,
                credentials,
                mechanism,
                mut options,
            )),
        ) = (state, self.connection_status.connection_step())
        {
            let mechanism_str = mechanism.to_string();
            let locale = options.locale.clone();

            if !method
                .mechanisms
                .to_string()
                .split_whitespace()
                .any(|m| m == mechanism_str)
            {
                error!(mechanism = %mechanism_str, "unsupported mechanism");
                let error = Error::ProtocolError(AMQPError::new(
                    AMQPHardError::NOTIMPLEMENTED.into(),
                    format!("unsupported mechanism: {}", mechanism_str).into(),
                ));
                resolver.swear(Err(error.clone()));
                self.internal_rpc.set_connection_error(error.clone());
                return Err(error);
            }
            if !method
                .locales
                .to_string()
                .split_whitespace()
                .any(|l| l == locale)
            {
                error!(%locale, "unsupported locale");
                let error = Error::ProtocolError(AMQPError::new(
                    AMQPHardError::NOTIMPLEMENTED.into(),
                    format!("unsupported locale: {}", locale).into(),
                ));
                resolver.swear(Err(error.clone()));
                self.internal_rpc.set_connection_error(error.clone());
                return Err(error);
            }

            if !options.client_properties.contains_key("product")
                || !options.client_properties.contains_key("version")
            {
                options.client_properties.insert(
                    "product".into(),
                    AMQPValue::LongString(env!("CARGO_PKG_NAME").into()),
                );
                options.client_properties.insert(
                    "version".into(),
                    AMQPValue::LongString(env!("CARGO_PKG_VERSION").into()),
                );
            }

            options
                .client_properties
                .insert("platform".into(), AMQPValue::LongString("rust".into()));

            let mut capabilities = FieldTable::default();
            capabilities.insert("publisher_confirms".into(), true.into());
            capabilities.insert("exchange_exchange_bindings".into(), true.into());
            capabilities.insert("basic.nack".into(), true.into());
            capabilities.insert("consumer_cancel_notify".into(), true.into());
            capabilities.insert("connection.blocked".into(), true.into());
            capabilities.insert("authentication_failure_close".into(), true.into());

            options
                .client_properties
                .insert("capabilities".into(), AMQPValue::FieldTable(capabilities));

            let channel = self.clone();
            self.internal_rpc.register_internal_future(async move {
                channel
                    .connection_start_ok(
                        options.client_properties,
                        &mechanism_str,
                        &credentials.sasl_auth_string(mechanism),
                        &locale,
                        resolver,
                        connection,
                        credentials,
                    )
                    .await
            });
            Ok(())
        } else {
            self.invalid_connection_state(state)
        }
    }

    fn on_connection_secure_received(&self, method: protocol::connection::Secure) -> Result<()> {
        trace!(?method, "server sent Connection::Secure");
        let state = self.connection_status.state();
        if let (
            ConnectionState::Connecting,
            Some(ConnectionStep::StartOk(resolver, connection, credentials)),
        ) = (state, self.connection_status.connection_step())
        {
            let answer = credentials.rabbit_cr_demo_answer();
            self.connection_status
                .set_connection_step(ConnectionStep::StartOk(resolver, connection, credentials));
            let channel = self.clone();
            self.internal_rpc
                .register_internal_future(
                    async move { channel.connection_secure_ok(&answer).await },
                );
            Ok(())
        } else {
            self.invalid_connection_state(state)
        }
    }

    /// Settle the tune values the server proposed against what we asked
    /// for. Channel-max and frame-max left unlimited on both sides fall
    /// back to the largest representable value.
    fn apply_connection_tuning(&self, method: &protocol::connection::Tune) {
        self.configuration.set_heartbeat(negotiated_value(
            self.configuration.heartbeat(),
            method.heartbeat,
        ));

        let channel_max = negotiated_value(self.configuration.channel_max(), method.channel_max);
        self.configuration.set_channel_max(if channel_max == 0 {
            u16::max_value()
        } else {
            channel_max
        });

        let frame_max = negotiated_value(self.configuration.frame_max(), method.frame_max);
        self.configuration.set_frame_max(if frame_max == 0 {
            u32::max_value()
        } else {
            frame_max
        });
    }

    fn on_connection_tune_received(&self, method: protocol::connection::Tune) -> Result<()> {
        debug!(?method, "server sent Connection::Tune");
        let state = self.connection_status.state();
        if let (ConnectionState::Connecting, Some(ConnectionStep::StartOk(resolver, connection, _))) =
            (state, self.connection_status.connection_step())
        {
            self.apply_connection_tuning(&method);

            let channel = self.clone();
            let configuration = self.configuration.clone();
            let vhost = self.connection_status.vhost();
            self.internal_rpc.register_internal_future(async move {
                channel
                    .connection_tune_ok(
                        configuration.channel_max(),
                        configuration.frame_max(),
                        configuration.heartbeat(),
                    )
                    .await?;
                channel.connection_open(&vhost, connection, resolver).await
            });
            Ok(())
        } else {
            self.invalid_connection_state(state)
        }
    }

    fn on_connection_open_ok_received(&self, _: protocol::connection::OpenOk) -> Result<()> {
        let state = self.connection_status.state();
        if let (ConnectionState::Connecting, Some(ConnectionStep::Open(resolver, connection))) =
            (state, self.connection_status.connection_step())
        {
            self.connection_status.set_state(ConnectionState::Connected);
            // connect only completes once the application channel is open
            self.internal_rpc.open_app_channel(resolver, connection);
            Ok(())
        } else {
            self.invalid_connection_state(state)
        }
    }

    fn on_connection_close_received(&self, method: protocol::connection::Close) -> Result<()> {
        let error = AMQPError::try_from(method.clone())
            .map(|error| {
                error!(
                    channel = self.id.get(),
                    class_id = method.class_id,
                    method_id = method.method_id,
                    ?error,
                    "connection closed by the server: {}",
                    method.reply_text
                );
                Error::ProtocolError(error)
            })
            .unwrap_or_else(|error| {
                error!("{}", error);
                info!(channel = self.id.get(), ?method, "connection closed");
                Error::InvalidConnectionState(ConnectionState::Closed)
            });
        self.internal_rpc.set_connection_closing();
        self.frames.drop_pending(error.clone());
        if let Some(resolver) = self.connection_status.connection_resolver() {
            resolver.swear(Err(error.clone()));
        }
        self.internal_rpc.send_connection_close_ok(error);
        Ok(())
    }

    fn on_connection_close_ok_received(&self, _: protocol::connection::CloseOk) -> Result<()> {
        if let Some(Reply::ConnectionCloseOk(resolver)) = self.frames.next_expected_reply(0) {
            resolver.swear(Ok(()));
        }
        self.internal_rpc
            .set_connection_closed(Error::InvalidConnectionState(ConnectionState::Closed));
        Ok(())
    }

    fn on_connection_blocked_received(&self, method: protocol::connection::Blocked) -> Result<()> {
        info!(reason = %method.reason, "connection blocked by the server");
        self.connection_status.block();
        Ok(())
    }

    fn on_connection_unblocked_received(
        &self,
        _method: protocol::connection::Unblocked,
    ) -> Result<()> {
        self.connection_status.unblock();
        self.wake();
        Ok(())
    }

    // Channel method handlers

    fn on_channel_open_ok_received(&self, _method: protocol::channel::OpenOk) -> Result<()> {
        match self.frames.next_expected_reply(self.id.get()) {
            Some(Reply::ChannelOpenOk(resolver)) => {
                self.set_state(ChannelState::Connected);
                resolver.swear(Ok(()));
                Ok(())
            }
            _ => self.handle_unexpected_frame(
                format!(
                    "unexpected channel open-ok received on channel {}",
                    self.id.get()
                ),
                20,
                11,
            ),
        }
    }

    fn on_channel_flow_received(&self, method: protocol::channel::Flow) -> Result<()> {
        let active = method.active;
        self.status.set_send_flow(active);
        let channel = self.clone();
        self.internal_rpc.register_internal_future(async move {
            channel
                .channel_flow_ok(ChannelFlowOkOptions { active })
                .await
        });
        if active {
            // publishes were gated, get them flowing again
            self.wake();
        }
        Ok(())
    }

    fn on_channel_flow_ok_received(&self, method: protocol::channel::FlowOk) -> Result<()> {
        // we never initiate a flow change, the server just confirmed the
        // state it asked for
        trace!(?method, "channel flow-ok");
        Ok(())
    }

    fn on_channel_close_received(&self, method: protocol::channel::Close) -> Result<()> {
        let error = AMQPError::try_from(method.clone())
            .map(|error| {
                error!(
                    channel = self.id.get(),
                    class_id = method.class_id,
                    method_id = method.method_id,
                    ?error,
                    "channel closed by the server: {}",
                    method.reply_text
                );
                Error::ProtocolError(error)
            })
            .unwrap_or_else(|error| {
                error!("{}", error);
                info!(channel = self.id.get(), ?method, "channel closed");
                Error::InvalidChannelState(ChannelState::Closing)
            });
        self.set_state(ChannelState::Closing);
        let channel = self.clone();
        let internal_rpc = self.internal_rpc.clone();
        self.internal_rpc.register_internal_future(async move {
            channel.channel_close_ok().await?;
            internal_rpc.recycle_channel(method.reply_code, method.reply_text, error);
            Ok(())
        });
        Ok(())
    }

    fn on_channel_close_ok_received(&self, _: protocol::channel::CloseOk) -> Result<()> {
        match self.frames.next_expected_reply(self.id.get()) {
            Some(Reply::ChannelCloseOk(resolver)) => {
                self.set_closed(Error::InvalidChannelState(ChannelState::Closed));
                resolver.swear(Ok(()));
                Ok(())
            }
            _ => self.handle_unexpected_frame(
                format!(
                    "unexpected channel close-ok received on channel {}",
                    self.id.get()
                ),
                20,
                41,
            ),
        }
    }

    /// Invoked by the channels registry when the broker killed the channel
    pub(crate) fn on_recycled(&self, reply_code: ShortUInt, reply_text: ShortString) {
        self.close_handler.on_closed(reply_code, reply_text);
    }

    // Exchange and queue method handlers

    fn on_exchange_declare_ok_received(&self, method: protocol::exchange::DeclareOk) -> Result<()> {
        match self.frames.next_expected_reply(self.id.get()) {
            Some(Reply::ExchangeDeclareOk(resolver)) => {
                resolver.swear(Ok(()));
                Ok(())
            }
            _ => self.handle_unexpected_frame(
                format!(
                    "unexpected exchange declare-ok received on channel {}",
                    self.id.get()
                ),
                method.get_amqp_class_id(),
                method.get_amqp_method_id(),
            ),
        }
    }

    fn on_exchange_delete_ok_received(&self, method: protocol::exchange::DeleteOk) -> Result<()> {
        match self.frames.next_expected_reply(self.id.get()) {
            Some(Reply::ExchangeDeleteOk(resolver)) => {
                resolver.swear(Ok(()));
                Ok(())
            }
            _ => self.handle_unexpected_frame(
                format!(
                    "unexpected exchange delete-ok received on channel {}",
                    self.id.get()
                ),
                method.get_amqp_class_id(),
                method.get_amqp_method_id(),
            ),
        }
    }

    fn on_queue_declare_ok_received(&self, method: protocol::queue::DeclareOk) -> Result<()> {
        match self.frames.next_expected_reply(self.id.get()) {
            Some(Reply::QueueDeclareOk(resolver)) => {
                resolver.swear(Ok(Queue::new(
                    method.queue,
                    method.message_count,
                    method.consumer_count,
                )));
                Ok(())
            }
            _ => self.handle_unexpected_frame(
                format!(
                    "unexpected queue declare-ok received on channel {}",
                    self.id.get()
                ),
                method.get_amqp_class_id(),
                method.get_amqp_method_id(),
            ),
        }
    }

    fn on_queue_bind_ok_received(&self, method: protocol::queue::BindOk) -> Result<()> {
        match self.frames.next_expected_reply(self.id.get()) {
            Some(Reply::QueueBindOk(resolver)) => {
                resolver.swear(Ok(()));
                Ok(())
            }
            _ => self.handle_unexpected_frame(
                format!(
                    "unexpected queue bind-ok received on channel {}",
                    self.id.get()
                ),
                method.get_amqp_class_id(),
                method.get_amqp_method_id(),
            ),
        }
    }

    fn on_queue_unbind_ok_received(&self, method: protocol::queue::UnbindOk) -> Result<()> {
        match self.frames.next_expected_reply(self.id.get()) {
            Some(Reply::QueueUnbindOk(resolver)) => {
                resolver.swear(Ok(()));
                Ok(())
            }
            _ => self.handle_unexpected_frame(
                format!(
                    "unexpected queue unbind-ok received on channel {}",
                    self.id.get()
                ),
                method.get_amqp_class_id(),
                method.get_amqp_method_id(),
            ),
        }
    }

    fn on_queue_purge_ok_received(&self, method: protocol::queue::PurgeOk) -> Result<()> {
        match self.frames.next_expected_reply(self.id.get()) {
            Some(Reply::QueuePurgeOk(resolver)) => {
                resolver.swear(Ok(method.message_count));
                Ok(())
            }
            _ => self.handle_unexpected_frame(
                format!(
                    "unexpected queue purge-ok received on channel {}",
                    self.id.get()
                ),
                method.get_amqp_class_id(),
                method.get_amqp_method_id(),
            ),
        }
    }

    fn on_queue_delete_ok_received(&self, method: protocol::queue::DeleteOk) -> Result<()> {
        match self.frames.next_expected_reply(self.id.get()) {
            Some(Reply::QueueDeleteOk(resolver)) => {
                resolver.swear(Ok(method.message_count));
                Ok(())
            }
            _ => self.handle_unexpected_frame(
                format!(
                    "unexpected queue delete-ok received on channel {}",
                    self.id.get()
                ),
                method.get_amqp_class_id(),
                method.get_amqp_method_id(),
            ),
        }
    }

    // Basic method handlers

    fn on_basic_qos_ok_received(&self, method: protocol::basic::QosOk) -> Result<()> {
        match self.frames.next_expected_reply(self.id.get()) {
            Some(Reply::BasicQosOk(resolver)) => {
                resolver.swear(Ok(()));
                Ok(())
            }
            _ => self.handle_unexpected_frame(
                format!(
                    "unexpected basic qos-ok received on channel {}",
                    self.id.get()
                ),
                method.get_amqp_class_id(),
                method.get_amqp_method_id(),
            ),
        }
    }

    fn on_basic_consume_ok_received(&self, method: protocol::basic::ConsumeOk) -> Result<()> {
        match self.frames.next_expected_reply(self.id.get()) {
            Some(Reply::BasicConsumeOk(resolver)) => {
                let consumer = Consumer::new(method.consumer_tag.clone(), self.executor.clone());
                self.consumers
                    .register(method.consumer_tag, consumer.clone());
                resolver.swear(Ok(consumer));
                Ok(())
            }
            _ => self.handle_unexpected_frame(
                format!(
                    "unexpected basic consume-ok received on channel {}",
                    self.id.get()
                ),
                method.get_amqp_class_id(),
                method.get_amqp_method_id(),
            ),
        }
    }

    fn on_basic_cancel_received(&self, method: protocol::basic::Cancel) -> Result<()> {
        self.consumers.deregister(method.consumer_tag.as_str());
        if !method.nowait {
            let channel = self.clone();
            self.internal_rpc.register_internal_future(async move {
                channel.basic_cancel_ok(method.consumer_tag.as_str()).await
            });
        }
        Ok(())
    }

    fn on_basic_cancel_ok_received(&self, method: protocol::basic::CancelOk) -> Result<()> {
        self.consumers.deregister(method.consumer_tag.as_str());
        match self.frames.next_expected_reply(self.id.get()) {
            Some(Reply::BasicCancelOk(resolver)) => {
                resolver.swear(Ok(()));
                Ok(())
            }
            _ => self.handle_unexpected_frame(
                format!(
                    "unexpected basic cancel-ok received on channel {}",
                    self.id.get()
                ),
                method.get_amqp_class_id(),
                method.get_amqp_method_id(),
            ),
        }
    }

    fn on_basic_deliver_received(&self, method: protocol::basic::Deliver) -> Result<()> {
        let class_id = method.get_amqp_class_id();
        if let Some(consumer) = self.consumers.get(method.consumer_tag.as_str()) {
            consumer.start_new_delivery(Delivery::new(
                method.delivery_tag,
                method.exchange,
                method.routing_key,
                method.redelivered,
            ));
        } else {
            info!(consumer_tag = %method.consumer_tag, "delivery for unknown consumer");
        }
        self.status
            .set_will_receive(class_id, DeliveryCause::Consume(method.consumer_tag));
        Ok(())
    }

    fn on_basic_get_ok_received(&self, method: protocol::basic::GetOk) -> Result<()> {
        let class_id = method.get_amqp_class_id();
        match self.frames.next_expected_reply(self.id.get()) {
            Some(Reply::BasicGetOk(resolver)) => {
                *self.pending_basic_get.lock() = Some((
                    resolver,
                    BasicGetMessage::new(
                        method.delivery_tag,
                        method.exchange,
                        method.routing_key,
                        method.redelivered,
                        method.message_count,
                    ),
                ));
                self.status.set_will_receive(class_id, DeliveryCause::Get);
                Ok(())
            }
            _ => self.handle_unexpected_frame(
                format!(
                    "unexpected basic get-ok received on channel {}",
                    self.id.get()
                ),
                class_id,
                method.get_amqp_method_id(),
            ),
        }
    }

    fn on_basic_get_empty_received(&self, method: protocol::basic::GetEmpty) -> Result<()> {
        match self.frames.next_expected_reply(self.id.get()) {
            Some(Reply::BasicGetOk(resolver)) => {
                resolver.swear(Ok(None));
                Ok(())
            }
            _ => self.handle_unexpected_frame(
                format!(
                    "unexpected basic get-empty received on channel {}",
                    self.id.get()
                ),
                method.get_amqp_class_id(),
                method.get_amqp_method_id(),
            ),
        }
    }

    fn on_basic_ack_received(&self, method: protocol::basic::Ack) -> Result<()> {
        if self.status.confirm() {
            if method.multiple {
                if method.delivery_tag > 0 {
                    self.acknowledgements
                        .ack_all_before(method.delivery_tag)
                        .or_else(|err| {
                            self.acknowledgement_error(
                                err,
                                method.get_amqp_class_id(),
                                method.get_amqp_method_id(),
                            )
                        })?;
                } else {
                    self.acknowledgements.ack_all_pending();
                }
            } else {
                self.acknowledgements
                    .ack(method.delivery_tag)
                    .or_else(|err| {
                        self.acknowledgement_error(
                            err,
                            method.get_amqp_class_id(),
                            method.get_amqp_method_id(),
                        )
                    })?;
            }
        }
        Ok(())
    }

    fn on_basic_nack_received(&self, method: protocol::basic::Nack) -> Result<()> {
        if self.status.confirm() {
            if method.multiple {
                if method.delivery_tag > 0 {
                    self.acknowledgements
                        .nack_all_before(method.delivery_tag)
                        .or_else(|err| {
                            self.acknowledgement_error(
                                err,
                                method.get_amqp_class_id(),
                                method.get_amqp_method_id(),
                            )
                        })?;
                } else {
                    self.acknowledgements.nack_all_pending();
                }
            } else {
                self.acknowledgements
                    .nack(method.delivery_tag)
                    .or_else(|err| {
                        self.acknowledgement_error(
                            err,
                            method.get_amqp_class_id(),
                            method.get_amqp_method_id(),
                        )
                    })?;
            }
        }
        Ok(())
    }

    fn on_basic_return_received(&self, method: protocol::basic::Return) -> Result<()> {
        let class_id = method.get_amqp_class_id();
        self.returned_messages
            .start_new_delivery(BasicReturnMessage::new(
                method.exchange,
                method.routing_key,
                method.reply_code,
                method.reply_text,
            ));
        self.status.set_will_receive(class_id, DeliveryCause::Return);
        Ok(())
    }

    fn on_basic_recover_ok_received(&self, method: protocol::basic::RecoverOk) -> Result<()> {
        self.consumers.drop_prefetched_messages();
        match self.frames.next_expected_reply(self.id.get()) {
            Some(Reply::BasicRecoverOk(resolver)) => {
                resolver.swear(Ok(()));
                Ok(())
            }
            _ => self.handle_unexpected_frame(
                format!(
                    "unexpected basic recover-ok received on channel {}",
                    self.id.get()
                ),
                method.get_amqp_class_id(),
                method.get_amqp_method_id(),
            ),
        }
    }

    fn on_confirm_select_ok_received(&self, method: protocol::confirm::SelectOk) -> Result<()> {
        match self.frames.next_expected_reply(self.id.get()) {
            Some(Reply::ConfirmSelectOk(resolver)) => {
                self.status.set_confirm();
                resolver.swear(Ok(()));
                Ok(())
            }
            _ => self.handle_unexpected_frame(
                format!(
                    "unexpected confirm select-ok received on channel {}",
                    self.id.get()
                ),
                method.get_amqp_class_id(),
                method.get_amqp_method_id(),
            ),
        }
    }
}

/// Every tune field follows the same rule: 0 defers to the other side,
/// two concrete requests settle on the smaller one.
fn negotiated_value<T: Copy + Ord + Default>(ours: T, theirs: T) -> T {
    if ours == T::default() {
        theirs
    } else if theirs == T::default() {
        ours
    } else {
        ours.min(theirs)
    }
}

fn validate_short_string(what: &'static str, value: &str) -> Result<()> {
    if value.len() > 255 {
        Err(Error::InvalidArgument(format!(
            "{} must be at most 255 bytes, got {}",
            what,
            value.len()
        )))
    } else {
        Ok(())
    }
}

fn validate_property_string(what: &'static str, value: Option<&ShortString>) -> Result<()> {
    if let Some(value) = value {
        validate_short_string(what, value.as_str())?;
    }
    Ok(())
}

fn validate_properties(properties: &BasicProperties) -> Result<()> {
    if let Some(delivery_mode) = properties.delivery_mode() {
        if !(1..=2).contains(delivery_mode) {
            return Err(Error::InvalidValue(format!(
                "delivery_mode must be 1 or 2, got {}",
                delivery_mode
            )));
        }
    }
    if let Some(priority) = properties.priority() {
        if *priority > 9 {
            return Err(Error::InvalidValue(format!(
                "priority must be between 0 and 9, got {}",
                priority
            )));
        }
    }
    validate_property_string("content_type", properties.content_type().as_ref())?;
    validate_property_string("content_encoding", properties.content_encoding().as_ref())?;
    validate_property_string("correlation_id", properties.correlation_id().as_ref())?;
    validate_property_string("reply_to", properties.reply_to().as_ref())?;
    validate_property_string("expiration", properties.expiration().as_ref())?;
    validate_property_string("message_id", properties.message_id().as_ref())?;
    validate_property_string("type", properties.kind().as_ref())?;
    validate_property_string("user_id", properties.user_id().as_ref())?;
    validate_property_string("app_id", properties.app_id().as_ref())?;
    validate_property_string("cluster_id", properties.cluster_id().as_ref())?;
    Ok(())
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id.get())
            .field("configuration", &self.configuration)
            .field("status", &self.status)
            .field("connection_status", &self.connection_status)
            .field("acknowledgements", &self.acknowledgements)
            .field("consumers", &self.consumers)
            .field("returned_messages", &self.returned_messages)
            .field("frames", &self.frames)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal_rpc::InternalRPC;
    use crate::socket_state::SocketState;
    use crate::Confirmation;
    use async_global_executor_trait::AsyncGlobalExecutor;
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    fn test_channel() -> Channel {
        let socket_state = SocketState::default();
        let waker = socket_state.handle();
        let executor: Arc<dyn FullExecutor + Send + Sync> = Arc::new(AsyncGlobalExecutor);
        let internal_rpc = InternalRPC::new(executor.clone(), waker.clone());
        let configuration = Configuration::default();
        configuration.set_channel_max(2047);
        configuration.set_frame_max(8192);
        let connection_status = ConnectionStatus::default();
        connection_status.set_state(ConnectionState::Connected);
        let channel = Channel::new(
            1,
            configuration,
            connection_status,
            waker,
            internal_rpc.handle(),
            Frames::default(),
            executor,
        );
        channel.set_state(ChannelState::Connected);
        channel
    }

    fn poll_future<T>(future: &mut Pin<Box<dyn Future<Output = T> + Send + '_>>) -> Poll<T> {
        let waker = waker_fn::waker_fn(|| {});
        let mut cx = Context::from_waker(&waker);
        future.as_mut().poll(&mut cx)
    }

    /// Stand in for the io loop: pop queued frames, resolving their senders
    fn drain_frames(channel: &Channel) -> Vec<AMQPFrame> {
        std::iter::from_fn(|| channel.frames.pop(true))
            .map(|(frame, resolver)| {
                if let Some(resolver) = resolver {
                    resolver.swear(Ok(()));
                }
                frame
            })
            .collect()
    }

    fn body_frames(frames: &[AMQPFrame]) -> usize {
        frames
            .iter()
            .filter(|frame| matches!(frame, AMQPFrame::Body(..)))
            .count()
    }

    #[test]
    fn tune_values_settle_on_the_smaller_side_and_zero_defers() {
        assert_eq!(negotiated_value(0u16, 2047), 2047);
        assert_eq!(negotiated_value(512u16, 0), 512);
        assert_eq!(negotiated_value(60u16, 30), 30);
        assert_eq!(negotiated_value(30u16, 60), 30);
        assert_eq!(negotiated_value(0u32, 0), 0);

        let channel = test_channel();
        channel.configuration.set_channel_max(0);
        channel.configuration.set_frame_max(0);
        channel.configuration.set_heartbeat(0);
        channel.apply_connection_tuning(&protocol::connection::Tune {
            channel_max: 0,
            frame_max: 0,
            heartbeat: 0,
        });
        // unlimited on both sides means "as much as the types allow"
        assert_eq!(channel.configuration.channel_max(), u16::max_value());
        assert_eq!(channel.configuration.frame_max(), u32::max_value());
        assert_eq!(channel.configuration.heartbeat(), 0);
    }

    #[test]
    fn nonzero_prefetch_size_is_refused_locally() {
        let channel = test_channel();
        let mut fut: Pin<Box<dyn Future<Output = _> + Send + '_>> = Box::pin(channel.basic_qos(
            0,
            BasicQosOptions {
                prefetch_size: 1024,
                global: true,
            },
        ));
        assert!(matches!(
            poll_future(&mut fut),
            Poll::Ready(Err(Error::NotImplementedOnServer(_)))
        ));
        assert!(drain_frames(&channel).is_empty());
    }

    #[test]
    fn recover_without_requeue_is_refused_locally() {
        let channel = test_channel();
        let mut fut: Pin<Box<dyn Future<Output = _> + Send + '_>> =
            Box::pin(channel.basic_recover(BasicRecoverOptions { requeue: false }));
        assert!(matches!(
            poll_future(&mut fut),
            Poll::Ready(Err(Error::NotImplementedOnServer(_)))
        ));
        assert!(drain_frames(&channel).is_empty());
    }

    #[test]
    fn out_of_range_delivery_mode_and_priority_are_refused() {
        let channel = test_channel();
        for properties in [
            BasicProperties::default().with_delivery_mode(3),
            BasicProperties::default().with_delivery_mode(0),
            BasicProperties::default().with_priority(10),
        ] {
            let mut fut: Pin<Box<dyn Future<Output = _> + Send + '_>> = Box::pin(
                channel.basic_publish(
                    "",
                    "rk",
                    BasicPublishOptions::default(),
                    b"payload".to_vec(),
                    properties,
                ),
            );
            assert!(matches!(
                poll_future(&mut fut),
                Poll::Ready(Err(Error::InvalidValue(_)))
            ));
        }
        assert!(drain_frames(&channel).is_empty());
    }

    #[test]
    fn overlong_short_strings_are_refused() {
        let channel = test_channel();
        let long = "x".repeat(256);
        let mut fut: Pin<Box<dyn Future<Output = _> + Send + '_>> = Box::pin(channel.basic_publish(
            &long,
            "rk",
            BasicPublishOptions::default(),
            b"payload".to_vec(),
            BasicProperties::default(),
        ));
        assert!(matches!(
            poll_future(&mut fut),
            Poll::Ready(Err(Error::InvalidArgument(_)))
        ));
        let mut fut: Pin<Box<dyn Future<Output = _> + Send + '_>> = Box::pin(channel.basic_publish(
            "",
            "rk",
            BasicPublishOptions::default(),
            b"payload".to_vec(),
            BasicProperties::default().with_app_id(long.as_str().into()),
        ));
        assert!(matches!(
            poll_future(&mut fut),
            Poll::Ready(Err(Error::InvalidArgument(_)))
        ));
        assert!(drain_frames(&channel).is_empty());
    }

    #[test]
    fn methods_require_a_connected_channel() {
        let channel = test_channel();
        channel.set_state(ChannelState::Closed);
        let mut fut: Pin<Box<dyn Future<Output = _> + Send + '_>> = Box::pin(channel.queue_declare(
            "q1",
            QueueDeclareOptions::default(),
            FieldTable::default(),
        ));
        assert!(matches!(
            poll_future(&mut fut),
            Poll::Ready(Err(Error::InvalidChannelState(ChannelState::Closed)))
        ));
    }

    #[test]
    fn queue_declare_round_trip() {
        let channel = test_channel();
        let mut fut: Pin<Box<dyn Future<Output = _> + Send + '_>> = Box::pin(channel.queue_declare(
            "q1",
            QueueDeclareOptions::default(),
            FieldTable::default(),
        ));
        assert!(poll_future(&mut fut).is_pending());
        let sent = drain_frames(&channel);
        assert!(matches!(
            &sent[..],
            [AMQPFrame::Method(1, AMQPClass::Queue(protocol::queue::AMQPMethod::Declare(_)))]
        ));
        assert!(poll_future(&mut fut).is_pending());
        channel
            .handle_method(AMQPClass::Queue(protocol::queue::AMQPMethod::DeclareOk(
                protocol::queue::DeclareOk {
                    queue: "q1".into(),
                    message_count: 3,
                    consumer_count: 1,
                },
            )))
            .unwrap();
        match poll_future(&mut fut) {
            Poll::Ready(Ok(queue)) => {
                assert_eq!(queue.name().as_str(), "q1");
                assert_eq!(queue.message_count(), 3);
                assert_eq!(queue.consumer_count(), 1);
            }
            other => panic!("queue_declare did not resolve: pending={}", other.is_pending()),
        }
    }

    #[test]
    fn a_second_synchronous_method_is_refused_while_one_is_pending() {
        let channel = test_channel();
        let mut first: Pin<Box<dyn Future<Output = _> + Send + '_>> = Box::pin(
            channel.queue_declare("q1", QueueDeclareOptions::default(), FieldTable::default()),
        );
        assert!(poll_future(&mut first).is_pending());
        drain_frames(&channel);

        let mut second: Pin<Box<dyn Future<Output = _> + Send + '_>> =
            Box::pin(channel.queue_purge("q1", QueuePurgeOptions::default()));
        assert!(matches!(
            poll_future(&mut second),
            Poll::Ready(Err(Error::SyncMethodPending))
        ));

        // dropping the first caller does not free the in-flight slot
        drop(first);
        let mut third: Pin<Box<dyn Future<Output = _> + Send + '_>> =
            Box::pin(channel.queue_purge("q1", QueuePurgeOptions::default()));
        assert!(matches!(
            poll_future(&mut third),
            Poll::Ready(Err(Error::SyncMethodPending))
        ));

        // the slot frees once the reply arrives, even with nobody waiting
        channel
            .handle_method(AMQPClass::Queue(protocol::queue::AMQPMethod::DeclareOk(
                protocol::queue::DeclareOk {
                    queue: "q1".into(),
                    message_count: 0,
                    consumer_count: 0,
                },
            )))
            .unwrap();
        let mut fourth: Pin<Box<dyn Future<Output = _> + Send + '_>> =
            Box::pin(channel.queue_purge("q1", QueuePurgeOptions::default()));
        assert!(poll_future(&mut fourth).is_pending());
    }

    #[test]
    fn basic_get_resolves_none_on_empty_queue() {
        let channel = test_channel();
        let mut fut: Pin<Box<dyn Future<Output = _> + Send + '_>> =
            Box::pin(channel.basic_get("q1", BasicGetOptions::default()));
        assert!(poll_future(&mut fut).is_pending());
        drain_frames(&channel);
        channel
            .handle_method(AMQPClass::Basic(protocol::basic::AMQPMethod::GetEmpty(
                protocol::basic::GetEmpty {},
            )))
            .unwrap();
        assert!(matches!(poll_future(&mut fut), Poll::Ready(Ok(None))));
    }

    #[test]
    fn basic_get_assembles_the_message() {
        let channel = test_channel();
        let mut fut: Pin<Box<dyn Future<Output = _> + Send + '_>> =
            Box::pin(channel.basic_get("q1", BasicGetOptions::default()));
        assert!(poll_future(&mut fut).is_pending());
        drain_frames(&channel);
        channel
            .handle_method(AMQPClass::Basic(protocol::basic::AMQPMethod::GetOk(
                protocol::basic::GetOk {
                    delivery_tag: 1,
                    redelivered: false,
                    exchange: "amq.direct".into(),
                    routing_key: "#".into(),
                    message_count: 2,
                },
            )))
            .unwrap();
        assert!(poll_future(&mut fut).is_pending());
        channel
            .handle_content_header_frame(60, 5, BasicProperties::default())
            .unwrap();
        channel.handle_body_frame(b"hello".to_vec()).unwrap();
        match poll_future(&mut fut) {
            Poll::Ready(Ok(Some(message))) => {
                assert_eq!(message.delivery.data, b"hello");
                assert_eq!(message.message_count, 2);
                assert_eq!(message.delivery.delivery_tag, 1);
            }
            other => panic!("basic_get did not resolve: pending={}", other.is_pending()),
        }
        assert!(!channel.status.receiving_content());
    }

    #[test]
    fn deliveries_reach_the_consumer_in_order() {
        let channel = test_channel();
        let consumer = Consumer::new("ctag".into(), channel.executor.clone());
        channel.consumers.register("ctag".into(), consumer.clone());

        for (tag, payload) in [(1u64, &b"first"[..]), (2u64, &b"second"[..])] {
            channel
                .handle_method(AMQPClass::Basic(protocol::basic::AMQPMethod::Deliver(
                    protocol::basic::Deliver {
                        consumer_tag: "ctag".into(),
                        delivery_tag: tag,
                        redelivered: false,
                        exchange: "amq.topic".into(),
                        routing_key: "rk".into(),
                    },
                )))
                .unwrap();
            channel
                .handle_content_header_frame(60, payload.len() as u64, BasicProperties::default())
                .unwrap();
            channel.handle_body_frame(payload.to_vec()).unwrap();
        }

        let first = consumer.next_delivery().unwrap().unwrap().unwrap();
        assert_eq!(first.delivery_tag, 1);
        assert_eq!(first.data, b"first");
        assert_eq!(first.exchange.as_str(), "amq.topic");
        let second = consumer.next_delivery().unwrap().unwrap().unwrap();
        assert_eq!(second.delivery_tag, 2);
        assert_eq!(second.data, b"second");
        assert!(consumer.next_delivery().is_none());
    }

    #[test]
    fn interleaved_method_during_content_is_a_protocol_error() {
        let channel = test_channel();
        let consumer = Consumer::new("ctag".into(), channel.executor.clone());
        channel.consumers.register("ctag".into(), consumer);
        channel
            .handle_method(AMQPClass::Basic(protocol::basic::AMQPMethod::Deliver(
                protocol::basic::Deliver {
                    consumer_tag: "ctag".into(),
                    delivery_tag: 1,
                    redelivered: false,
                    exchange: "".into(),
                    routing_key: "rk".into(),
                },
            )))
            .unwrap();
        let result = channel.handle_method(AMQPClass::Queue(
            protocol::queue::AMQPMethod::DeclareOk(protocol::queue::DeclareOk {
                queue: "q1".into(),
                message_count: 0,
                consumer_count: 0,
            }),
        ));
        assert!(matches!(result, Err(Error::ProtocolError(_))));
    }

    #[test]
    fn publish_fragments_the_body_to_the_frame_size() {
        let channel = test_channel();
        let chunk = 8192 - 8;
        for (size, expected) in [(chunk * 2, 2), (chunk * 2 + 5, 3), (5, 1), (0, 0)] {
            let mut fut: Pin<Box<dyn Future<Output = _> + Send + '_>> =
                Box::pin(channel.basic_publish(
                    "",
                    "rk",
                    BasicPublishOptions::default(),
                    vec![0; size],
                    BasicProperties::default(),
                ));
            assert!(poll_future(&mut fut).is_pending());
            let sent = drain_frames(&channel);
            assert_eq!(body_frames(&sent), expected, "body size {}", size);
            assert!(matches!(poll_future(&mut fut), Poll::Ready(Ok(_))));
        }
    }

    #[test]
    fn confirm_select_cannot_be_issued_twice() {
        let channel = test_channel();
        let mut fut: Pin<Box<dyn Future<Output = _> + Send + '_>> =
            Box::pin(channel.confirm_select(ConfirmSelectOptions::default()));
        assert!(poll_future(&mut fut).is_pending());
        drain_frames(&channel);
        channel
            .handle_method(AMQPClass::Confirm(protocol::confirm::AMQPMethod::SelectOk(
                protocol::confirm::SelectOk {},
            )))
            .unwrap();
        assert!(matches!(poll_future(&mut fut), Poll::Ready(Ok(()))));
        assert!(channel.status().confirm());

        let mut again: Pin<Box<dyn Future<Output = _> + Send + '_>> =
            Box::pin(channel.confirm_select(ConfirmSelectOptions::default()));
        assert!(matches!(
            poll_future(&mut again),
            Poll::Ready(Err(Error::ConfirmsAlreadyEnabled))
        ));
    }

    #[test]
    fn publishes_are_confirmed_in_confirm_mode() {
        let channel = test_channel();
        channel.status.set_confirm();
        let mut publish: Pin<Box<dyn Future<Output = _> + Send + '_>> =
            Box::pin(channel.basic_publish(
                "",
                "rk",
                BasicPublishOptions::default(),
                b"payload".to_vec(),
                BasicProperties::default(),
            ));
        assert!(poll_future(&mut publish).is_pending());
        drain_frames(&channel);
        let confirm = match poll_future(&mut publish) {
            Poll::Ready(Ok(confirm)) => confirm,
            other => panic!("publish did not resolve: pending={}", other.is_pending()),
        };
        let mut confirm: Pin<Box<dyn Future<Output = _> + Send + '_>> = Box::pin(confirm);
        assert!(poll_future(&mut confirm).is_pending());
        channel
            .handle_method(AMQPClass::Basic(protocol::basic::AMQPMethod::Ack(
                protocol::basic::Ack {
                    delivery_tag: 1,
                    multiple: false,
                },
            )))
            .unwrap();
        assert!(matches!(
            poll_future(&mut confirm),
            Poll::Ready(Ok(Confirmation::Ack(None)))
        ));
    }

    #[test]
    fn returned_messages_reach_the_registered_handler() {
        let channel = test_channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let witness = seen.clone();
        channel.on_return(move |message| witness.lock().push(message));

        channel
            .handle_method(AMQPClass::Basic(protocol::basic::AMQPMethod::Return(
                protocol::basic::Return {
                    reply_code: 312,
                    reply_text: "NO_ROUTE".into(),
                    exchange: "missing".into(),
                    routing_key: "rk".into(),
                },
            )))
            .unwrap();
        channel
            .handle_content_header_frame(60, 5, BasicProperties::default())
            .unwrap();
        channel.handle_body_frame(b"hello".to_vec()).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].reply_code, 312);
        assert_eq!(seen[0].delivery.exchange.as_str(), "missing");
        assert_eq!(seen[0].delivery.data, b"hello");
    }

    #[test]
    fn server_flow_gates_the_publish_queue() {
        let channel = test_channel();
        channel
            .handle_method(AMQPClass::Channel(protocol::channel::AMQPMethod::Flow(
                protocol::channel::Flow { active: false },
            )))
            .unwrap();
        assert!(!channel.status.flow());
        channel
            .handle_method(AMQPClass::Channel(protocol::channel::AMQPMethod::Flow(
                protocol::channel::Flow { active: true },
            )))
            .unwrap();
        assert!(channel.status.flow());
    }

    #[test]
    fn consume_and_cancel_manage_the_registry() {
        let channel = test_channel();
        let mut consume: Pin<Box<dyn Future<Output = _> + Send + '_>> =
            Box::pin(channel.basic_consume(
                "q1",
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            ));
        assert!(poll_future(&mut consume).is_pending());
        drain_frames(&channel);
        channel
            .handle_method(AMQPClass::Basic(protocol::basic::AMQPMethod::ConsumeOk(
                protocol::basic::ConsumeOk {
                    consumer_tag: "amq.ctag-1".into(),
                },
            )))
            .unwrap();
        let consumer = match poll_future(&mut consume) {
            Poll::Ready(Ok(consumer)) => consumer,
            other => panic!("basic_consume did not resolve: pending={}", other.is_pending()),
        };
        assert_eq!(consumer.tag().as_str(), "amq.ctag-1");
        assert!(channel.consumers.get("amq.ctag-1").is_some());

        let mut cancel: Pin<Box<dyn Future<Output = _> + Send + '_>> =
            Box::pin(channel.basic_cancel("amq.ctag-1", BasicCancelOptions::default()));
        assert!(poll_future(&mut cancel).is_pending());
        drain_frames(&channel);
        channel
            .handle_method(AMQPClass::Basic(protocol::basic::AMQPMethod::CancelOk(
                protocol::basic::CancelOk {
                    consumer_tag: "amq.ctag-1".into(),
                },
            )))
            .unwrap();
        assert!(matches!(poll_future(&mut cancel), Poll::Ready(Ok(()))));
        assert!(channel.consumers.get("amq.ctag-1").is_none());
        // the consumer was told about the cancellation
        assert!(matches!(consumer.next_delivery(), Some(Ok(None))));
    }
}
