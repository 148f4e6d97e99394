use crate::{
    channel::Channel,
    channel_status::ChannelState,
    configuration::Configuration,
    connection_status::{ConnectionState, ConnectionStatus},
    error_handler::ErrorHandler,
    frames::Frames,
    id_sequence::IdSequence,
    internal_rpc::{InternalCommand, InternalRPCHandle},
    options::ConfirmSelectOptions,
    socket_state::SocketStateHandle,
    types::{ShortString, ShortUInt},
    Error, Result,
};
use amq_protocol::frame::{AMQPContentHeader, AMQPFrame};
use executor_trait::FullExecutor;
use std::{fmt, sync::Arc};
use tracing::{debug, error, trace};

/// The frame router: channel 0 plus the single application channel,
/// recycled under a new number when the broker kills it.
#[derive(Clone)]
pub(crate) struct Channels {
    zero: Channel,
    app: Channel,
    channel_id: IdSequence<u16>,
    configuration: Configuration,
    connection_status: ConnectionStatus,
    frames: Frames,
    error_handler: ErrorHandler,
}

impl Channels {
    pub(crate) fn new(
        configuration: Configuration,
        connection_status: ConnectionStatus,
        waker: SocketStateHandle,
        internal_rpc: InternalRPCHandle,
        frames: Frames,
        executor: Arc<dyn FullExecutor + Send + Sync>,
        error_handler: ErrorHandler,
    ) -> Self {
        let channel_id = IdSequence::new(false);
        let zero = Channel::new(
            0,
            configuration.clone(),
            connection_status.clone(),
            waker.clone(),
            internal_rpc.clone(),
            frames.clone(),
            executor.clone(),
        );
        zero.set_state(ChannelState::Connected);
        let app = Channel::new(
            channel_id.next(),
            configuration.clone(),
            connection_status.clone(),
            waker,
            internal_rpc,
            frames.clone(),
            executor,
        );
        Self {
            zero,
            app,
            channel_id,
            configuration,
            connection_status,
            frames,
            error_handler,
        }
    }

    pub(crate) fn zero(&self) -> &Channel {
        &self.zero
    }

    pub(crate) fn app(&self) -> &Channel {
        &self.app
    }

    fn get(&self, channel_id: u16) -> Option<&Channel> {
        if channel_id == 0 {
            Some(&self.zero)
        } else if channel_id == self.app.id() {
            Some(&self.app)
        } else {
            None
        }
    }

    /// Whether the broker currently lets us publish
    pub(crate) fn flow(&self) -> bool {
        self.app.status().flow()
    }

    pub(crate) fn handle_frame(&self, frame: AMQPFrame) -> Result<()> {
        trace!(?frame, "will handle frame");
        match frame {
            AMQPFrame::ProtocolHeader(version) => {
                error!("the server refused our protocol version");
                let error = Error::InvalidProtocolVersion(version.to_string());
                if let Some(resolver) = self.connection_status.connection_resolver() {
                    resolver.swear(Err(error.clone()));
                }
                self.set_connection_error(error.clone());
                Err(error)
            }
            AMQPFrame::Method(channel_id, method) => self
                .channel_or_invalid(channel_id)?
                .handle_method(method),
            AMQPFrame::Header(channel_id, class_id, header) => {
                let AMQPContentHeader {
                    body_size,
                    properties,
                    ..
                } = *header;
                self.channel_or_invalid(channel_id)?
                    .handle_content_header_frame(class_id, body_size, properties)
            }
            AMQPFrame::Body(channel_id, payload) => self
                .channel_or_invalid(channel_id)?
                .handle_body_frame(payload),
            AMQPFrame::Heartbeat(_) => {
                debug!("received heartbeat from server");
                Ok(())
            }
        }
    }

    fn channel_or_invalid(&self, channel_id: u16) -> Result<&Channel> {
        self.get(channel_id).ok_or_else(|| {
            error!(channel = channel_id, "frame for an unknown channel");
            let error = Error::InvalidChannel(channel_id);
            self.set_connection_error(error.clone());
            error
        })
    }

    /// Close the faulted channel for good and reopen it under the next
    /// number, restoring publisher-confirms mode if it was enabled.
    fn recycle_channel(
        &self,
        reply_code: ShortUInt,
        reply_text: ShortString,
        error: Error,
        handle: &InternalRPCHandle,
    ) {
        let channel = self.app.clone();
        let was_confirm = channel.status().confirm();
        let old_id = channel.id();
        channel.prepare_recycle(error);
        channel.on_recycled(reply_code, reply_text);
        if !self.connection_status.connected() {
            channel.set_state(ChannelState::Closed);
            return;
        }
        self.channel_id.set_max(self.configuration.channel_max());
        let new_id = self.channel_id.next();
        if new_id == old_id {
            error!("no channel number left to recycle onto");
            self.set_connection_error(Error::ChannelsLimitReached);
            return;
        }
        debug!(old_id, new_id, was_confirm, "recycling channel");
        channel.set_channel_id(new_id);
        handle.register_internal_future(async move {
            channel.channel_open().await?;
            if was_confirm {
                channel.confirm_select(ConfirmSelectOptions::default()).await?;
            }
            Ok(())
        });
    }

    pub(crate) fn set_connection_error(&self, error: Error) {
        if self.connection_status.errored() || self.connection_status.closed() {
            return;
        }
        error!(%error, "connection error");
        self.connection_status.set_state(ConnectionState::Error);
        if let Some(resolver) = self.connection_status.connection_resolver() {
            resolver.swear(Err(error.clone()));
        }
        self.frames.drop_pending(error.clone());
        self.app.set_error(error.clone());
        self.error_handler.on_error(error);
    }

    fn set_connection_closed(&self, error: Error) {
        self.connection_status.set_state(ConnectionState::Closed);
        self.frames.drop_pending(error.clone());
        self.app.set_closed(error);
    }

    pub(crate) fn on_internal_command(&self, command: InternalCommand, handle: &InternalRPCHandle) {
        match command {
            InternalCommand::CloseConnection(reply_code, reply_text, class_id, method_id) => {
                if self.connection_status.connected() {
                    let channel0 = self.zero.clone();
                    handle.register_internal_future(async move {
                        channel0
                            .connection_close(reply_code, &reply_text, class_id, method_id)
                            .await
                    });
                }
            }
            InternalCommand::SendConnectionCloseOk(error) => {
                let channel0 = self.zero.clone();
                handle.register_internal_future(async move {
                    channel0.connection_close_ok(error).await
                });
            }
            InternalCommand::SetConnectionClosing => {
                self.connection_status.set_state(ConnectionState::Closing);
            }
            InternalCommand::SetConnectionClosed(error) => self.set_connection_closed(error),
            InternalCommand::SetConnectionError(error) => self.set_connection_error(error),
            InternalCommand::RecycleChannel(reply_code, reply_text, error) => {
                self.recycle_channel(reply_code, reply_text, error, handle)
            }
            InternalCommand::OpenAppChannel(resolver, connection) => {
                let channel = self.app.clone();
                handle.register_internal_future(async move {
                    channel.channel_open().await?;
                    resolver.swear(Ok(connection));
                    Ok(())
                });
            }
        }
    }
}

impl fmt::Debug for Channels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channels")
            .field("app", &self.app.id())
            .finish()
    }
}
