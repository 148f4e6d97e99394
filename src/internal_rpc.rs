use crate::{
    channels::Channels,
    protocol::constants::REPLY_SUCCESS,
    socket_state::SocketStateHandle,
    types::{ShortString, ShortUInt},
    Connection, Error, PromiseResolver, Result,
};
use executor_trait::FullExecutor;
use flume::{Receiver, Sender};
use std::{fmt, future::Future, sync::Arc};
use tracing::trace;

/// Commands the frame handlers enqueue instead of acting inline, so that a
/// handler never sends frames (or re-enters the state machine) while the io
/// loop still holds the inbound frame.
pub(crate) enum InternalCommand {
    CloseConnection(ShortUInt, String, u16, u16),
    SendConnectionCloseOk(Error),
    SetConnectionClosing,
    SetConnectionClosed(Error),
    SetConnectionError(Error),
    RecycleChannel(ShortUInt, ShortString, Error),
    OpenAppChannel(PromiseResolver<Connection>, Connection),
}

pub(crate) struct InternalRPC {
    rpc: Receiver<InternalCommand>,
    handle: InternalRPCHandle,
}

#[derive(Clone)]
pub(crate) struct InternalRPCHandle {
    sender: Sender<InternalCommand>,
    waker: SocketStateHandle,
    executor: Arc<dyn FullExecutor + Send + Sync>,
}

impl InternalRPCHandle {
    pub(crate) fn close_connection(
        &self,
        reply_code: ShortUInt,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    ) {
        self.send(InternalCommand::CloseConnection(
            reply_code, reply_text, class_id, method_id,
        ));
    }

    pub(crate) fn close_connection_cleanly(&self) {
        self.close_connection(REPLY_SUCCESS, "Normal Shutdown".to_string(), 0, 0);
    }

    pub(crate) fn send_connection_close_ok(&self, error: Error) {
        self.send(InternalCommand::SendConnectionCloseOk(error));
    }

    pub(crate) fn set_connection_closing(&self) {
        self.send(InternalCommand::SetConnectionClosing);
    }

    pub(crate) fn set_connection_closed(&self, error: Error) {
        self.send(InternalCommand::SetConnectionClosed(error));
    }

    pub(crate) fn set_connection_error(&self, error: Error) {
        self.send(InternalCommand::SetConnectionError(error));
    }

    pub(crate) fn recycle_channel(&self, reply_code: ShortUInt, reply_text: ShortString, error: Error) {
        self.send(InternalCommand::RecycleChannel(reply_code, reply_text, error));
    }

    /// Open the application channel, then hand the connection to the
    /// pending connect call.
    pub(crate) fn open_app_channel(
        &self,
        resolver: PromiseResolver<Connection>,
        connection: Connection,
    ) {
        self.send(InternalCommand::OpenAppChannel(resolver, connection));
    }

    /// Run a client-side protocol step in the background, turning its error
    /// into a connection error.
    pub(crate) fn register_internal_future(
        &self,
        future: impl Future<Output = Result<()>> + Send + 'static,
    ) {
        let handle = self.clone();
        self.executor.spawn(Box::pin(async move {
            if let Err(error) = future.await {
                handle.set_connection_error(error);
            }
        }));
    }

    fn send(&self, command: InternalCommand) {
        trace!("internal RPC command");
        let _ = self.sender.send(command);
        self.waker.wake();
    }
}

impl InternalRPC {
    pub(crate) fn new(executor: Arc<dyn FullExecutor + Send + Sync>, waker: SocketStateHandle) -> Self {
        let (sender, rpc) = flume::unbounded();
        Self {
            rpc,
            handle: InternalRPCHandle {
                sender,
                waker,
                executor,
            },
        }
    }

    pub(crate) fn handle(&self) -> InternalRPCHandle {
        self.handle.clone()
    }

    /// Spawn the command loop once the channels registry exists
    pub(crate) fn start(self, channels: Channels) {
        let rpc = self.rpc;
        let handle = self.handle;
        let executor = handle.executor.clone();
        executor.spawn(Box::pin(async move {
            while let Ok(command) = rpc.recv_async().await {
                channels.on_internal_command(command, &handle);
            }
        }));
    }
}

impl fmt::Debug for InternalRPCHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalRPCHandle").finish()
    }
}
