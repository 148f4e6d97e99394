use crate::{
    buffer::Buffer,
    channels::Channels,
    configuration::Configuration,
    connection_status::ConnectionStatus,
    frames::Frames,
    heartbeat::Heartbeat,
    socket_state::SocketState,
    stream::TcpStream,
    uri::AMQPUri,
    Error, Result,
};
use amq_protocol::frame::{gen_frame, parse_frame, AMQPFrame, ProtocolVersion, WriteContext};
use mio::{unix::EventedFd, Events, Poll, PollOpt, Ready, Token};
use std::{
    io,
    os::unix::io::{AsRawFd, RawFd},
    sync::Arc,
    thread::Builder as ThreadBuilder,
    time::Duration,
};
use tracing::{error, trace};

const SOCKET: Token = Token(1);
const CONTINUE: Token = Token(2);

const FRAMES_STORAGE: usize = 32;

#[derive(Debug, PartialEq)]
enum Status {
    Initial,
    Setup,
    Stop,
}

/// The transport adapter: a dedicated thread owning the socket, writing the
/// queued frames and feeding inbound frames to the router. Everything else
/// only ever touches the shared stores and wakes this loop up.
pub(crate) struct IoLoop {
    channels: Channels,
    connection_status: ConnectionStatus,
    configuration: Configuration,
    frames: Frames,
    heartbeat: Heartbeat,
    socket_state: SocketState,
    stream: TcpStream,
    fd: RawFd,
    poll: Poll,
    status: Status,
    frame_size: usize,
    receive_buffer: Buffer,
    send_buffer: Buffer,
    can_read: bool,
    can_write: bool,
}

impl IoLoop {
    /// Connect the socket and spawn the io thread.
    pub(crate) fn start(
        uri: AMQPUri,
        connection_status: ConnectionStatus,
        configuration: Configuration,
        channels: Channels,
        frames: Frames,
        socket_state: SocketState,
    ) -> Result<()> {
        ThreadBuilder::new()
            .name("garenne-io-loop".to_owned())
            .spawn(move || {
                let stream = match TcpStream::connect(&uri) {
                    Ok(stream) => stream,
                    Err(error) => {
                        error!(%error, "failed to connect");
                        channels.set_connection_error(error);
                        return;
                    }
                };
                match IoLoop::new(
                    stream,
                    connection_status,
                    configuration,
                    channels.clone(),
                    frames,
                    socket_state,
                ) {
                    Ok(io_loop) => {
                        if let Err(error) = io_loop.run() {
                            error!(%error, "io loop terminated");
                            channels.set_connection_error(error);
                        }
                    }
                    Err(error) => channels.set_connection_error(error),
                }
            })
            .map_err(|err| Error::ConnectionLost(Arc::new(err)))?;
        Ok(())
    }

    fn new(
        stream: TcpStream,
        connection_status: ConnectionStatus,
        configuration: Configuration,
        channels: Channels,
        frames: Frames,
        socket_state: SocketState,
    ) -> Result<Self> {
        let frame_size = std::cmp::max(8192, configuration.frame_max() as usize);
        let fd = stream.as_raw_fd();
        let poll = Poll::new().map_err(Error::from)?;
        poll.register(
            &EventedFd(&fd),
            SOCKET,
            Ready::readable() | Ready::writable(),
            PollOpt::edge(),
        )
        .map_err(Error::from)?;
        poll.register(
            socket_state.registration(),
            CONTINUE,
            Ready::readable(),
            PollOpt::edge(),
        )
        .map_err(Error::from)?;
        // the client speaks first
        frames.push_preemptive(AMQPFrame::ProtocolHeader(ProtocolVersion::amqp_0_9_1()));
        Ok(Self {
            channels,
            connection_status,
            configuration,
            frames,
            heartbeat: Heartbeat::default(),
            socket_state,
            stream,
            fd,
            poll,
            status: Status::Initial,
            frame_size,
            receive_buffer: Buffer::with_capacity(FRAMES_STORAGE * frame_size),
            send_buffer: Buffer::with_capacity(FRAMES_STORAGE * frame_size),
            can_read: false,
            can_write: false,
        })
    }

    fn should_continue(&self) -> bool {
        self.status != Status::Stop
            && !self.connection_status.closed()
            && !self.connection_status.errored()
    }

    fn ensure_setup(&mut self) {
        if self.status != Status::Setup && self.connection_status.connected() {
            let frame_max = self.configuration.frame_max() as usize;
            self.frame_size = std::cmp::max(self.frame_size, frame_max);
            self.receive_buffer.grow(FRAMES_STORAGE * self.frame_size);
            self.send_buffer.grow(FRAMES_STORAGE * self.frame_size);
            let heartbeat = self.configuration.heartbeat();
            if heartbeat != 0 {
                trace!(heartbeat, "io_loop: start heartbeat");
                self.heartbeat.set_timeout(Duration::from_secs(u64::from(heartbeat)));
            }
            self.status = Status::Setup;
        }
    }

    fn run(mut self) -> Result<()> {
        let mut events = Events::with_capacity(1024);
        while self.should_continue() {
            self.do_run(&mut events)?;
        }
        self.flush_before_exit();
        trace!("io_loop: done");
        Ok(())
    }

    fn do_run(&mut self, events: &mut Events) -> Result<()> {
        trace!("io_loop: poll");
        self.ensure_setup();
        self.poll
            .poll(events, self.heartbeat.poll_timeout())
            .map_err(Error::from)?;
        for event in events.iter() {
            match event.token() {
                SOCKET => {
                    if event.readiness().is_readable() {
                        self.can_read = true;
                    }
                    if event.readiness().is_writable() {
                        self.can_write = true;
                    }
                }
                CONTINUE => self.socket_state.reset(),
                _ => {}
            }
        }

        if self.heartbeat.dead() {
            let error = Error::ConnectionLost(Arc::new(io::Error::new(
                io::ErrorKind::TimedOut,
                "missed heartbeats from the server",
            )));
            error!("the server stopped answering, closing connection");
            self.heartbeat.cancel();
            self.channels.set_connection_error(error.clone());
            return Err(error);
        }
        if self.connection_status.connected() && self.heartbeat.should_send() {
            trace!("io_loop: send heartbeat");
            self.frames.push_preemptive(AMQPFrame::Heartbeat(0));
        }

        if self.stream.is_handshaking() {
            self.stream.handshake()?;
            if self.stream.is_handshaking() {
                // wait for the socket to be ready again
                return Ok(());
            }
        }

        loop {
            let mut progress = false;
            if self.can_write {
                progress |= self.serialize();
                self.write_to_stream()?;
            }
            if self.can_read {
                progress |= self.read_from_stream()?;
            }
            progress |= self.parse()?;
            if !progress || !self.should_continue() {
                break;
            }
        }
        Ok(())
    }

    /// Move one queued frame into the send buffer
    fn serialize(&mut self) -> bool {
        if !self.frames.has_pending() {
            return false;
        }
        if self.connection_status.blocked() {
            return false;
        }
        if let Some((frame, resolver)) = self.frames.pop(self.channels.flow()) {
            trace!(?frame, "io_loop: will write frame");
            match gen_frame(&frame)(WriteContext::from(Vec::with_capacity(self.frame_size))) {
                Ok(write_context) => {
                    self.send_buffer.extend(&write_context.write);
                    self.heartbeat.update_last_write();
                    if let Some(resolver) = resolver {
                        resolver.swear(Ok(()));
                    }
                    true
                }
                Err(e) => {
                    error!(error = ?e, "io_loop: error generating frame");
                    let error = Error::SerialisationError(Arc::new(e));
                    if let Some(resolver) = resolver {
                        resolver.swear(Err(error.clone()));
                    }
                    self.channels.set_connection_error(error);
                    false
                }
            }
        } else {
            false
        }
    }

    fn write_to_stream(&mut self) -> Result<()> {
        while self.send_buffer.available_data() > 0 {
            match self.send_buffer.write_to(&mut self.stream) {
                Ok(0) => break,
                Ok(count) => trace!(count, "io_loop: wrote bytes"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.can_write = false;
                    break;
                }
                Err(e) => {
                    error!(error = %e, "io_loop: error writing");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn read_from_stream(&mut self) -> Result<bool> {
        self.receive_buffer.shift_unless_available(self.frame_size);
        if self.receive_buffer.available_space() == 0 {
            self.receive_buffer.grow(self.receive_buffer.available_data() + self.frame_size);
        }
        match self.receive_buffer.read_from(&mut self.stream) {
            Ok(0) => {
                if self.connection_status.closing() {
                    self.status = Status::Stop;
                    Ok(false)
                } else {
                    error!("io_loop: the server closed the connection");
                    Err(Error::ConnectionLost(Arc::new(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "the server closed the connection",
                    ))))
                }
            }
            Ok(count) => {
                trace!(count, "io_loop: read bytes");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.can_read = false;
                Ok(false)
            }
            Err(e) => {
                error!(error = %e, "io_loop: error reading");
                Err(e.into())
            }
        }
    }

    fn parse(&mut self) -> Result<bool> {
        let mut parsed = false;
        while self.receive_buffer.available_data() > 0 {
            match parse_frame(self.receive_buffer.data()) {
                Ok((remaining, frame)) => {
                    let consumed = self.receive_buffer.available_data() - remaining.len();
                    self.receive_buffer.consume(consumed);
                    self.heartbeat.update_last_read();
                    parsed = true;
                    if let Err(error) = self.channels.handle_frame(frame) {
                        // the state machine already commanded the recovery
                        // (channel recycle or connection close)
                        trace!(%error, "io_loop: frame handler reported an error");
                    }
                }
                Err(e) => {
                    if e.is_incomplete() {
                        self.receive_buffer.shift();
                        break;
                    }
                    error!(error = ?e, "io_loop: parse error");
                    let error = Error::ParsingError(e);
                    self.channels.set_connection_error(error.clone());
                    return Err(error);
                }
            }
        }
        Ok(parsed)
    }

    /// Best-effort flush of the close-ok handshake tail
    fn flush_before_exit(&mut self) {
        while self.serialize() {}
        let _ = self.write_to_stream();
    }
}
