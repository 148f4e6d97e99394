use crate::{tcp, uri::AMQPUri, Result};
use amq_protocol::tcp::AMQPUriTcpExt;
use std::{
    io::{self, Read, Write},
    os::unix::io::{AsRawFd, RawFd},
};

/// The broker socket: either fully connected, or a TLS stream still in the
/// middle of its handshake that the io loop drives to completion whenever
/// the socket turns ready.
pub(crate) struct TcpStream(Inner);

enum Inner {
    Connected(tcp::TcpStream),
    Handshaking(Option<tcp::MidHandshakeTlsStream>),
}

impl TcpStream {
    /// Open the (possibly TLS-wrapped) stream for `uri` and switch it to
    /// non-blocking mode for the event loop.
    pub(crate) fn connect(uri: &AMQPUri) -> Result<Self> {
        let stream = Self(match uri.connect() {
            Ok(stream) if stream.is_connected() => Inner::Connected(stream),
            Ok(stream) => Inner::Handshaking(Some(stream.into())),
            Err(handshaker) => {
                Inner::Handshaking(Some(handshaker.into_mid_handshake_tls_stream()?))
            }
        });
        stream.inner().set_nonblocking(true)?;
        Ok(stream)
    }

    fn inner(&self) -> &tcp::TcpStream {
        match &self.0 {
            Inner::Connected(stream) => stream,
            Inner::Handshaking(handshaker) => handshaker.as_ref().unwrap().get_ref(),
        }
    }

    fn inner_mut(&mut self) -> &mut tcp::TcpStream {
        match &mut self.0 {
            Inner::Connected(stream) => stream,
            Inner::Handshaking(handshaker) => handshaker.as_mut().unwrap().get_mut(),
        }
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        matches!(self.0, Inner::Handshaking(_))
    }

    /// Drive the TLS handshake one step further; call again on the next
    /// readiness event while `is_handshaking` stays true.
    pub(crate) fn handshake(&mut self) -> Result<()> {
        if let Inner::Handshaking(handshaker) = &mut self.0 {
            match handshaker.take().unwrap().handshake() {
                Ok(stream) => self.0 = Inner::Connected(stream),
                Err(error) => {
                    self.0 = Inner::Handshaking(Some(error.into_mid_handshake_tls_stream()?))
                }
            }
        }
        Ok(())
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner().as_raw_fd()
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner_mut().read(buf)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner_mut().flush()
    }
}
