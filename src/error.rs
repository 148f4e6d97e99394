use crate::{channel_status::ChannelState, connection_status::ConnectionState, protocol};
use amq_protocol::frame::{GenError, ParserError};
use amq_protocol::types::ReplyCode;
use std::{error, fmt, io, sync::Arc};

/// A std Result with a garenne Error as the error type
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that can be raised while using this crate.
///
/// Local validation errors (`InvalidArgument`, `InvalidValue`,
/// `NotImplementedOnServer`, `ConfirmsAlreadyEnabled`, `SyncMethodPending`)
/// are raised before anything is queued on the wire. The broker's soft and
/// hard errors travel inside `ProtocolError` and can be matched through the
/// `is_*` helpers.
#[derive(Clone, Debug)]
pub enum Error {
    /// A locally rejected argument, detected before any I/O
    InvalidArgument(String),
    /// A well-typed argument outside of its legal range
    InvalidValue(String),
    /// The broker (RabbitMQ) doesn't implement the requested feature
    NotImplementedOnServer(&'static str),
    /// `confirm_select` was issued twice on the same channel
    ConfirmsAlreadyEnabled,
    /// Another synchronous method is already awaiting its reply on this channel
    SyncMethodPending,
    /// The maximum channel number was reached while recycling
    ChannelsLimitReached,
    InvalidProtocolVersion(String),
    InvalidChannel(u16),
    InvalidChannelState(ChannelState),
    InvalidConnectionState(ConnectionState),
    /// The transport failed or the broker went silent past the heartbeat deadline
    ConnectionLost(Arc<io::Error>),
    ParsingError(ParserError),
    ProtocolError(protocol::AMQPError),
    SerialisationError(Arc<GenError>),
}

impl Error {
    pub fn amqp_error(&self) -> Option<&protocol::AMQPError> {
        if let Error::ProtocolError(error) = self {
            Some(error)
        } else {
            None
        }
    }

    fn has_amqp_reply_code(&self, code: ReplyCode) -> bool {
        self.amqp_error().map_or(false, |error| error.get_id() == code)
    }

    /// The broker replied 404 (e.g. passive declare of a missing entity)
    pub fn is_not_found(&self) -> bool {
        self.has_amqp_reply_code(404)
    }

    /// The broker replied 406
    pub fn is_precondition_failed(&self) -> bool {
        self.has_amqp_reply_code(406)
    }

    /// The broker replied 403
    pub fn is_access_refused(&self) -> bool {
        self.has_amqp_reply_code(403)
    }

    /// The broker replied 405
    pub fn is_resource_locked(&self) -> bool {
        self.has_amqp_reply_code(405)
    }

    /// The broker replied 503
    pub fn is_command_invalid(&self) -> bool {
        self.has_amqp_reply_code(503)
    }

    /// The broker forcefully closed the connection (320)
    pub fn is_connection_forced(&self) -> bool {
        self.has_amqp_reply_code(320)
    }

    pub fn is_amqp_soft_error(&self) -> bool {
        self.amqp_error()
            .map_or(false, |error| matches!(error.kind(), protocol::AMQPErrorKind::Soft(_)))
    }

    pub fn is_amqp_hard_error(&self) -> bool {
        self.amqp_error()
            .map_or(false, |error| matches!(error.kind(), protocol::AMQPErrorKind::Hard(_)))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(message) => write!(f, "invalid argument: {}", message),
            Error::InvalidValue(message) => write!(f, "invalid value: {}", message),
            Error::NotImplementedOnServer(what) => {
                write!(f, "not implemented by the server: {}", what)
            }
            Error::ConfirmsAlreadyEnabled => {
                write!(f, "publisher confirms are already enabled on this channel")
            }
            Error::SyncMethodPending => write!(
                f,
                "another synchronous method is already awaiting its reply on this channel"
            ),
            Error::ChannelsLimitReached => write!(
                f,
                "the maximum channel number has been reached while recycling the channel"
            ),
            Error::InvalidProtocolVersion(version) => {
                write!(f, "the server refused our protocol version, it sent: {}", version)
            }
            Error::InvalidChannel(channel) => write!(f, "invalid channel: {}", channel),
            Error::InvalidChannelState(state) => write!(f, "invalid channel state: {:?}", state),
            Error::InvalidConnectionState(state) => {
                write!(f, "invalid connection state: {:?}", state)
            }
            Error::ConnectionLost(error) => write!(f, "connection lost: {}", error),
            Error::ParsingError(error) => write!(f, "failed to parse: {}", error),
            Error::ProtocolError(error) => write!(f, "protocol error: {}", error),
            Error::SerialisationError(error) => write!(f, "failed to serialise: {}", error),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::ConnectionLost(error) => Some(&**error),
            Error::ParsingError(error) => Some(error),
            Error::SerialisationError(error) => Some(&**error),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::ConnectionLost(Arc::new(error))
    }
}

impl From<ParserError> for Error {
    fn from(error: ParserError) -> Self {
        Error::ParsingError(error)
    }
}

impl From<GenError> for Error {
    fn from(error: GenError) -> Self {
        Error::SerialisationError(Arc::new(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AMQPError, AMQPHardError, AMQPSoftError};

    #[test]
    fn soft_error_helpers() {
        let error = Error::ProtocolError(AMQPError::new(
            AMQPSoftError::NOTFOUND.into(),
            "NOT_FOUND - no queue 'foo'".into(),
        ));
        assert!(error.is_not_found());
        assert!(error.is_amqp_soft_error());
        assert!(!error.is_amqp_hard_error());
        assert!(!error.is_precondition_failed());
    }

    #[test]
    fn hard_error_helpers() {
        let error = Error::ProtocolError(AMQPError::new(
            AMQPHardError::CONNECTIONFORCED.into(),
            "CONNECTION_FORCED - shutdown".into(),
        ));
        assert!(error.is_connection_forced());
        assert!(error.is_amqp_hard_error());
    }

    #[test]
    fn local_errors_display() {
        assert!(Error::SyncMethodPending.to_string().contains("synchronous"));
        assert!(Error::NotImplementedOnServer("prefetch_size")
            .to_string()
            .contains("prefetch_size"));
    }
}
