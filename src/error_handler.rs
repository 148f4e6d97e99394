use crate::{types::ShortString, Error};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};

/// Holds the connection error callback registered with `Connection::on_error`.
#[derive(Clone, Default)]
pub(crate) struct ErrorHandler {
    handler: Arc<Mutex<Option<Box<dyn FnMut(Error) + Send>>>>,
}

impl ErrorHandler {
    pub(crate) fn set_handler<E: FnMut(Error) + Send + 'static>(&self, handler: E) {
        *self.handler.lock() = Some(Box::new(handler));
    }

    pub(crate) fn on_error(&self, error: Error) {
        if let Some(handler) = self.handler.lock().as_mut() {
            handler(error)
        }
    }
}

impl fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandler").finish()
    }
}

/// Holds the callback invoked with `(reply-code, reply-text)` when the
/// broker closes the channel. It survives channel recycling.
#[derive(Clone, Default)]
pub(crate) struct ChannelCloseHandler {
    handler: Arc<Mutex<Option<Box<dyn FnMut(u16, ShortString) + Send>>>>,
}

impl ChannelCloseHandler {
    pub(crate) fn set_handler<E: FnMut(u16, ShortString) + Send + 'static>(&self, handler: E) {
        *self.handler.lock() = Some(Box::new(handler));
    }

    pub(crate) fn on_closed(&self, reply_code: u16, reply_text: ShortString) {
        if let Some(handler) = self.handler.lock().as_mut() {
            handler(reply_code, reply_text)
        }
    }
}

impl fmt::Debug for ChannelCloseHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCloseHandler").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU16, Ordering};

    #[test]
    fn handler_is_invoked_with_the_close_arguments() {
        let handler = ChannelCloseHandler::default();
        let seen = Arc::new(AtomicU16::new(0));
        let witness = seen.clone();
        handler.set_handler(move |code, _text| {
            witness.store(code, Ordering::SeqCst);
        });
        handler.on_closed(404, "NOT_FOUND".into());
        assert_eq!(seen.load(Ordering::SeqCst), 404);
    }

    #[test]
    fn missing_handler_is_a_noop() {
        ErrorHandler::default().on_error(Error::SyncMethodPending);
    }
}
