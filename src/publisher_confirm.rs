use crate::{message::BasicReturnMessage, Promise, Result};
use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// The broker's verdict on a published message once publisher confirms are
/// enabled. An unroutable mandatory message comes back attached to its
/// confirmation.
#[derive(Clone, Debug, PartialEq)]
pub enum Confirmation {
    Ack(Option<Box<BasicReturnMessage>>),
    Nack(Option<Box<BasicReturnMessage>>),
    NotRequested,
}

impl Confirmation {
    pub fn is_ack(&self) -> bool {
        matches!(self, Confirmation::Ack(_))
    }

    pub fn is_nack(&self) -> bool {
        matches!(self, Confirmation::Nack(_))
    }

    pub fn take_message(self) -> Option<BasicReturnMessage> {
        match self {
            Confirmation::Ack(message) | Confirmation::Nack(message) => message.map(|boxed| *boxed),
            Confirmation::NotRequested => None,
        }
    }
}

/// What `basic_publish` hands back: await it to get the broker confirmation,
/// or drop it if you don't care.
///
/// Without confirm mode it resolves immediately with
/// `Confirmation::NotRequested`.
pub struct PublisherConfirm {
    promise: Promise<Confirmation>,
}

impl PublisherConfirm {
    pub(crate) fn new(promise: Promise<Confirmation>) -> Self {
        Self { promise }
    }

    pub(crate) fn not_requested() -> Self {
        Self {
            promise: Promise::new_with_data(Ok(Confirmation::NotRequested)),
        }
    }
}

impl Future for PublisherConfirm {
    type Output = Result<Confirmation>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().promise).poll(cx)
    }
}

impl fmt::Debug for PublisherConfirm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublisherConfirm").finish()
    }
}
