use crate::channel_receiver_state::{ChannelReceiverState, DeliveryCause};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Initial,
    Connecting,
    Connected,
    Closing,
    Closed,
    Error,
}

impl Default for ChannelState {
    fn default() -> Self {
        ChannelState::Initial
    }
}

#[derive(Clone, Default)]
pub struct ChannelStatus {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    state: ChannelState,
    confirm: bool,
    send_flow: bool,
    receiver_state: Option<ChannelReceiverState>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: ChannelState::default(),
            confirm: false,
            send_flow: true,
            receiver_state: None,
        }
    }
}

impl ChannelStatus {
    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.inner.lock().state = state;
    }

    pub fn initializing(&self) -> bool {
        self.state() == ChannelState::Initial
    }

    pub fn connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn closing(&self) -> bool {
        self.state() == ChannelState::Closing
    }

    /// Whether publisher confirms are enabled on the channel
    pub fn confirm(&self) -> bool {
        self.inner.lock().confirm
    }

    pub(crate) fn set_confirm(&self) {
        self.inner.lock().confirm = true;
    }

    pub(crate) fn flow(&self) -> bool {
        self.inner.lock().send_flow
    }

    pub(crate) fn set_send_flow(&self, flow: bool) {
        self.inner.lock().send_flow = flow;
    }

    pub(crate) fn receiving_content(&self) -> bool {
        self.inner.lock().receiver_state.is_some()
    }

    pub(crate) fn set_will_receive(&self, class_id: u16, cause: DeliveryCause) {
        self.inner.lock().receiver_state =
            Some(ChannelReceiverState::WillReceiveContent(class_id, cause));
    }

    /// Handle a content header: check it matches the announced class, then
    /// either expect `size` bytes of body or complete right away.
    ///
    /// Returns the delivery cause and whether the message is already complete.
    pub(crate) fn set_content_length(
        &self,
        class_id: u16,
        size: usize,
    ) -> Result<(DeliveryCause, bool), String> {
        let mut inner = self.inner.lock();
        match inner.receiver_state.take() {
            Some(ChannelReceiverState::WillReceiveContent(expected_class_id, cause)) => {
                if class_id != expected_class_id {
                    return Err(format!(
                        "content header with class id {} while expecting {}",
                        class_id, expected_class_id
                    ));
                }
                if size > 0 {
                    inner.receiver_state =
                        Some(ChannelReceiverState::ReceivingContent(cause.clone(), size));
                }
                Ok((cause, size == 0))
            }
            state => {
                inner.receiver_state = state;
                Err("unexpected content header frame".to_string())
            }
        }
    }

    /// Account for a body frame, returning the cause and the remaining size.
    pub(crate) fn receive(&self, payload_size: usize) -> Result<(DeliveryCause, usize), String> {
        let mut inner = self.inner.lock();
        match inner.receiver_state.take() {
            Some(ChannelReceiverState::ReceivingContent(cause, remaining))
                if remaining >= payload_size =>
            {
                let remaining = remaining - payload_size;
                if remaining > 0 {
                    inner.receiver_state =
                        Some(ChannelReceiverState::ReceivingContent(cause.clone(), remaining));
                }
                Ok((cause, remaining))
            }
            Some(ChannelReceiverState::ReceivingContent(_, remaining)) => Err(format!(
                "body frame of {} bytes exceeds the remaining {} bytes",
                payload_size, remaining
            )),
            state => {
                inner.receiver_state = state;
                Err("unexpected content body frame".to_string())
            }
        }
    }

    /// Reset the per-channel flags when the channel gets recycled
    pub(crate) fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = ChannelState::Initial;
        inner.confirm = false;
        inner.send_flow = true;
        inner.receiver_state = None;
    }
}

impl fmt::Debug for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ChannelStatus")
            .field("state", &inner.state)
            .field("confirm", &inner.confirm)
            .field("send_flow", &inner.send_flow)
            .field("receiver_state", &inner.receiver_state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShortString;

    #[test]
    fn content_assembly_accounting() {
        let status = ChannelStatus::default();
        let tag = ShortString::from("ctag");
        status.set_will_receive(60, DeliveryCause::Consume(tag.clone()));
        assert!(status.receiving_content());
        let (cause, complete) = status.set_content_length(60, 5).unwrap();
        assert_eq!(cause, DeliveryCause::Consume(tag.clone()));
        assert!(!complete);
        let (_, remaining) = status.receive(3).unwrap();
        assert_eq!(remaining, 2);
        let (_, remaining) = status.receive(2).unwrap();
        assert_eq!(remaining, 0);
        assert!(!status.receiving_content());
    }

    #[test]
    fn empty_body_completes_on_header() {
        let status = ChannelStatus::default();
        status.set_will_receive(60, DeliveryCause::Return);
        let (cause, complete) = status.set_content_length(60, 0).unwrap();
        assert_eq!(cause, DeliveryCause::Return);
        assert!(complete);
        assert!(!status.receiving_content());
    }

    #[test]
    fn mismatched_class_id_is_rejected() {
        let status = ChannelStatus::default();
        status.set_will_receive(60, DeliveryCause::Get);
        assert!(status.set_content_length(50, 5).is_err());
    }

    #[test]
    fn oversized_body_frame_is_rejected() {
        let status = ChannelStatus::default();
        status.set_will_receive(60, DeliveryCause::Get);
        status.set_content_length(60, 2).unwrap();
        assert!(status.receive(3).is_err());
    }

    #[test]
    fn unexpected_content_frames_are_rejected() {
        let status = ChannelStatus::default();
        assert!(status.set_content_length(60, 2).is_err());
        assert!(status.receive(1).is_err());
    }
}
