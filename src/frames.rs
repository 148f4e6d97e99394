use crate::{
    consumer::Consumer,
    message::BasicGetMessage,
    queue::Queue,
    types::LongUInt,
    Error, Promise, PromiseResolver, Result,
};
use amq_protocol::frame::AMQPFrame;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
};

/// The reply a synchronous method is waiting for, holding the resolver to
/// wake the caller with the decoded payload.
pub(crate) enum Reply {
    ChannelOpenOk(PromiseResolver<()>),
    ChannelCloseOk(PromiseResolver<()>),
    ConnectionCloseOk(PromiseResolver<()>),
    ExchangeDeclareOk(PromiseResolver<()>),
    ExchangeDeleteOk(PromiseResolver<()>),
    QueueDeclareOk(PromiseResolver<Queue>),
    QueueBindOk(PromiseResolver<()>),
    QueueUnbindOk(PromiseResolver<()>),
    QueuePurgeOk(PromiseResolver<LongUInt>),
    QueueDeleteOk(PromiseResolver<LongUInt>),
    BasicQosOk(PromiseResolver<()>),
    BasicConsumeOk(PromiseResolver<Consumer>),
    BasicCancelOk(PromiseResolver<()>),
    BasicGetOk(PromiseResolver<Option<BasicGetMessage>>),
    BasicRecoverOk(PromiseResolver<()>),
    ConfirmSelectOk(PromiseResolver<()>),
}

impl Reply {
    pub(crate) fn cancel(self, error: Error) {
        match self {
            Reply::ChannelOpenOk(resolver) => resolver.swear(Err(error)),
            Reply::ChannelCloseOk(resolver) => resolver.swear(Err(error)),
            Reply::ConnectionCloseOk(resolver) => resolver.swear(Err(error)),
            Reply::ExchangeDeclareOk(resolver) => resolver.swear(Err(error)),
            Reply::ExchangeDeleteOk(resolver) => resolver.swear(Err(error)),
            Reply::QueueDeclareOk(resolver) => resolver.swear(Err(error)),
            Reply::QueueBindOk(resolver) => resolver.swear(Err(error)),
            Reply::QueueUnbindOk(resolver) => resolver.swear(Err(error)),
            Reply::QueuePurgeOk(resolver) => resolver.swear(Err(error)),
            Reply::QueueDeleteOk(resolver) => resolver.swear(Err(error)),
            Reply::BasicQosOk(resolver) => resolver.swear(Err(error)),
            Reply::BasicConsumeOk(resolver) => resolver.swear(Err(error)),
            Reply::BasicCancelOk(resolver) => resolver.swear(Err(error)),
            Reply::BasicGetOk(resolver) => resolver.swear(Err(error)),
            Reply::BasicRecoverOk(resolver) => resolver.swear(Err(error)),
            Reply::ConfirmSelectOk(resolver) => resolver.swear(Err(error)),
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Reply::ChannelOpenOk(..) => "ChannelOpenOk",
            Reply::ChannelCloseOk(..) => "ChannelCloseOk",
            Reply::ConnectionCloseOk(..) => "ConnectionCloseOk",
            Reply::ExchangeDeclareOk(..) => "ExchangeDeclareOk",
            Reply::ExchangeDeleteOk(..) => "ExchangeDeleteOk",
            Reply::QueueDeclareOk(..) => "QueueDeclareOk",
            Reply::QueueBindOk(..) => "QueueBindOk",
            Reply::QueueUnbindOk(..) => "QueueUnbindOk",
            Reply::QueuePurgeOk(..) => "QueuePurgeOk",
            Reply::QueueDeleteOk(..) => "QueueDeleteOk",
            Reply::BasicQosOk(..) => "BasicQosOk",
            Reply::BasicConsumeOk(..) => "BasicConsumeOk",
            Reply::BasicCancelOk(..) => "BasicCancelOk",
            Reply::BasicGetOk(..) => "BasicGetOk",
            Reply::BasicRecoverOk(..) => "BasicRecoverOk",
            Reply::ConfirmSelectOk(..) => "ConfirmSelectOk",
        })
    }
}

#[derive(Debug)]
pub(crate) struct ExpectedReply(pub(crate) Reply);

type QueuedFrame = (AMQPFrame, Option<PromiseResolver<()>>);

/// The outbound frame store and the pending-operation arena.
///
/// Three queues, drained in order by the io loop: priority frames (protocol
/// replies and heartbeats), regular method frames, then publish trains. A
/// publish train (method + header + bodies) is never interleaved with other
/// frames of the same channel: once started it's drained to the end.
///
/// At most one synchronous method may be in flight per channel; registering
/// a second one fails with `Error::SyncMethodPending`. The slot is only
/// freed by the matching `-Ok` frame (or the channel going away), never by
/// the caller going away.
#[derive(Clone, Default)]
pub(crate) struct Frames {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    priority_frames: VecDeque<QueuedFrame>,
    frames: VecDeque<QueuedFrame>,
    current_train: VecDeque<QueuedFrame>,
    publish_trains: VecDeque<VecDeque<QueuedFrame>>,
    expected_replies: HashMap<u16, Reply>,
    poison: Option<Error>,
}

impl Frames {
    pub(crate) fn push(
        &self,
        channel_id: u16,
        frame: AMQPFrame,
        resolver: PromiseResolver<()>,
        expected_reply: Option<ExpectedReply>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(poison) = inner.poison.clone() {
            resolver.swear(Err(poison.clone()));
            if let Some(ExpectedReply(reply)) = expected_reply {
                reply.cancel(poison.clone());
            }
            return Err(poison);
        }
        if let Some(ExpectedReply(reply)) = expected_reply {
            if inner.expected_replies.contains_key(&channel_id) {
                reply.cancel(Error::SyncMethodPending);
                return Err(Error::SyncMethodPending);
            }
            inner.expected_replies.insert(channel_id, reply);
        }
        inner.frames.push_back((frame, Some(resolver)));
        Ok(())
    }

    /// Protocol replies (close-ok, flow-ok, ...) jump ahead of queued methods
    pub(crate) fn push_priority(&self, frame: AMQPFrame, resolver: PromiseResolver<()>) {
        let mut inner = self.inner.lock();
        if let Some(poison) = inner.poison.clone() {
            resolver.swear(Err(poison));
            return;
        }
        inner.priority_frames.push_back((frame, Some(resolver)));
    }

    /// Frames that must go out before anything else queued: the protocol
    /// header and heartbeats.
    pub(crate) fn push_preemptive(&self, frame: AMQPFrame) {
        let mut inner = self.inner.lock();
        if inner.poison.is_none() {
            inner.priority_frames.push_front((frame, None));
        }
    }

    /// Queue a whole publish train; the promise resolves once the last
    /// frame has been handed to the transport.
    pub(crate) fn push_frames(&self, frames: Vec<AMQPFrame>) -> Promise<()> {
        let (promise, resolver) = Promise::new();
        let mut inner = self.inner.lock();
        if let Some(poison) = inner.poison.clone() {
            resolver.swear(Err(poison));
            return promise;
        }
        let mut train: VecDeque<QueuedFrame> =
            frames.into_iter().map(|frame| (frame, None)).collect();
        if let Some(last) = train.back_mut() {
            last.1 = Some(resolver);
        } else {
            resolver.swear(Ok(()));
        }
        inner.publish_trains.push_back(train);
        promise
    }

    pub(crate) fn pop(&self, flow: bool) -> Option<QueuedFrame> {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.priority_frames.pop_front() {
            return Some(frame);
        }
        if let Some(frame) = inner.current_train.pop_front() {
            return Some(frame);
        }
        if let Some(frame) = inner.frames.pop_front() {
            return Some(frame);
        }
        if flow {
            if let Some(mut train) = inner.publish_trains.pop_front() {
                let frame = train.pop_front();
                inner.current_train = train;
                return frame;
            }
        }
        None
    }

    pub(crate) fn has_pending(&self) -> bool {
        let inner = self.inner.lock();
        !(inner.priority_frames.is_empty()
            && inner.frames.is_empty()
            && inner.current_train.is_empty()
            && inner.publish_trains.is_empty())
    }

    pub(crate) fn has_expected_reply(&self, channel_id: u16) -> bool {
        self.inner.lock().expected_replies.contains_key(&channel_id)
    }

    pub(crate) fn next_expected_reply(&self, channel_id: u16) -> Option<Reply> {
        self.inner.lock().expected_replies.remove(&channel_id)
    }

    /// Fault the pending operation of one channel (channel recycle)
    pub(crate) fn clear_expected_replies(&self, channel_id: u16, error: Error) {
        if let Some(reply) = self.inner.lock().expected_replies.remove(&channel_id) {
            reply.cancel(error);
        }
    }

    /// Drop the queued frames of a recycled channel, faulting their senders
    pub(crate) fn drop_channel_frames(&self, channel_id: u16, error: Error) {
        let mut inner = self.inner.lock();
        let mut dropped = Vec::new();
        retain_other_channels(&mut inner.frames, channel_id, &mut dropped);
        retain_other_channels(&mut inner.current_train, channel_id, &mut dropped);
        let trains = std::mem::take(&mut inner.publish_trains);
        for train in trains {
            let for_channel = train
                .front()
                .map_or(false, |(frame, _)| frame_channel_id(frame) == Some(channel_id));
            if for_channel {
                for (_, resolver) in train {
                    if let Some(resolver) = resolver {
                        dropped.push(resolver);
                    }
                }
            } else {
                inner.publish_trains.push_back(train);
            }
        }
        for resolver in dropped {
            resolver.swear(Err(error.clone()));
        }
    }

    /// Fault every pending operation and refuse any further frame
    pub(crate) fn drop_pending(&self, error: Error) {
        let mut inner = self.inner.lock();
        let priority_frames: Vec<_> = inner.priority_frames.drain(..).collect();
        let frames: Vec<_> = inner.frames.drain(..).collect();
        let current_train: Vec<_> = inner.current_train.drain(..).collect();
        for (_, resolver) in priority_frames
            .into_iter()
            .chain(frames)
            .chain(current_train)
        {
            if let Some(resolver) = resolver {
                resolver.swear(Err(error.clone()));
            }
        }
        for train in inner.publish_trains.drain(..) {
            for (_, resolver) in train {
                if let Some(resolver) = resolver {
                    resolver.swear(Err(error.clone()));
                }
            }
        }
        for (_, reply) in inner.expected_replies.drain() {
            reply.cancel(error.clone());
        }
        inner.poison = Some(error);
    }
}

fn retain_other_channels(
    queue: &mut VecDeque<QueuedFrame>,
    channel_id: u16,
    dropped: &mut Vec<PromiseResolver<()>>,
) {
    let kept: VecDeque<QueuedFrame> = queue
        .drain(..)
        .filter_map(|(frame, resolver)| {
            if frame_channel_id(&frame) == Some(channel_id) {
                if let Some(resolver) = resolver {
                    dropped.push(resolver);
                }
                None
            } else {
                Some((frame, resolver))
            }
        })
        .collect();
    *queue = kept;
}

fn frame_channel_id(frame: &AMQPFrame) -> Option<u16> {
    match frame {
        AMQPFrame::Method(channel_id, _) => Some(*channel_id),
        AMQPFrame::Header(channel_id, _, _) => Some(*channel_id),
        AMQPFrame::Body(channel_id, _) => Some(*channel_id),
        AMQPFrame::Heartbeat(channel_id) => Some(*channel_id),
        AMQPFrame::ProtocolHeader(_) => None,
    }
}

impl fmt::Debug for Frames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Frames")
            .field("priority_frames", &inner.priority_frames.len())
            .field("frames", &inner.frames.len())
            .field("publish_trains", &inner.publish_trains.len())
            .field("expected_replies", &inner.expected_replies)
            .field("poison", &inner.poison)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_frame(channel_id: u16, marker: u8) -> AMQPFrame {
        AMQPFrame::Body(channel_id, vec![marker])
    }

    fn marker(frame: &AMQPFrame) -> u8 {
        match frame {
            AMQPFrame::Body(_, data) => data[0],
            _ => panic!("not a body frame"),
        }
    }

    #[test]
    fn only_one_synchronous_method_per_channel() {
        let frames = Frames::default();
        let (_promise, resolver) = Promise::new();
        let (_reply_promise, reply_resolver) = Promise::new();
        frames
            .push(
                1,
                body_frame(1, 0),
                resolver,
                Some(ExpectedReply(Reply::QueueBindOk(reply_resolver))),
            )
            .unwrap();
        let (_promise2, resolver2) = Promise::new();
        let (_reply_promise2, reply_resolver2) = Promise::new();
        let res = frames.push(
            1,
            body_frame(1, 1),
            resolver2,
            Some(ExpectedReply(Reply::QueueBindOk(reply_resolver2))),
        );
        assert!(matches!(res, Err(Error::SyncMethodPending)));
        assert!(frames.has_expected_reply(1));
    }

    #[test]
    fn the_slot_frees_once_the_reply_is_taken() {
        let frames = Frames::default();
        let (_promise, resolver) = Promise::new();
        let (_reply_promise, reply_resolver) = Promise::new();
        frames
            .push(
                1,
                body_frame(1, 0),
                resolver,
                Some(ExpectedReply(Reply::QueueBindOk(reply_resolver))),
            )
            .unwrap();
        assert!(frames.next_expected_reply(1).is_some());
        assert!(!frames.has_expected_reply(1));
    }

    #[test]
    fn publish_trains_are_not_interleaved() {
        let frames = Frames::default();
        let (_p1, r1) = Promise::new();
        frames.push(1, body_frame(1, 1), r1, None).unwrap();
        let _train = frames.push_frames(vec![body_frame(1, 2), body_frame(1, 3)]);
        let (_p2, r2) = Promise::new();
        frames.push(1, body_frame(1, 4), r2, None).unwrap();

        let order: Vec<u8> = std::iter::from_fn(|| frames.pop(true))
            .map(|(frame, _)| marker(&frame))
            .collect();
        // queued methods drain first, then the train runs to completion
        assert_eq!(order, vec![1, 4, 2, 3]);
        assert!(!frames.has_pending());
    }

    #[test]
    fn trains_are_gated_by_flow() {
        let frames = Frames::default();
        let _train = frames.push_frames(vec![body_frame(1, 1)]);
        assert!(frames.pop(false).is_none());
        assert!(frames.pop(true).is_some());
    }

    #[test]
    fn heartbeats_jump_the_queue() {
        let frames = Frames::default();
        let (_p1, r1) = Promise::new();
        frames.push(1, body_frame(1, 1), r1, None).unwrap();
        frames.push_preemptive(AMQPFrame::Heartbeat(0));
        assert!(matches!(frames.pop(true), Some((AMQPFrame::Heartbeat(0), None))));
    }

    #[test]
    fn drop_pending_poisons_the_store() {
        let frames = Frames::default();
        frames.drop_pending(Error::SyncMethodPending);
        let (_promise, resolver) = Promise::new();
        assert!(frames.push(1, body_frame(1, 0), resolver, None).is_err());
    }

    #[test]
    fn recycling_drops_only_the_old_channel_frames() {
        let frames = Frames::default();
        let (_p1, r1) = Promise::new();
        frames.push(1, body_frame(1, 1), r1, None).unwrap();
        let (_p2, r2) = Promise::new();
        frames.push(0, body_frame(0, 2), r2, None).unwrap();
        frames.drop_channel_frames(1, Error::SyncMethodPending);
        let order: Vec<u8> = std::iter::from_fn(|| frames.pop(true))
            .map(|(frame, _)| marker(&frame))
            .collect();
        assert_eq!(order, vec![2]);
    }
}
