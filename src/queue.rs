use crate::types::{LongUInt, ShortString};
use std::fmt;

/// The result of a queue declaration: the (possibly server-generated) name
/// plus the counts reported by `Queue.DeclareOk`.
#[derive(Clone)]
pub struct Queue {
    name: ShortString,
    message_count: LongUInt,
    consumer_count: LongUInt,
}

impl Queue {
    pub(crate) fn new(name: ShortString, message_count: LongUInt, consumer_count: LongUInt) -> Self {
        Self {
            name,
            message_count,
            consumer_count,
        }
    }

    pub fn name(&self) -> &ShortString {
        &self.name
    }

    pub fn message_count(&self) -> LongUInt {
        self.message_count
    }

    pub fn consumer_count(&self) -> LongUInt {
        self.consumer_count
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("message_count", &self.message_count)
            .field("consumer_count", &self.consumer_count)
            .finish()
    }
}
