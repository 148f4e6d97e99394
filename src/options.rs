//! The options passed to the channel methods, mapping the boolean and tuning
//! flags of each AMQP method. Fields default to the protocol defaults.

use crate::types::LongUInt;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeDeclareOptions {
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub nowait: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeDeleteOptions {
    pub if_unused: bool,
    pub nowait: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDeclareOptions {
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub nowait: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBindOptions {
    pub nowait: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePurgeOptions {
    pub nowait: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDeleteOptions {
    pub if_unused: bool,
    pub if_empty: bool,
    pub nowait: bool,
}

/// RabbitMQ only implements `prefetch_size = 0`; any other value is refused
/// locally with `Error::NotImplementedOnServer` before reaching the wire.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicQosOptions {
    pub prefetch_size: LongUInt,
    pub global: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicConsumeOptions {
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
    pub nowait: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicCancelOptions {
    pub nowait: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicGetOptions {
    pub no_ack: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicPublishOptions {
    pub mandatory: bool,
    pub immediate: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAckOptions {
    pub multiple: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicNackOptions {
    pub multiple: bool,
    pub requeue: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicRejectOptions {
    pub requeue: bool,
}

/// RabbitMQ only implements `requeue = true`; recovering without requeueing
/// is refused locally with `Error::NotImplementedOnServer`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicRecoverOptions {
    pub requeue: bool,
}

impl Default for BasicRecoverOptions {
    fn default() -> Self {
        Self { requeue: true }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmSelectOptions {
    pub nowait: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFlowOkOptions {
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_round_trip_through_serde() {
        let options = QueueDeclareOptions {
            durable: true,
            exclusive: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&options).unwrap();
        assert_eq!(serde_json::from_str::<QueueDeclareOptions>(&json).unwrap(), options);
    }

    #[test]
    fn recover_defaults_to_requeue() {
        assert!(BasicRecoverOptions::default().requeue);
    }
}
