//! garenne
//!
//! garenne is an asynchronous client for the AMQP 0-9-1 protocol, as spoken
//! by RabbitMQ and compatible brokers. It handles the connection handshake,
//! heartbeats, framing, the channel lifecycle and flow control, and exposes
//! the protocol operations as plain `async` methods.
//!
//! A connection carries exactly one application channel. When the broker
//! kills that channel with a soft error (say, a passive declare of a
//! missing queue), the channel is transparently reopened under a fresh
//! number and publisher-confirms mode is restored, so the handles you hold
//! keep working.
//!
//! ## Example
//!
//! ```rust,no_run
//! use garenne::{
//!     options::*, types::FieldTable, BasicProperties, Connection, ConnectionProperties,
//!     ConsumerDelegate, message::DeliveryResult,
//! };
//! use async_trait::async_trait;
//!
//! #[derive(Clone, Debug)]
//! struct Subscriber;
//!
//! #[async_trait]
//! impl ConsumerDelegate for Subscriber {
//!     async fn on_new_delivery(&self, delivery: DeliveryResult) {
//!         if let Ok(Some(delivery)) = delivery {
//!             println!("received message: {:?}", delivery.delivery_tag);
//!         }
//!     }
//! }
//!
//! async fn consume() -> garenne::Result<()> {
//!     let addr = std::env::var("AMQP_ADDR")
//!         .unwrap_or_else(|_| "amqp://127.0.0.1:5672/%2f".into());
//!     let conn = Connection::connect(&addr, ConnectionProperties::default()).await?;
//!     let channel = conn.channel();
//!     channel
//!         .queue_declare("hello", QueueDeclareOptions::default(), FieldTable::default())
//!         .await?;
//!     let consumer = channel
//!         .basic_consume(
//!             "hello",
//!             "my_consumer",
//!             BasicConsumeOptions::default(),
//!             FieldTable::default(),
//!         )
//!         .await?;
//!     consumer.set_delegate(Subscriber);
//!     Ok(())
//! }
//! ```

pub use amq_protocol::{auth, protocol, tcp, types, uri};

pub use channel::Channel;
pub use channel_status::{ChannelState, ChannelStatus};
pub use configuration::Configuration;
pub use connection::{Connect, Connection};
pub use connection_properties::ConnectionProperties;
pub use connection_status::{ConnectionState, ConnectionStatus};
pub use consumer::{Consumer, ConsumerDelegate};
pub use error::{Error, Result};
pub use exchange::ExchangeKind;
pub use publisher_confirm::{Confirmation, PublisherConfirm};
pub use queue::Queue;

pub use async_trait::async_trait;

/// A message's properties, as carried by its content header frame
pub type BasicProperties = protocol::basic::AMQPProperties;

/// The future returned by the `Connect` trait implementations
pub type Promise<T> = pinky_swear::PinkySwear<Result<T>>;
pub(crate) type PromiseResolver<T> = pinky_swear::Pinky<Result<T>>;

pub mod message;
pub mod options;

mod acknowledgement;
mod buffer;
mod channel;
mod channel_receiver_state;
mod channel_status;
mod channels;
mod configuration;
mod connection;
mod connection_closer;
mod connection_properties;
mod connection_status;
mod consumer;
mod consumers;
mod error;
mod error_handler;
mod exchange;
mod frames;
mod heartbeat;
mod id_sequence;
mod internal_rpc;
mod io_loop;
mod killswitch;
mod publisher_confirm;
mod queue;
mod returned_messages;
mod socket_state;
mod stream;
