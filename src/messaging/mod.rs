//! Producer and consumer built on the queue transport.
//!
//! Each owns a separate [`ConnectionManager`](crate::broker::ConnectionManager)
//! and its own reconnect policy: the producer gives up after a bounded number
//! of attempts and keeps buffering, the consumer retries forever.

pub mod consumer;
pub mod producer;
mod supervisor;

pub use consumer::{
    BusinessFailure, Consumer, ConsumerConfig, ConsumerStats, DEFAULT_REQUEST_QUEUE, Disposition,
    MessageHandler, ProcessError,
};
pub use producer::{
    DEFAULT_RESPONSE_QUEUE, Producer, ProducerConfig, ProducerError, ProducerStats,
    PublishOptions, SendOutcome,
};
