//! Queue Transport
//!
//! Thin durable-queue abstraction used by the producer and the consumer.
//!
//! # Layers
//!
//! ```text
//! Producer / Consumer
//!        │
//! ConnectionManager   (one per role: connect, track channels, close, stats)
//!        │
//! Broker ─▶ BrokerConnection ─▶ BrokerChannel
//!   ├── AmqpBroker      (lapin, RabbitMQ)
//!   └── InMemoryBroker  (in-process, local runs and tests)
//! ```
//!
//! Connection-level failures are not callbacks: every opened connection comes
//! with a [`ConnectionEvents`] receiver, and the owner feeds each event to
//! [`ConnectionManager::handle_event`], which applies the state transition.

pub mod amqp;
pub mod connection;
pub mod error;
pub mod memory;

pub use amqp::AmqpBroker;
pub use connection::{
    Connected, ConnectionManager, ConnectionState, ConnectionStats, ReconnectPolicy, Transition,
};
pub use error::BrokerError;
pub use memory::InMemoryBroker;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

/// Header carrying the number of in-queue retries already performed
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";
/// Header carrying the epoch-millis timestamp of the first delivery attempt
pub const HEADER_ORIGINAL_TIMESTAMP: &str = "x-original-timestamp";

/// Integer-valued message headers.
///
/// Only integer headers are used operationally; anything else coming off the
/// wire is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders(BTreeMap<String, i64>);

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Headers for a scheduled retry republish
    pub fn for_retry(retry_count: u32, original_timestamp_ms: i64) -> Self {
        let mut headers = Self::new();
        headers.insert(HEADER_RETRY_COUNT, i64::from(retry_count));
        headers.insert(HEADER_ORIGINAL_TIMESTAMP, original_timestamp_ms);
        headers
    }

    pub fn insert(&mut self, key: impl Into<String>, value: i64) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.0.get(key).copied()
    }

    /// `x-retry-count`, defaulting to 0 when absent or negative
    pub fn retry_count(&self) -> u32 {
        self.get(HEADER_RETRY_COUNT)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0)
    }

    pub fn original_timestamp(&self) -> Option<i64> {
        self.get(HEADER_ORIGINAL_TIMESTAMP)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Properties attached to a published message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Survive broker restarts (delivery mode 2)
    pub persistent: bool,
    pub message_id: Option<String>,
    /// Epoch millis
    pub timestamp: Option<u64>,
    pub content_type: Option<String>,
    pub headers: MessageHeaders,
}

/// A single delivery handed to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub body: Vec<u8>,
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub redelivered: bool,
    pub headers: MessageHeaders,
}

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Error(String),
    Closed,
}

/// Receiver half of a connection's lifecycle notifications
pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Stream of deliveries for one consumer subscription.
///
/// Ends (or yields an error) when the channel or connection goes away.
pub type DeliveryStream = BoxStream<'static, Result<QueueMessage, BrokerError>>;

/// A message broker that connections can be opened against
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new connection.
    ///
    /// The returned receiver yields connection-level error/close events for
    /// this connection only.
    async fn connect(&self)
    -> Result<(Arc<dyn BrokerConnection>, ConnectionEvents), BrokerError>;
}

/// One live broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Channel-scoped queue operations
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a named queue (no-op when it already exists with the same durability)
    async fn assert_queue(&self, queue: &str, durable: bool) -> Result<(), BrokerError>;

    /// Cap the number of unacknowledged deliveries on this channel
    async fn prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Switch the channel into publisher-confirm mode
    async fn confirm_select(&self) -> Result<(), BrokerError>;

    /// Publish to a queue through the default exchange.
    ///
    /// In confirm mode this resolves only once the broker has acknowledged the
    /// message, failing with [`BrokerError::PublishUnconfirmed`] on a nack.
    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError>;

    /// Subscribe with manual acknowledgement
    async fn consume(&self, queue: &str, consumer_tag: &str)
    -> Result<DeliveryStream, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;

    fn is_closing(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Current wall-clock time in epoch millis
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
