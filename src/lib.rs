//! Recharge Relay
//!
//! Fulfillment pipeline for mobile top-up requests: a resilient AMQP
//! producer/consumer pair around durable queues, and the recharge state
//! machine that governs claims, bounded retries and terminal outcomes.
//!
//! # Modules
//!
//! - [`broker`] - Queue transport traits, connection supervision, AMQP and in-process brokers
//! - [`messaging`] - Buffering producer and retrying consumer
//! - [`recharge`] - Recharge jobs: storage, state machine, webhook notifier
//! - [`health`] - Combined producer/consumer health report
//! - [`config`] - YAML configuration with environment overrides
//! - [`logging`] - tracing subscriber setup

pub mod broker;
pub mod config;
pub mod health;
pub mod logging;
pub mod messaging;
pub mod recharge;

// Convenient re-exports at crate root
pub use broker::{AmqpBroker, Broker, BrokerError, InMemoryBroker};
pub use config::{AppConfig, ConfigError};
pub use health::HealthReport;
pub use messaging::{Consumer, MessageHandler, Producer, SendOutcome};
pub use recharge::{RechargeError, RechargeService, RechargeStatus, RechargeStore};
