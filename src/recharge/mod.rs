//! Recharge Module
//!
//! Recharge job lifecycle: creation from queued requests, operator claims,
//! and resolution with bounded retries.
//!
//! # Architecture
//!
//! ```text
//! Consumer ──▶ RechargeService::create ──▶ RechargeStore (memory | PostgreSQL)
//!                      │                          ▲
//! Operator ──▶ claim / resolve ───────────────────┘
//!                      │
//!                      ├──▶ StatusNotifier   (signed webhook, best effort)
//!                      └──▶ ResponsePublisher (Producer, response queue)
//! ```

pub mod db;
pub mod error;
pub mod notifier;
pub mod service;
pub mod state;
pub mod store;
pub mod types;


pub use db::PgRechargeStore;
pub use error::RechargeError;
pub use notifier::{NotifyResult, StatusNotifier, WebhookNotifier};
pub use service::{DEFAULT_RETRY_BUDGET, RechargeService, ResponsePublisher};
pub use state::RechargeStatus;
pub use store::{InMemoryRechargeStore, InsertOutcome, RechargeStore};
pub use types::{
    Amount, ClaimOutcome, ClaimTicket, RechargeId, RechargeJob, RechargeMessage, Resolution,
    ResolveOutcome, ResponseEvent, StatusPayload, WebhookStatus,
};
