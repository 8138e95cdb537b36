//! Recharge domain types and wire payloads

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::state::RechargeStatus;

/// Opaque recharge identifier. Locally generated ids are ULIDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RechargeId(String);

impl RechargeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for RechargeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RechargeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Recharge amount.
///
/// Accepted on the wire as a JSON string or number; always written as a string
/// so no precision is lost downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    /// Integer part, or `None` when it does not fit in an i64
    pub fn checked_whole_units(&self) -> Option<i64> {
        self.0.trunc().to_i64()
    }

    /// Integer part, as the admin panel expects it; saturates at the i64 range
    pub fn whole_units(&self) -> i64 {
        self.checked_whole_units().unwrap_or(if self.0.is_sign_negative() {
            i64::MIN
        } else {
            i64::MAX
        })
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

impl FromStr for Amount {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s.trim()).map(Self)
    }
}

impl From<Decimal> for Amount {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct AmountVisitor;

impl Visitor<'_> for AmountVisitor {
    type Value = Amount;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a decimal amount as a string or number")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
        v.parse().map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
        Ok(Amount(Decimal::from(v)))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
        Ok(Amount(Decimal::from(v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Amount, E> {
        Decimal::try_from(v).map(Amount).map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(AmountVisitor)
    }
}

/// Creation request as published to the request queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RechargeMessage {
    pub recharge_id: RechargeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub phone_number: String,
    pub operator: String,
    pub amount: Amount,
    /// Echoed into the creation webhook
    #[serde(default, rename = "retry_count", skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

/// A persisted recharge job
#[derive(Debug, Clone, PartialEq)]
pub struct RechargeJob {
    pub id: RechargeId,
    pub user_id: Option<String>,
    pub phone_number: String,
    pub operator: String,
    pub amount: Amount,
    pub status: RechargeStatus,
    /// Fulfillment attempts consumed (claims and failed resolutions)
    pub retry_count: u32,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RechargeJob {
    /// New pending job for a creation request
    pub fn from_message(message: &RechargeMessage, now: DateTime<Utc>) -> Self {
        Self {
            id: message.recharge_id.clone(),
            user_id: message.user_id.clone(),
            phone_number: message.phone_number.clone(),
            operator: message.operator.clone(),
            amount: message.amount,
            status: RechargeStatus::Pending,
            retry_count: 0,
            description: format!("Recharge via queue: {}", message.recharge_id),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn ticket(&self) -> ClaimTicket {
        ClaimTicket {
            recharge_id: self.id.clone(),
            phone_number: self.phone_number.clone(),
            operator: self.operator.clone(),
            amount: self.amount,
        }
    }
}

/// What an operator receives when claiming work
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimTicket {
    pub recharge_id: RechargeId,
    pub phone_number: String,
    pub operator: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(ClaimTicket),
    /// No eligible job
    Empty,
}

/// Admin verdict on a claimed job
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub recharge_id: RechargeId,
    pub is_success: bool,
    #[serde(default)]
    pub description: String,
}

/// Outcome of a resolve call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOutcome {
    pub status: RechargeStatus,
    pub retry_count: u32,
}

/// "Execute top-up" event for the downstream worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEvent {
    pub recharge_id: RechargeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub phone_number: String,
    pub operator: String,
    pub amount: Amount,
    pub status: RechargeStatus,
    pub description: String,
}

impl From<&RechargeJob> for ResponseEvent {
    fn from(job: &RechargeJob) -> Self {
        Self {
            recharge_id: job.id.clone(),
            user_id: job.user_id.clone(),
            phone_number: job.phone_number.clone(),
            operator: job.operator.clone(),
            amount: job.amount,
            status: job.status,
            description: job.description.clone(),
        }
    }
}

/// Status label reported to the admin panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Pending,
    Success,
    Failed,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Pending => "pending",
            WebhookStatus::Success => "success",
            WebhookStatus::Failed => "failed",
        }
    }
}

/// Webhook body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub recharge_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub phone_number: String,
    pub operator: String,
    pub amount: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub updated_source: String,
    pub status: WebhookStatus,
    pub is_success: u8,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusPayload {
    pub const SOURCE: &'static str = "api";

    pub fn for_job(job: &RechargeJob, status: WebhookStatus) -> Self {
        Self {
            recharge_id: job.id.to_string(),
            user_id: job.user_id.clone(),
            phone_number: job.phone_number.clone(),
            operator: job.operator.clone(),
            amount: job.amount.whole_units(),
            transaction_id: None,
            updated_source: Self::SOURCE.to_string(),
            status,
            is_success: u8::from(status == WebhookStatus::Success),
            retry_count: job.retry_count,
            message: Some(job.description.clone()).filter(|m| !m.is_empty()),
        }
    }
}
