//! Recharge State Machine
//!
//! Owns every job transition:
//!
//! | Operation        | From                 | To                              | Side effects                     |
//! |------------------|----------------------|---------------------------------|----------------------------------|
//! | create           | (none)               | pending                         | `pending` webhook                |
//! | claim            | pending, processing  | processing, `retry_count += 1`  | none                             |
//! | resolve success  | pending, processing  | completed                       | `success` webhook, response event|
//! | resolve failure  | pending, processing  | pending, or failed at budget    | `pending` / `failed` webhook     |
//!
//! Side effects run after the state is persisted and never fail the call.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use super::error::RechargeError;
use super::notifier::StatusNotifier;
use super::state::RechargeStatus;
use super::store::{InsertOutcome, RechargeStore};
use super::types::{
    ClaimOutcome, RechargeJob, RechargeMessage, Resolution, ResolveOutcome, ResponseEvent,
    StatusPayload, WebhookStatus,
};
use crate::messaging::{
    BusinessFailure, MessageHandler, Producer, ProducerError, PublishOptions, SendOutcome,
};

/// Fulfillment attempts allowed per job
pub const DEFAULT_RETRY_BUDGET: u32 = 2;

/// Sink for "execute top-up" events
#[async_trait]
pub trait ResponsePublisher: Send + Sync {
    async fn publish_response(&self, event: &ResponseEvent) -> Result<SendOutcome, ProducerError>;
}

#[async_trait]
impl ResponsePublisher for Producer {
    async fn publish_response(&self, event: &ResponseEvent) -> Result<SendOutcome, ProducerError> {
        self.send_json(event, PublishOptions::default()).await
    }
}

pub struct RechargeService {
    store: Arc<dyn RechargeStore>,
    notifier: Arc<dyn StatusNotifier>,
    publisher: Arc<dyn ResponsePublisher>,
    retry_budget: u32,
}

impl RechargeService {
    pub fn new(
        store: Arc<dyn RechargeStore>,
        notifier: Arc<dyn StatusNotifier>,
        publisher: Arc<dyn ResponsePublisher>,
    ) -> Self {
        Self {
            store,
            notifier,
            publisher,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }

    pub fn with_retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = retry_budget.max(1);
        self
    }

    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    pub fn validate(message: &RechargeMessage) -> Result<(), RechargeError> {
        if message.recharge_id.is_blank() {
            return Err(RechargeError::MissingField("rechargeId"));
        }
        if message.phone_number.trim().is_empty() {
            return Err(RechargeError::MissingField("phoneNumber"));
        }
        if message.operator.trim().is_empty() {
            return Err(RechargeError::MissingField("operator"));
        }
        if !message.amount.is_positive() || message.amount.checked_whole_units().is_none() {
            return Err(RechargeError::InvalidAmount);
        }
        Ok(())
    }

    /// Persist a new pending job. Redelivery of a known id is a no-op.
    pub async fn create(&self, message: RechargeMessage) -> Result<InsertOutcome, RechargeError> {
        Self::validate(&message)?;

        let job = RechargeJob::from_message(&message, Utc::now());
        let outcome = self.store.insert_if_absent(&job).await?;
        match outcome {
            InsertOutcome::Inserted => {
                info!(
                    recharge_id = %job.id,
                    operator = %job.operator,
                    amount = %job.amount,
                    "Recharge request created"
                );
                let mut payload = StatusPayload::for_job(&job, WebhookStatus::Pending);
                payload.retry_count = message.retry_count.unwrap_or(0);
                self.send_webhook(payload).await;
            }
            InsertOutcome::AlreadyExists => {
                info!(recharge_id = %job.id, "Recharge request already recorded, skipping");
            }
        }
        Ok(outcome)
    }

    /// Hand the oldest eligible job to an operator
    pub async fn claim(&self) -> Result<ClaimOutcome, RechargeError> {
        match self.store.claim_next(self.retry_budget, Utc::now()).await? {
            Some(job) => {
                info!(
                    recharge_id = %job.id,
                    retry_count = job.retry_count,
                    "Recharge claimed"
                );
                Ok(ClaimOutcome::Claimed(job.ticket()))
            }
            None => Ok(ClaimOutcome::Empty),
        }
    }

    /// Record the operator's verdict on a job
    pub async fn resolve(&self, resolution: Resolution) -> Result<ResolveOutcome, RechargeError> {
        let job = self
            .store
            .get(&resolution.recharge_id)
            .await?
            .ok_or_else(|| RechargeError::NotFound(resolution.recharge_id.to_string()))?;

        if job.status.is_terminal() {
            warn!(recharge_id = %job.id, status = %job.status, "Resolve rejected for terminal job");
            return Err(RechargeError::AlreadyTerminal {
                id: job.id.to_string(),
                status: job.status,
            });
        }

        let mut next = job.clone();
        next.description = resolution.description;
        next.updated_at = Utc::now();

        let webhook_status = if resolution.is_success {
            next.status = RechargeStatus::Completed;
            WebhookStatus::Success
        } else {
            next.retry_count = (job.retry_count + 1).min(self.retry_budget);
            if next.retry_count >= self.retry_budget {
                next.status = RechargeStatus::Failed;
                WebhookStatus::Failed
            } else {
                next.status = RechargeStatus::Pending;
                WebhookStatus::Pending
            }
        };
        debug_assert!(job.status.can_transition_to(next.status));

        if !self
            .store
            .update_if(&next, job.status, job.retry_count)
            .await?
        {
            warn!(recharge_id = %job.id, "Resolve lost a race with a concurrent update");
            return Err(RechargeError::ConcurrentModification(job.id.to_string()));
        }

        info!(
            recharge_id = %next.id,
            from = %job.status,
            to = %next.status,
            retry_count = next.retry_count,
            "Recharge resolved"
        );

        self.send_webhook(StatusPayload::for_job(&next, webhook_status))
            .await;
        if resolution.is_success {
            self.send_response(&next).await;
        }

        Ok(ResolveOutcome {
            status: next.status,
            retry_count: next.retry_count,
        })
    }

    async fn send_webhook(&self, payload: StatusPayload) {
        let result = self.notifier.notify(&payload).await;
        if result.ok {
            info!(
                recharge_id = %payload.recharge_id,
                status = payload.status.as_str(),
                http_status = ?result.status,
                "Webhook delivered"
            );
        } else {
            warn!(
                recharge_id = %payload.recharge_id,
                status = payload.status.as_str(),
                http_status = ?result.status,
                error = ?result.error,
                "Webhook not delivered"
            );
        }
    }

    async fn send_response(&self, job: &RechargeJob) {
        match self.publisher.publish_response(&ResponseEvent::from(job)).await {
            Ok(SendOutcome::Published { message_id }) => {
                info!(recharge_id = %job.id, message_id = %message_id, "Response event published")
            }
            Ok(SendOutcome::Buffered {
                message_id,
                buffered,
            }) => {
                warn!(recharge_id = %job.id, message_id = %message_id, buffered, "Response event buffered")
            }
            Err(e) => error!(recharge_id = %job.id, error = %e, "Failed to enqueue response event"),
        }
    }
}

#[async_trait]
impl MessageHandler for RechargeService {
    type Message = RechargeMessage;

    async fn handle(&self, message: RechargeMessage) -> Result<(), BusinessFailure> {
        let recharge_id = message.recharge_id.clone();
        self.create(message).await.map(|_| ()).map_err(|e| {
            warn!(recharge_id = %recharge_id, code = e.code(), error = %e, "Recharge creation failed");
            BusinessFailure::new(e.to_string())
        })
    }
}
