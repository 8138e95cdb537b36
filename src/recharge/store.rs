//! Recharge job storage port and its in-memory implementation

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::error::RechargeError;
use super::state::RechargeStatus;
use super::types::{RechargeId, RechargeJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A job with the same id exists; nothing was written
    AlreadyExists,
}

/// Persistence for recharge jobs.
///
/// Every mutation of an existing job goes through [`RechargeStore::update_if`]
/// (compare-and-set on status and retry count) or the atomic
/// [`RechargeStore::claim_next`].
#[async_trait]
pub trait RechargeStore: Send + Sync {
    async fn insert_if_absent(&self, job: &RechargeJob) -> Result<InsertOutcome, RechargeError>;

    async fn get(&self, id: &RechargeId) -> Result<Option<RechargeJob>, RechargeError>;

    /// Take the oldest non-terminal job with `retry_count < retry_budget`:
    /// increment its retry count and move it to `processing`, atomically.
    async fn claim_next(
        &self,
        retry_budget: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<RechargeJob>, RechargeError>;

    /// Overwrite `job` only if the stored row still has `expected_status` and
    /// `expected_retry`. Returns whether the write happened.
    async fn update_if(
        &self,
        job: &RechargeJob,
        expected_status: RechargeStatus,
        expected_retry: u32,
    ) -> Result<bool, RechargeError>;
}

#[derive(Default)]
struct MemoryState {
    /// Insertion order breaks `created_at` ties
    jobs: Vec<RechargeJob>,
    index: HashMap<RechargeId, usize>,
}

/// Process-local store used by `storage.kind: memory` and tests
#[derive(Default)]
pub struct InMemoryRechargeStore {
    state: Mutex<MemoryState>,
}

impl InMemoryRechargeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RechargeStore for InMemoryRechargeStore {
    async fn insert_if_absent(&self, job: &RechargeJob) -> Result<InsertOutcome, RechargeError> {
        let mut state = self.state.lock();
        if state.index.contains_key(&job.id) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        let position = state.jobs.len();
        state.index.insert(job.id.clone(), position);
        state.jobs.push(job.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, id: &RechargeId) -> Result<Option<RechargeJob>, RechargeError> {
        let state = self.state.lock();
        Ok(state.index.get(id).map(|&i| state.jobs[i].clone()))
    }

    async fn claim_next(
        &self,
        retry_budget: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<RechargeJob>, RechargeError> {
        let mut state = self.state.lock();
        let candidate = state
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.status.is_claimable() && j.retry_count < retry_budget)
            .min_by_key(|(i, j)| (j.created_at, *i))
            .map(|(i, _)| i);

        let Some(position) = candidate else {
            return Ok(None);
        };
        let job = &mut state.jobs[position];
        job.retry_count += 1;
        job.status = RechargeStatus::Processing;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn update_if(
        &self,
        job: &RechargeJob,
        expected_status: RechargeStatus,
        expected_retry: u32,
    ) -> Result<bool, RechargeError> {
        let mut state = self.state.lock();
        let Some(&position) = state.index.get(&job.id) else {
            return Err(RechargeError::NotFound(job.id.to_string()));
        };
        let stored = &mut state.jobs[position];
        if stored.status != expected_status || stored.retry_count != expected_retry {
            return Ok(false);
        }
        *stored = RechargeJob {
            created_at: stored.created_at,
            ..job.clone()
        };
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recharge::types::{Amount, RechargeMessage};
    use chrono::Duration;

    fn job(id: &str, created_at: DateTime<Utc>) -> RechargeJob {
        let message = RechargeMessage {
            recharge_id: RechargeId::from(id),
            user_id: None,
            phone_number: "01711000000".into(),
            operator: "GP".into(),
            amount: "10".parse::<Amount>().unwrap(),
            retry_count: None,
        };
        RechargeJob::from_message(&message, created_at)
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = InMemoryRechargeStore::new();
        let j = job("a", Utc::now());
        assert_eq!(store.insert_if_absent(&j).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(
            store.insert_if_absent(&j).await.unwrap(),
            InsertOutcome::AlreadyExists
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_takes_oldest_first() {
        let store = InMemoryRechargeStore::new();
        let now = Utc::now();
        store.insert_if_absent(&job("newer", now)).await.unwrap();
        store
            .insert_if_absent(&job("older", now - Duration::seconds(5)))
            .await
            .unwrap();
        store.insert_if_absent(&job("tie", now)).await.unwrap();

        let first = store.claim_next(2, now).await.unwrap().unwrap();
        assert_eq!(first.id.as_str(), "older");
        assert_eq!(first.status, RechargeStatus::Processing);
        assert_eq!(first.retry_count, 1);

        // equal created_at: insertion order decides
        let mut claimed = Vec::new();
        for _ in 0..3 {
            claimed.push(store.claim_next(2, now).await.unwrap().unwrap().id);
        }
        let ids: Vec<_> = claimed.iter().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["older", "newer", "newer"]);
    }

    #[tokio::test]
    async fn test_claim_respects_budget_and_terminal_states() {
        let store = InMemoryRechargeStore::new();
        let now = Utc::now();
        let mut done = job("done", now - Duration::seconds(10));
        done.status = RechargeStatus::Completed;
        store.insert_if_absent(&done).await.unwrap();
        store.insert_if_absent(&job("live", now)).await.unwrap();

        assert_eq!(store.claim_next(2, now).await.unwrap().unwrap().id.as_str(), "live");
        assert_eq!(store.claim_next(2, now).await.unwrap().unwrap().id.as_str(), "live");
        assert!(store.claim_next(2, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_if_compares_status_and_retry() {
        let store = InMemoryRechargeStore::new();
        let now = Utc::now();
        store.insert_if_absent(&job("a", now)).await.unwrap();
        let claimed = store.claim_next(2, now).await.unwrap().unwrap();

        let mut resolved = claimed.clone();
        resolved.status = RechargeStatus::Completed;
        resolved.description = "ok".into();

        assert!(!store
            .update_if(&resolved, RechargeStatus::Pending, claimed.retry_count)
            .await
            .unwrap());
        assert!(!store
            .update_if(&resolved, RechargeStatus::Processing, 0)
            .await
            .unwrap());
        assert!(store
            .update_if(&resolved, RechargeStatus::Processing, claimed.retry_count)
            .await
            .unwrap());

        let stored = store.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RechargeStatus::Completed);
        assert_eq!(stored.description, "ok");
        assert_eq!(stored.created_at, claimed.created_at);
    }

    #[tokio::test]
    async fn test_update_unknown_job() {
        let store = InMemoryRechargeStore::new();
        let err = store
            .update_if(&job("ghost", Utc::now()), RechargeStatus::Pending, 0)
            .await
            .unwrap_err();
        assert_eq!(err, RechargeError::NotFound("ghost".into()));
    }
}
