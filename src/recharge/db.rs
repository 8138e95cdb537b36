//! Recharge Database Layer
//!
//! PostgreSQL-backed [`RechargeStore`]. Claims run as a single
//! `UPDATE ... WHERE seq = (SELECT ... FOR UPDATE SKIP LOCKED)` statement so
//! concurrent claimers never pick the same row; every other mutation is a CAS
//! on `(status, retry_count)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::error::RechargeError;
use super::state::RechargeStatus;
use super::store::{InsertOutcome, RechargeStore};
use super::types::{Amount, RechargeId, RechargeJob};

const SCHEMA: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS recharges_tb (
        seq          BIGSERIAL PRIMARY KEY,
        recharge_id  VARCHAR(64)    NOT NULL UNIQUE,
        user_id      VARCHAR(64),
        phone_number VARCHAR(32)    NOT NULL,
        operator     VARCHAR(32)    NOT NULL,
        amount       NUMERIC(20, 4) NOT NULL,
        status       VARCHAR(16)    NOT NULL DEFAULT 'pending',
        retry_count  INTEGER        NOT NULL DEFAULT 0,
        description  TEXT           NOT NULL DEFAULT '',
        created_at   TIMESTAMPTZ    NOT NULL,
        updated_at   TIMESTAMPTZ    NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_recharges_claim
        ON recharges_tb (status, created_at, seq)
    "#,
];

const COLUMNS: &str = "recharge_id, user_id, phone_number, operator, amount, status, \
                       retry_count, description, created_at, updated_at";

pub struct PgRechargeStore {
    pool: PgPool,
}

impl PgRechargeStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the table and claim index if missing
    pub async fn ensure_schema(&self) -> Result<(), RechargeError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("Recharge schema ready");
        Ok(())
    }

    fn row_to_job(row: &PgRow) -> Result<RechargeJob, RechargeError> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<RechargeStatus>()
            .map_err(RechargeError::DatabaseError)?;

        let retry_count: i32 = row.try_get("retry_count")?;
        let retry_count = u32::try_from(retry_count).map_err(|_| {
            RechargeError::DatabaseError(format!("Invalid retry_count: {}", retry_count))
        })?;

        let amount: rust_decimal::Decimal = row.try_get("amount")?;

        Ok(RechargeJob {
            id: RechargeId::new(row.try_get::<String, _>("recharge_id")?),
            user_id: row.try_get("user_id")?,
            phone_number: row.try_get("phone_number")?,
            operator: row.try_get("operator")?,
            amount: Amount::new(amount),
            status,
            retry_count,
            description: row.try_get("description")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn exists(&self, id: &RechargeId) -> Result<bool, RechargeError> {
        let found = sqlx::query_scalar::<_, i64>("SELECT seq FROM recharges_tb WHERE recharge_id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl RechargeStore for PgRechargeStore {
    async fn insert_if_absent(&self, job: &RechargeJob) -> Result<InsertOutcome, RechargeError> {
        let result = sqlx::query(
            r#"
            INSERT INTO recharges_tb
                (recharge_id, user_id, phone_number, operator, amount, status,
                 retry_count, description, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (recharge_id) DO NOTHING
            "#,
        )
        .bind(job.id.as_str())
        .bind(&job.user_id)
        .bind(&job.phone_number)
        .bind(&job.operator)
        .bind(job.amount.value())
        .bind(job.status.as_str())
        .bind(job.retry_count as i32)
        .bind(&job.description)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::AlreadyExists)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn get(&self, id: &RechargeId) -> Result<Option<RechargeJob>, RechargeError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM recharges_tb WHERE recharge_id = $1",
            COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn claim_next(
        &self,
        retry_budget: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<RechargeJob>, RechargeError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE recharges_tb
            SET retry_count = retry_count + 1, status = 'processing', updated_at = $2
            WHERE seq = (
                SELECT seq FROM recharges_tb
                WHERE status IN ('pending', 'processing') AND retry_count < $1
                ORDER BY created_at ASC, seq ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(retry_budget as i32)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn update_if(
        &self,
        job: &RechargeJob,
        expected_status: RechargeStatus,
        expected_retry: u32,
    ) -> Result<bool, RechargeError> {
        let result = sqlx::query(
            r#"
            UPDATE recharges_tb
            SET status = $1, retry_count = $2, description = $3, updated_at = $4
            WHERE recharge_id = $5 AND status = $6 AND retry_count = $7
            "#,
        )
        .bind(job.status.as_str())
        .bind(job.retry_count as i32)
        .bind(&job.description)
        .bind(job.updated_at)
        .bind(job.id.as_str())
        .bind(expected_status.as_str())
        .bind(expected_retry as i32)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if !self.exists(&job.id).await? {
            return Err(RechargeError::NotFound(job.id.to_string()));
        }
        Ok(false)
    }
}
