use crate::database::error::{DatabaseError, DbResult};
use crate::database::repository::CallbackLedger;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use std::fmt;

/// In-flight claims older than this are considered abandoned and may be re-claimed
pub const STALE_CLAIM_SECS: i64 = 300;

/// Identity of one delivered event: `(reference, event_type, provider uuid)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CallbackKey {
    pub reference: String,
    pub event_type: String,
    pub provider_uuid: String,
}

impl CallbackKey {
    pub fn new(
        reference: impl Into<String>,
        event_type: impl Into<String>,
        provider_uuid: Option<&str>,
    ) -> Self {
        Self {
            reference: reference.into(),
            event_type: event_type.into(),
            provider_uuid: provider_uuid.unwrap_or_default().to_string(),
        }
    }
}

impl fmt::Display for CallbackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.reference, self.event_type, self.provider_uuid
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller owns the key; `attempt` starts at 1
    Fresh { attempt: i32 },
    Duplicate,
}

/// Postgres-backed callback ledger over `processed_callbacks`
#[derive(Clone)]
pub struct CallbackRepository {
    pool: PgPool,
}

impl CallbackRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CallbackLedger for CallbackRepository {
    async fn claim(&self, key: &CallbackKey) -> DbResult<ClaimOutcome> {
        // No row back means the key is processed or owned by a live attempt
        let claimed: Option<(i32,)> = sqlx::query_as(
            "INSERT INTO processed_callbacks (reference, event_type, provider_uuid, status, attempts)
             VALUES ($1, $2, $3, 'processing', 1)
             ON CONFLICT ON CONSTRAINT uq_processed_callbacks_key DO UPDATE
             SET status = 'processing',
                 attempts = processed_callbacks.attempts + 1,
                 last_error = NULL,
                 updated_at = NOW()
             WHERE processed_callbacks.status = 'failed'
                OR (processed_callbacks.status = 'processing'
                    AND processed_callbacks.updated_at < NOW() - make_interval(secs => $4))
             RETURNING attempts",
        )
        .bind(&key.reference)
        .bind(&key.event_type)
        .bind(&key.provider_uuid)
        .bind(STALE_CLAIM_SECS as f64)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(match claimed {
            Some((attempt,)) => ClaimOutcome::Fresh { attempt },
            None => ClaimOutcome::Duplicate,
        })
    }

    async fn mark_processed(&self, key: &CallbackKey) -> DbResult<()> {
        sqlx::query(
            "UPDATE processed_callbacks
             SET status = 'processed', updated_at = NOW()
             WHERE reference = $1 AND event_type = $2 AND provider_uuid = $3",
        )
        .bind(&key.reference)
        .bind(&key.event_type)
        .bind(&key.provider_uuid)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    async fn record_failure(&self, key: &CallbackKey, error: &str) -> DbResult<()> {
        sqlx::query(
            "UPDATE processed_callbacks
             SET status = 'failed', last_error = $4, updated_at = NOW()
             WHERE reference = $1 AND event_type = $2 AND provider_uuid = $3
               AND status = 'processing'",
        )
        .bind(&key.reference)
        .bind(&key.event_type)
        .bind(&key.provider_uuid)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    async fn count_processed(&self) -> DbResult<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM processed_callbacks WHERE status = 'processed'")
                .fetch_one(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?;

        Ok(count.0)
    }
}
