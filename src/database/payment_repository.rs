use crate::database::error::{DatabaseError, DbResult};
use crate::database::repository::PaymentStore;
use crate::database::transaction::DatabaseTransaction;
use crate::database::voucher_repository::VoucherCode;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use std::fmt;
use tracing::{debug, warn};

/// Lifecycle of a payment attempt. `Successful` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Processing,
    Successful,
    Failed,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Successful | PaymentStatus::Failed)
    }

    pub fn to_db_status(&self) -> &'static str {
        match self {
            PaymentStatus::Processing => "processing",
            PaymentStatus::Successful => "successful",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn from_db_status(status: &str) -> Option<Self> {
        match status {
            "processing" => Some(PaymentStatus::Processing),
            "successful" => Some(PaymentStatus::Successful),
            "failed" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_status())
    }
}

/// Durable record of one payment attempt, keyed by reference
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentRecord {
    pub reference: String,
    pub subscriber: String,
    pub denomination: i64,
    pub provider_transaction_id: Option<String>,
    pub provider: Option<String>,
    pub status: PaymentStatus,
    pub voucher_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields needed to open a payment in `Processing`
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub reference: String,
    pub subscriber: String,
    pub denomination: i64,
    pub provider: Option<String>,
}

impl PaymentRecord {
    pub fn processing(new: NewPayment, now: DateTime<Utc>) -> Self {
        Self {
            reference: new.reference,
            subscriber: new.subscriber,
            denomination: new.denomination,
            provider_transaction_id: None,
            provider: new.provider,
            status: PaymentStatus::Processing,
            voucher_code: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Result of a compare-and-swap on the payment status
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(PaymentRecord),
    /// The record had already left `Processing`; nothing was written
    NotProcessing(PaymentRecord),
    Missing,
}

/// Result of the combined voucher-consume and payment-complete unit
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Assigned {
        payment: PaymentRecord,
        voucher: VoucherCode,
    },
    /// The voucher was consumed by someone else first; nothing was written
    VoucherTaken,
    /// The payment had already left `Processing`; nothing was written
    NotProcessing(PaymentRecord),
    Missing,
}

#[derive(Debug, FromRow)]
struct PaymentRow {
    reference: String,
    subscriber: String,
    denomination: i64,
    provider_transaction_id: Option<String>,
    provider: Option<String>,
    status: String,
    voucher_code: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<PaymentRow> for PaymentRecord {
    type Error = DatabaseError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let status = PaymentStatus::from_db_status(&row.status).ok_or_else(|| {
            DatabaseError::decode(format!(
                "payment {} has unknown status '{}'",
                row.reference, row.status
            ))
        })?;

        Ok(PaymentRecord {
            reference: row.reference,
            subscriber: row.subscriber,
            denomination: row.denomination,
            provider_transaction_id: row.provider_transaction_id,
            provider: row.provider,
            status,
            voucher_code: row.voucher_code,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

const PAYMENT_COLUMNS: &str = "reference, subscriber, denomination, provider_transaction_id, provider, \
     status, voucher_code, created_at, updated_at, completed_at";

/// Postgres-backed payment records
#[derive(Clone)]
pub struct PaymentRepository {
    pool: PgPool,
}

impl PaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, reference: &str) -> DbResult<Option<PaymentRecord>> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments WHERE reference = $1",
            PAYMENT_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        row.map(PaymentRecord::try_from).transpose()
    }

    /// Resolve a CAS that touched zero rows into `NotProcessing` or `Missing`
    async fn unchanged(&self, reference: &str) -> DbResult<Transition> {
        Ok(match self.fetch(reference).await? {
            Some(record) => Transition::NotProcessing(record),
            None => Transition::Missing,
        })
    }
}

#[async_trait]
impl PaymentStore for PaymentRepository {
    async fn insert(&self, new: NewPayment) -> DbResult<PaymentRecord> {
        let reference = new.reference.clone();
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "INSERT INTO payments (reference, subscriber, denomination, provider, status)
             VALUES ($1, $2, $3, $4, 'processing')
             RETURNING {}",
            PAYMENT_COLUMNS
        ))
        .bind(&new.reference)
        .bind(&new.subscriber)
        .bind(new.denomination)
        .bind(&new.provider)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            let err = DatabaseError::from_sqlx(e);
            if err.is_unique_violation() {
                DatabaseError::duplicate("reference", &reference)
            } else {
                err
            }
        })?;

        PaymentRecord::try_from(row)
    }

    async fn insert_if_absent(&self, new: NewPayment) -> DbResult<(PaymentRecord, bool)> {
        let inserted = sqlx::query_as::<_, PaymentRow>(&format!(
            "INSERT INTO payments (reference, subscriber, denomination, provider, status)
             VALUES ($1, $2, $3, $4, 'processing')
             ON CONFLICT (reference) DO NOTHING
             RETURNING {}",
            PAYMENT_COLUMNS
        ))
        .bind(&new.reference)
        .bind(&new.subscriber)
        .bind(new.denomination)
        .bind(&new.provider)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        match inserted {
            Some(row) => Ok((PaymentRecord::try_from(row)?, true)),
            None => {
                let existing = self.fetch(&new.reference).await?.ok_or_else(|| {
                    DatabaseError::decode(format!(
                        "payment {} conflicted on insert but is not readable",
                        new.reference
                    ))
                })?;
                Ok((existing, false))
            }
        }
    }

    async fn find(&self, reference: &str) -> DbResult<Option<PaymentRecord>> {
        self.fetch(reference).await
    }

    async fn set_provider_transaction_id(
        &self,
        reference: &str,
        provider_transaction_id: &str,
    ) -> DbResult<()> {
        sqlx::query(
            "UPDATE payments SET provider_transaction_id = $2, updated_at = NOW()
             WHERE reference = $1",
        )
        .bind(reference)
        .bind(provider_transaction_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    async fn mark_failed(&self, reference: &str) -> DbResult<Transition> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "UPDATE payments
             SET status = 'failed', updated_at = NOW(), completed_at = NOW()
             WHERE reference = $1 AND status = 'processing'
             RETURNING {}",
            PAYMENT_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        match row {
            Some(row) => Ok(Transition::Applied(PaymentRecord::try_from(row)?)),
            None => self.unchanged(reference).await,
        }
    }

    async fn mark_successful_without_voucher(&self, reference: &str) -> DbResult<Transition> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "UPDATE payments
             SET status = 'successful', voucher_code = NULL, updated_at = NOW(), completed_at = NOW()
             WHERE reference = $1 AND status = 'processing'
             RETURNING {}",
            PAYMENT_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        match row {
            Some(row) => Ok(Transition::Applied(PaymentRecord::try_from(row)?)),
            None => self.unchanged(reference).await,
        }
    }

    async fn complete_with_voucher(
        &self,
        reference: &str,
        code: &str,
        subscriber: &str,
    ) -> DbResult<Assignment> {
        let mut tx = DatabaseTransaction::begin(&self.pool).await?;

        // Row lock on the payment serializes completions for one reference
        let locked = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments WHERE reference = $1 FOR UPDATE",
            PAYMENT_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(tx.conn()?)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let payment = match locked {
            Some(row) => PaymentRecord::try_from(row)?,
            None => {
                tx.rollback().await?;
                return Ok(Assignment::Missing);
            }
        };
        if payment.status != PaymentStatus::Processing {
            tx.rollback().await?;
            return Ok(Assignment::NotProcessing(payment));
        }

        let voucher = sqlx::query_as::<_, VoucherCode>(
            "UPDATE vouchers
             SET consumed = TRUE, assigned_to = $2, assigned_at = NOW(), originating_reference = $3
             WHERE code = $1 AND consumed = FALSE
             RETURNING code, denomination, consumed, assigned_to, assigned_at, originating_reference, created_at",
        )
        .bind(code)
        .bind(subscriber)
        .bind(reference)
        .fetch_optional(tx.conn()?)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let voucher = match voucher {
            Some(voucher) => voucher,
            None => {
                debug!(reference = %reference, code = %code, "voucher consumed concurrently");
                tx.rollback().await?;
                return Ok(Assignment::VoucherTaken);
            }
        };

        let completed = sqlx::query_as::<_, PaymentRow>(&format!(
            "UPDATE payments
             SET status = 'successful', voucher_code = $2, updated_at = NOW(), completed_at = NOW()
             WHERE reference = $1 AND status = 'processing'
             RETURNING {}",
            PAYMENT_COLUMNS
        ))
        .bind(reference)
        .bind(&voucher.code)
        .fetch_optional(tx.conn()?)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        match completed {
            Some(row) => {
                let payment = PaymentRecord::try_from(row)?;
                tx.commit().await?;
                Ok(Assignment::Assigned { payment, voucher })
            }
            None => {
                warn!(reference = %reference, "payment left processing while locked");
                tx.rollback().await?;
                Ok(match self.fetch(reference).await? {
                    Some(record) => Assignment::NotProcessing(record),
                    None => Assignment::Missing,
                })
            }
        }
    }

    async fn list_processing(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<PaymentRecord>> {
        let rows = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments
             WHERE status = 'processing' AND created_at < $1
             ORDER BY created_at ASC
             LIMIT $2",
            PAYMENT_COLUMNS
        ))
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        rows.into_iter().map(PaymentRecord::try_from).collect()
    }

    async fn ping(&self) -> DbResult<()> {
        crate::database::health_check(&self.pool).await
    }
}
