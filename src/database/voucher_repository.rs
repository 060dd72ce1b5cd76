use crate::database::error::{DatabaseError, DbResult};
use crate::database::repository::VoucherStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};

/// A voucher code tagged with its face value.
///
/// Once `consumed` is set the row is frozen; codes are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct VoucherCode {
    pub code: String,
    pub denomination: i64,
    pub consumed: bool,
    pub assigned_to: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub originating_reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl VoucherCode {
    pub fn available(code: impl Into<String>, denomination: i64, now: DateTime<Utc>) -> Self {
        Self {
            code: code.into(),
            denomination,
            consumed: false,
            assigned_to: None,
            assigned_at: None,
            originating_reference: None,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeOutcome {
    Consumed(VoucherCode),
    AlreadyConsumed,
    NotFound,
}

#[derive(Debug, Clone)]
pub struct VoucherFilter {
    pub denomination: Option<i64>,
    pub consumed: Option<bool>,
    pub limit: i64,
}

impl Default for VoucherFilter {
    fn default() -> Self {
        Self {
            denomination: None,
            consumed: None,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkInsertSummary {
    pub inserted: usize,
    /// Codes that already existed (or repeated within the batch)
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct DenominationStock {
    pub denomination: i64,
    pub available: i64,
    pub consumed: i64,
}

const VOUCHER_COLUMNS: &str =
    "code, denomination, consumed, assigned_to, assigned_at, originating_reference, created_at";

/// Postgres-backed voucher inventory
#[derive(Clone)]
pub struct VoucherRepository {
    pool: PgPool,
}

impl VoucherRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VoucherStore for VoucherRepository {
    async fn find_available(&self, denomination: i64) -> DbResult<Option<VoucherCode>> {
        // Skips only codes held by an in-flight completion transaction. The
        // lock ends with this statement, so the consume CAS picks the winner.
        sqlx::query_as::<_, VoucherCode>(&format!(
            "SELECT {} FROM vouchers
             WHERE denomination = $1 AND consumed = FALSE
             ORDER BY code ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
            VOUCHER_COLUMNS
        ))
        .bind(denomination)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn consume(
        &self,
        code: &str,
        subscriber: &str,
        reference: &str,
    ) -> DbResult<ConsumeOutcome> {
        let consumed = sqlx::query_as::<_, VoucherCode>(&format!(
            "UPDATE vouchers
             SET consumed = TRUE, assigned_to = $2, assigned_at = NOW(), originating_reference = $3
             WHERE code = $1 AND consumed = FALSE
             RETURNING {}",
            VOUCHER_COLUMNS
        ))
        .bind(code)
        .bind(subscriber)
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if let Some(voucher) = consumed {
            return Ok(ConsumeOutcome::Consumed(voucher));
        }

        let exists: Option<(String,)> = sqlx::query_as("SELECT code FROM vouchers WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(if exists.is_some() {
            ConsumeOutcome::AlreadyConsumed
        } else {
            ConsumeOutcome::NotFound
        })
    }

    async fn subscriber_holds_denomination(
        &self,
        subscriber: &str,
        denomination: i64,
        excluding_reference: &str,
    ) -> DbResult<bool> {
        let held: (bool,) = sqlx::query_as(
            "SELECT EXISTS (
                SELECT 1 FROM vouchers
                WHERE assigned_to = $1 AND denomination = $2 AND consumed = TRUE
                  AND originating_reference IS DISTINCT FROM $3
             )",
        )
        .bind(subscriber)
        .bind(denomination)
        .bind(excluding_reference)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(held.0)
    }

    async fn add(&self, code: &str, denomination: i64) -> DbResult<VoucherCode> {
        sqlx::query_as::<_, VoucherCode>(&format!(
            "INSERT INTO vouchers (code, denomination) VALUES ($1, $2) RETURNING {}",
            VOUCHER_COLUMNS
        ))
        .bind(code)
        .bind(denomination)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            let err = DatabaseError::from_sqlx(e);
            if err.is_unique_violation() {
                DatabaseError::duplicate("code", code)
            } else {
                err
            }
        })
    }

    async fn add_bulk(&self, codes: &[String], denomination: i64) -> DbResult<BulkInsertSummary> {
        let inserted: Vec<(String,)> = sqlx::query_as(
            "INSERT INTO vouchers (code, denomination)
             SELECT DISTINCT c, $2 FROM UNNEST($1::text[]) AS t(c)
             ON CONFLICT (code) DO NOTHING
             RETURNING code",
        )
        .bind(codes)
        .bind(denomination)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let inserted: std::collections::HashSet<String> =
            inserted.into_iter().map(|(code,)| code).collect();
        let mut seen = std::collections::HashSet::new();
        let skipped = codes
            .iter()
            .filter(|code| !inserted.contains(*code) || !seen.insert(code.as_str()))
            .cloned()
            .collect();

        Ok(BulkInsertSummary {
            inserted: inserted.len(),
            skipped,
        })
    }

    async fn list(&self, filter: &VoucherFilter) -> DbResult<Vec<VoucherCode>> {
        sqlx::query_as::<_, VoucherCode>(&format!(
            "SELECT {} FROM vouchers
             WHERE ($1::BIGINT IS NULL OR denomination = $1)
               AND ($2::BOOLEAN IS NULL OR consumed = $2)
             ORDER BY code ASC
             LIMIT $3",
            VOUCHER_COLUMNS
        ))
        .bind(filter.denomination)
        .bind(filter.consumed)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn counts_by_denomination(&self) -> DbResult<Vec<DenominationStock>> {
        sqlx::query_as::<_, DenominationStock>(
            "SELECT denomination,
                    COUNT(*) FILTER (WHERE NOT consumed) AS available,
                    COUNT(*) FILTER (WHERE consumed) AS consumed
             FROM vouchers
             GROUP BY denomination
             ORDER BY denomination ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}
