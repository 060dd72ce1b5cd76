//! In-process implementation of every store trait.
//!
//! Used when `SKIP_EXTERNALS=true` and by the test suite. All three stores
//! share one lock so a completion is atomic across payments and vouchers,
//! exactly like the Postgres transaction.

use crate::database::callback_repository::{CallbackKey, ClaimOutcome, STALE_CLAIM_SECS};
use crate::database::error::{DatabaseError, DbResult};
use crate::database::payment_repository::{
    Assignment, NewPayment, PaymentRecord, PaymentStatus, Transition,
};
use crate::database::repository::{CallbackLedger, PaymentStore, VoucherStore};
use crate::database::voucher_repository::{
    BulkInsertSummary, ConsumeOutcome, DenominationStock, VoucherCode, VoucherFilter,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaimState {
    Processing,
    Processed,
    Failed,
}

#[derive(Debug, Clone)]
struct ClaimEntry {
    state: ClaimState,
    attempts: i32,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    payments: HashMap<String, PaymentRecord>,
    // ordered by code, matching `ORDER BY code`
    vouchers: BTreeMap<String, VoucherCode>,
    callbacks: HashMap<CallbackKey, ClaimEntry>,
}

impl Inner {
    fn consume(
        &mut self,
        code: &str,
        subscriber: &str,
        reference: &str,
        now: DateTime<Utc>,
    ) -> ConsumeOutcome {
        match self.vouchers.get_mut(code) {
            None => ConsumeOutcome::NotFound,
            Some(voucher) if voucher.consumed => ConsumeOutcome::AlreadyConsumed,
            Some(voucher) => {
                voucher.consumed = true;
                voucher.assigned_to = Some(subscriber.to_string());
                voucher.assigned_at = Some(now);
                voucher.originating_reference = Some(reference.to_string());
                ConsumeOutcome::Consumed(voucher.clone())
            }
        }
    }

    fn finish(
        &mut self,
        reference: &str,
        status: PaymentStatus,
        voucher_code: Option<String>,
    ) -> Transition {
        let now = Utc::now();
        match self.payments.get_mut(reference) {
            None => Transition::Missing,
            Some(record) if record.status != PaymentStatus::Processing => {
                Transition::NotProcessing(record.clone())
            }
            Some(record) => {
                record.status = status;
                record.voucher_code = voucher_code;
                record.updated_at = now;
                record.completed_at = Some(now);
                Transition::Applied(record.clone())
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backdate a claim, as if its owner had stalled
    pub async fn age_claim(&self, key: &CallbackKey, by: Duration) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.callbacks.get_mut(key) {
            entry.updated_at -= by;
        }
    }

    /// Backdate a payment's creation time
    pub async fn age_payment(&self, reference: &str, by: Duration) {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.payments.get_mut(reference) {
            record.created_at -= by;
        }
    }

    pub async fn last_callback_error(&self, key: &CallbackKey) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .callbacks
            .get(key)
            .and_then(|entry| entry.last_error.clone())
    }
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn insert(&self, new: NewPayment) -> DbResult<PaymentRecord> {
        let mut inner = self.inner.lock().await;
        if inner.payments.contains_key(&new.reference) {
            return Err(DatabaseError::duplicate("reference", &new.reference));
        }
        let record = PaymentRecord::processing(new, Utc::now());
        inner
            .payments
            .insert(record.reference.clone(), record.clone());
        Ok(record)
    }

    async fn insert_if_absent(&self, new: NewPayment) -> DbResult<(PaymentRecord, bool)> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.payments.get(&new.reference) {
            return Ok((existing.clone(), false));
        }
        let record = PaymentRecord::processing(new, Utc::now());
        inner
            .payments
            .insert(record.reference.clone(), record.clone());
        Ok((record, true))
    }

    async fn find(&self, reference: &str) -> DbResult<Option<PaymentRecord>> {
        Ok(self.inner.lock().await.payments.get(reference).cloned())
    }

    async fn set_provider_transaction_id(
        &self,
        reference: &str,
        provider_transaction_id: &str,
    ) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.payments.get_mut(reference) {
            record.provider_transaction_id = Some(provider_transaction_id.to_string());
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_failed(&self, reference: &str) -> DbResult<Transition> {
        Ok(self
            .inner
            .lock()
            .await
            .finish(reference, PaymentStatus::Failed, None))
    }

    async fn mark_successful_without_voucher(&self, reference: &str) -> DbResult<Transition> {
        Ok(self
            .inner
            .lock()
            .await
            .finish(reference, PaymentStatus::Successful, None))
    }

    async fn complete_with_voucher(
        &self,
        reference: &str,
        code: &str,
        subscriber: &str,
    ) -> DbResult<Assignment> {
        let mut inner = self.inner.lock().await;

        match inner.payments.get(reference) {
            None => return Ok(Assignment::Missing),
            Some(record) if record.status != PaymentStatus::Processing => {
                return Ok(Assignment::NotProcessing(record.clone()));
            }
            Some(_) => {}
        }

        let voucher = match inner.consume(code, subscriber, reference, Utc::now()) {
            ConsumeOutcome::Consumed(voucher) => voucher,
            ConsumeOutcome::AlreadyConsumed | ConsumeOutcome::NotFound => {
                return Ok(Assignment::VoucherTaken);
            }
        };

        match inner.finish(reference, PaymentStatus::Successful, Some(voucher.code.clone())) {
            Transition::Applied(payment) => Ok(Assignment::Assigned { payment, voucher }),
            // checked above while holding the lock
            Transition::NotProcessing(record) => Ok(Assignment::NotProcessing(record)),
            Transition::Missing => Ok(Assignment::Missing),
        }
    }

    async fn list_processing(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<PaymentRecord>> {
        let inner = self.inner.lock().await;
        let mut records: Vec<PaymentRecord> = inner
            .payments
            .values()
            .filter(|r| r.status == PaymentStatus::Processing && r.created_at < created_before)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }

    async fn ping(&self) -> DbResult<()> {
        Ok(())
    }
}

#[async_trait]
impl VoucherStore for MemoryStore {
    async fn find_available(&self, denomination: i64) -> DbResult<Option<VoucherCode>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .vouchers
            .values()
            .find(|v| !v.consumed && v.denomination == denomination)
            .cloned())
    }

    async fn consume(
        &self,
        code: &str,
        subscriber: &str,
        reference: &str,
    ) -> DbResult<ConsumeOutcome> {
        Ok(self
            .inner
            .lock()
            .await
            .consume(code, subscriber, reference, Utc::now()))
    }

    async fn subscriber_holds_denomination(
        &self,
        subscriber: &str,
        denomination: i64,
        excluding_reference: &str,
    ) -> DbResult<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.vouchers.values().any(|v| {
            v.consumed
                && v.denomination == denomination
                && v.assigned_to.as_deref() == Some(subscriber)
                && v.originating_reference.as_deref() != Some(excluding_reference)
        }))
    }

    async fn add(&self, code: &str, denomination: i64) -> DbResult<VoucherCode> {
        let mut inner = self.inner.lock().await;
        if inner.vouchers.contains_key(code) {
            return Err(DatabaseError::duplicate("code", code));
        }
        let voucher = VoucherCode::available(code, denomination, Utc::now());
        inner.vouchers.insert(code.to_string(), voucher.clone());
        Ok(voucher)
    }

    async fn add_bulk(&self, codes: &[String], denomination: i64) -> DbResult<BulkInsertSummary> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut summary = BulkInsertSummary::default();
        let mut seen = HashSet::new();

        for code in codes {
            if !seen.insert(code.as_str()) || inner.vouchers.contains_key(code) {
                summary.skipped.push(code.clone());
                continue;
            }
            inner
                .vouchers
                .insert(code.clone(), VoucherCode::available(code, denomination, now));
            summary.inserted += 1;
        }

        Ok(summary)
    }

    async fn list(&self, filter: &VoucherFilter) -> DbResult<Vec<VoucherCode>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .vouchers
            .values()
            .filter(|v| filter.denomination.map_or(true, |d| v.denomination == d))
            .filter(|v| filter.consumed.map_or(true, |c| v.consumed == c))
            .take(filter.limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn counts_by_denomination(&self) -> DbResult<Vec<DenominationStock>> {
        let inner = self.inner.lock().await;
        let mut counts: BTreeMap<i64, DenominationStock> = BTreeMap::new();

        for voucher in inner.vouchers.values() {
            let entry = counts
                .entry(voucher.denomination)
                .or_insert_with(|| DenominationStock {
                    denomination: voucher.denomination,
                    available: 0,
                    consumed: 0,
                });
            if voucher.consumed {
                entry.consumed += 1;
            } else {
                entry.available += 1;
            }
        }

        Ok(counts.into_values().collect())
    }
}

#[async_trait]
impl CallbackLedger for MemoryStore {
    async fn claim(&self, key: &CallbackKey) -> DbResult<ClaimOutcome> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let stale_before = now - Duration::seconds(STALE_CLAIM_SECS);

        match inner.callbacks.get_mut(key) {
            None => {
                inner.callbacks.insert(
                    key.clone(),
                    ClaimEntry {
                        state: ClaimState::Processing,
                        attempts: 1,
                        last_error: None,
                        updated_at: now,
                    },
                );
                Ok(ClaimOutcome::Fresh { attempt: 1 })
            }
            Some(entry)
                if entry.state == ClaimState::Failed
                    || (entry.state == ClaimState::Processing
                        && entry.updated_at < stale_before) =>
            {
                entry.state = ClaimState::Processing;
                entry.attempts += 1;
                entry.last_error = None;
                entry.updated_at = now;
                Ok(ClaimOutcome::Fresh {
                    attempt: entry.attempts,
                })
            }
            Some(_) => Ok(ClaimOutcome::Duplicate),
        }
    }

    async fn mark_processed(&self, key: &CallbackKey) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.callbacks.get_mut(key) {
            entry.state = ClaimState::Processed;
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_failure(&self, key: &CallbackKey, error: &str) -> DbResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.callbacks.get_mut(key) {
            if entry.state == ClaimState::Processing {
                entry.state = ClaimState::Failed;
                entry.last_error = Some(error.to_string());
                entry.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn count_processed(&self) -> DbResult<i64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .callbacks
            .values()
            .filter(|entry| entry.state == ClaimState::Processed)
            .count() as i64)
    }
}
