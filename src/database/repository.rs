use crate::database::callback_repository::{CallbackKey, ClaimOutcome};
use crate::database::error::DbResult;
use crate::database::payment_repository::{Assignment, NewPayment, PaymentRecord, Transition};
use crate::database::voucher_repository::{
    BulkInsertSummary, ConsumeOutcome, DenominationStock, VoucherCode, VoucherFilter,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Payment records keyed by reference.
///
/// Every status change is a compare-and-swap from `Processing`; a terminal
/// record is never rewritten.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Insert a new `Processing` record. A duplicate reference is a unique violation.
    async fn insert(&self, new: NewPayment) -> DbResult<PaymentRecord>;

    /// Insert unless the reference exists. The flag is `true` when this call created it.
    async fn insert_if_absent(&self, new: NewPayment) -> DbResult<(PaymentRecord, bool)>;

    async fn find(&self, reference: &str) -> DbResult<Option<PaymentRecord>>;

    async fn set_provider_transaction_id(
        &self,
        reference: &str,
        provider_transaction_id: &str,
    ) -> DbResult<()>;

    async fn mark_failed(&self, reference: &str) -> DbResult<Transition>;

    async fn mark_successful_without_voucher(&self, reference: &str) -> DbResult<Transition>;

    /// Consume `code` for `subscriber` and complete the payment as one unit.
    async fn complete_with_voucher(
        &self,
        reference: &str,
        code: &str,
        subscriber: &str,
    ) -> DbResult<Assignment>;

    /// Oldest first
    async fn list_processing(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<PaymentRecord>>;

    async fn ping(&self) -> DbResult<()>;
}

/// Voucher inventory
#[async_trait]
pub trait VoucherStore: Send + Sync {
    /// An unconsumed voucher of exactly `denomination`, or `None` when exhausted
    async fn find_available(&self, denomination: i64) -> DbResult<Option<VoucherCode>>;

    /// Mark a voucher consumed if and only if it is currently unconsumed
    async fn consume(
        &self,
        code: &str,
        subscriber: &str,
        reference: &str,
    ) -> DbResult<ConsumeOutcome>;

    async fn subscriber_holds_denomination(
        &self,
        subscriber: &str,
        denomination: i64,
        excluding_reference: &str,
    ) -> DbResult<bool>;

    async fn add(&self, code: &str, denomination: i64) -> DbResult<VoucherCode>;

    async fn add_bulk(&self, codes: &[String], denomination: i64) -> DbResult<BulkInsertSummary>;

    async fn list(&self, filter: &VoucherFilter) -> DbResult<Vec<VoucherCode>>;

    async fn counts_by_denomination(&self) -> DbResult<Vec<DenominationStock>>;
}

/// Durable dedup set for provider callbacks and synthetic events
#[async_trait]
pub trait CallbackLedger: Send + Sync {
    /// Atomically claim a key. Only one concurrent caller sees `Fresh`.
    async fn claim(&self, key: &CallbackKey) -> DbResult<ClaimOutcome>;

    async fn mark_processed(&self, key: &CallbackKey) -> DbResult<()>;

    /// Release a claim so a redelivery can retry it
    async fn record_failure(&self, key: &CallbackKey, error: &str) -> DbResult<()>;

    async fn count_processed(&self) -> DbResult<i64>;
}
