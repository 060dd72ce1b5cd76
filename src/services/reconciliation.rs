//! Payment-to-voucher reconciliation.
//!
//! Every provider report (webhook, status poll, sweeper expiry, failure
//! simulation) goes through [`ReconciliationEngine::reconcile`]. The engine
//! claims the report in the callback ledger, finds or synthesizes the payment
//! record, maps the provider status and applies at most one terminal
//! transition. Voucher consumption and payment completion are a single store
//! operation, so concurrent reports for one reference can never hand out two
//! vouchers.

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::VoucherConfig;
use crate::database::callback_repository::{CallbackKey, ClaimOutcome};
use crate::database::error::DatabaseError;
use crate::database::payment_repository::{
    Assignment, NewPayment, PaymentRecord, PaymentStatus, Transition,
};
use crate::database::repository::{CallbackLedger, PaymentStore, VoucherStore};
use crate::database::voucher_repository::VoucherCode;
use crate::logging::mask_phone;
use crate::payments::status::{map_provider_status, MappedStatus};
use crate::payments::types::WebhookPayload;
use crate::services::notification::NotificationService;
use crate::services::phone::normalize_phone;

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error("callback has no transaction reference")]
    MissingReference,

    #[error("payment {reference} is unknown and cannot be created from the callback: {reason}")]
    CannotSynthesize { reference: String, reason: String },

    #[error("payment {0} disappeared during reconciliation")]
    PaymentVanished(String),

    #[error("no voucher could be claimed for payment {reference} after {attempts} attempts")]
    VoucherContention { reference: String, attempts: u32 },

    #[error("storage error: {0}")]
    Database(#[from] DatabaseError),
}

/// Where the status in a report came from
#[derive(Debug, Clone, PartialEq)]
pub enum StatusReport {
    /// Raw provider vocabulary, mapped by the engine
    Provider {
        status: String,
        network: Option<String>,
    },
    /// Produced inside this service (sweeper expiry, test simulations)
    Internal(MappedStatus),
}

impl StatusReport {
    pub fn resolve(&self) -> MappedStatus {
        match self {
            StatusReport::Provider { status, network } => {
                map_provider_status(status, network.as_deref())
            }
            StatusReport::Internal(mapped) => mapped.clone(),
        }
    }

    fn network(&self) -> Option<&str> {
        match self {
            StatusReport::Provider { network, .. } => network.as_deref(),
            StatusReport::Internal(_) => None,
        }
    }
}

/// One provider report about one payment
#[derive(Debug, Clone)]
pub struct ReconciliationRequest {
    pub reference: Option<String>,
    pub event_type: String,
    pub report: StatusReport,
    /// Only used to synthesize a missing record
    pub amount: Option<i64>,
    /// Only used to synthesize a missing record
    pub subscriber: Option<String>,
    pub provider_transaction_uuid: Option<String>,
}

impl ReconciliationRequest {
    pub fn from_webhook(payload: &WebhookPayload) -> Self {
        Self {
            reference: payload.reference().map(str::to_string),
            event_type: payload.event_type().to_string(),
            report: StatusReport::Provider {
                status: payload.status().unwrap_or_default().to_string(),
                network: payload.network().map(str::to_string),
            },
            amount: payload.amount(),
            subscriber: payload.phone_number().map(str::to_string),
            provider_transaction_uuid: payload.transaction_uuid().map(str::to_string),
        }
    }

    /// A provider status check for an existing record
    pub fn poll(
        record: &PaymentRecord,
        provider_transaction_id: &str,
        status: &str,
        network: Option<&str>,
    ) -> Self {
        let network = network
            .map(str::to_string)
            .or_else(|| record.provider.clone());
        let mapped = map_provider_status(status, network.as_deref());

        Self {
            reference: Some(record.reference.clone()),
            event_type: format!("poll.{}", mapped.as_str()),
            report: StatusReport::Provider {
                status: status.to_string(),
                network,
            },
            amount: None,
            subscriber: None,
            provider_transaction_uuid: Some(provider_transaction_id.to_string()),
        }
    }

    pub fn internal_failure(reference: &str, event_type: &str) -> Self {
        Self::internal(reference, event_type, MappedStatus::Failed)
    }

    /// A verdict produced inside this service rather than by the gateway
    pub fn internal(reference: &str, event_type: &str, status: MappedStatus) -> Self {
        Self {
            reference: Some(reference.to_string()),
            event_type: event_type.to_string(),
            report: StatusReport::Internal(status),
            amount: None,
            subscriber: None,
            provider_transaction_uuid: None,
        }
    }

    pub fn key(&self) -> Option<CallbackKey> {
        let reference = self.reference.as_deref()?;
        Some(CallbackKey::new(
            reference,
            self.event_type.as_str(),
            self.provider_transaction_uuid.as_deref(),
        ))
    }
}

/// Why a successful payment ended without a voucher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Shortfall {
    InventoryExhausted,
    IntegrityFault,
    SubscriberAlreadyServed,
}

impl Shortfall {
    pub fn user_message(&self) -> &'static str {
        match self {
            Shortfall::InventoryExhausted => {
                "Payment received but no voucher is currently available. Please contact support."
            }
            Shortfall::IntegrityFault => {
                "Payment received but the voucher could not be issued. Please contact support."
            }
            Shortfall::SubscriberAlreadyServed => {
                "Payment received. A voucher of this value was already issued to this number."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconciliationOutcome {
    Duplicate,
    Completed {
        payment: PaymentRecord,
        voucher: Option<VoucherCode>,
        shortfall: Option<Shortfall>,
    },
    Failed {
        payment: PaymentRecord,
    },
    StillProcessing {
        payment: PaymentRecord,
        provider_status: String,
    },
    AlreadyTerminal {
        payment: PaymentRecord,
    },
    Errored {
        message: String,
    },
}

impl ReconciliationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReconciliationOutcome::Duplicate => "duplicate",
            ReconciliationOutcome::Completed { .. } => "completed",
            ReconciliationOutcome::Failed { .. } => "failed",
            ReconciliationOutcome::StillProcessing { .. } => "still_processing",
            ReconciliationOutcome::AlreadyTerminal { .. } => "already_terminal",
            ReconciliationOutcome::Errored { .. } => "errored",
        }
    }

    pub fn payment(&self) -> Option<&PaymentRecord> {
        match self {
            ReconciliationOutcome::Completed { payment, .. }
            | ReconciliationOutcome::Failed { payment }
            | ReconciliationOutcome::StillProcessing { payment, .. }
            | ReconciliationOutcome::AlreadyTerminal { payment } => Some(payment),
            ReconciliationOutcome::Duplicate | ReconciliationOutcome::Errored { .. } => None,
        }
    }

    /// JSON body returned to the provider. Always paired with HTTP 200.
    pub fn acknowledgment(&self) -> serde_json::Value {
        let timestamp = chrono::Utc::now().to_rfc3339();
        match self {
            ReconciliationOutcome::Duplicate => json!({
                "success": true,
                "message": "Duplicate callback ignored",
                "duplicate": true,
                "timestamp": timestamp,
            }),
            ReconciliationOutcome::Completed {
                payment,
                voucher,
                shortfall,
            } => json!({
                "success": true,
                "message": shortfall
                    .map(|s| s.user_message())
                    .unwrap_or("Payment completed and voucher assigned"),
                "reference": payment.reference,
                "status": payment.status,
                "voucher": voucher.as_ref().map(|v| v.code.as_str()),
                "shortfall": shortfall,
                "timestamp": timestamp,
            }),
            ReconciliationOutcome::Failed { payment } => json!({
                "success": true,
                "message": "Payment marked as failed",
                "reference": payment.reference,
                "status": payment.status,
                "timestamp": timestamp,
            }),
            ReconciliationOutcome::StillProcessing {
                payment,
                provider_status,
            } => json!({
                "success": true,
                "message": "Payment still processing",
                "reference": payment.reference,
                "status": payment.status,
                "provider_status": provider_status,
                "timestamp": timestamp,
            }),
            ReconciliationOutcome::AlreadyTerminal { payment } => json!({
                "success": true,
                "message": "Payment already finalized",
                "reference": payment.reference,
                "status": payment.status,
                "voucher": payment.voucher_code,
                "timestamp": timestamp,
            }),
            ReconciliationOutcome::Errored { message } => json!({
                "success": false,
                "message": "Callback acknowledged but could not be processed",
                "error": message,
                "timestamp": timestamp,
            }),
        }
    }
}

pub struct ReconciliationEngine {
    payments: Arc<dyn PaymentStore>,
    vouchers: Arc<dyn VoucherStore>,
    ledger: Arc<dyn CallbackLedger>,
    notifications: Arc<NotificationService>,
    config: VoucherConfig,
}

impl ReconciliationEngine {
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        vouchers: Arc<dyn VoucherStore>,
        ledger: Arc<dyn CallbackLedger>,
        notifications: Arc<NotificationService>,
        config: VoucherConfig,
    ) -> Self {
        Self {
            payments,
            vouchers,
            ledger,
            notifications,
            config,
        }
    }

    pub fn config(&self) -> &VoucherConfig {
        &self.config
    }

    /// Like [`reconcile`](Self::reconcile), but every error becomes an `Errored` outcome.
    pub async fn handle_callback(&self, request: ReconciliationRequest) -> ReconciliationOutcome {
        match self.reconcile(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "callback processing failed, acknowledging anyway");
                ReconciliationOutcome::Errored {
                    message: e.to_string(),
                }
            }
        }
    }

    pub async fn reconcile(
        &self,
        request: ReconciliationRequest,
    ) -> Result<ReconciliationOutcome, ReconciliationError> {
        let key = request.key().ok_or(ReconciliationError::MissingReference)?;

        let attempt = match self.ledger.claim(&key).await? {
            ClaimOutcome::Fresh { attempt } => attempt,
            ClaimOutcome::Duplicate => {
                info!(callback = %key, "duplicate callback ignored");
                return Ok(ReconciliationOutcome::Duplicate);
            }
        };

        match self.apply(&key.reference, &request).await {
            Ok(outcome) => {
                if let Err(e) = self.ledger.mark_processed(&key).await {
                    // State is already durable; a later redelivery re-runs the CAS harmlessly
                    warn!(callback = %key, error = %e, "failed to mark callback processed");
                }
                info!(
                    callback = %key,
                    attempt = attempt,
                    outcome = outcome.label(),
                    "callback reconciled"
                );
                Ok(outcome)
            }
            Err(e) => {
                if let Err(ledger_err) = self.ledger.record_failure(&key, &e.to_string()).await {
                    error!(callback = %key, error = %ledger_err, "failed to release callback claim");
                }
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        reference: &str,
        request: &ReconciliationRequest,
    ) -> Result<ReconciliationOutcome, ReconciliationError> {
        let mut record = match self.payments.find(reference).await? {
            Some(record) => record,
            None => self.synthesize(reference, request).await?,
        };

        // Without it the record can never be polled or swept against the gateway
        if record.provider_transaction_id.is_none() {
            if let Some(uuid) = request
                .provider_transaction_uuid
                .as_deref()
                .filter(|uuid| !uuid.trim().is_empty())
            {
                self.payments
                    .set_provider_transaction_id(reference, uuid)
                    .await?;
                record.provider_transaction_id = Some(uuid.to_string());
            }
        }

        if let Some(amount) = request.amount {
            if amount != record.denomination {
                warn!(
                    reference = %reference,
                    stored = record.denomination,
                    reported = amount,
                    "callback amount differs from stored amount, using stored amount"
                );
            }
        }

        let mapped = request.report.resolve();
        match mapped {
            MappedStatus::Completed => self.complete(record).await,
            MappedStatus::Failed => self.fail(record).await,
            MappedStatus::Pending | MappedStatus::Passthrough(_) => {
                Ok(ReconciliationOutcome::StillProcessing {
                    provider_status: mapped.as_str().to_string(),
                    payment: record,
                })
            }
        }
    }

    /// Create a `Processing` record for a callback that arrived without one
    async fn synthesize(
        &self,
        reference: &str,
        request: &ReconciliationRequest,
    ) -> Result<PaymentRecord, ReconciliationError> {
        let cannot = |reason: String| ReconciliationError::CannotSynthesize {
            reference: reference.to_string(),
            reason,
        };

        let amount = request
            .amount
            .ok_or_else(|| cannot("callback carries no amount".to_string()))?;
        let denomination = self
            .config
            .denominations
            .check(amount)
            .map_err(|e| cannot(e.to_string()))?;
        let subscriber = request
            .subscriber
            .as_deref()
            .and_then(normalize_phone)
            .ok_or_else(|| cannot("callback carries no valid phone number".to_string()))?;

        let (record, created) = self
            .payments
            .insert_if_absent(NewPayment {
                reference: reference.to_string(),
                subscriber,
                denomination,
                provider: request.report.network().map(str::to_string),
            })
            .await?;

        if created {
            warn!(
                reference = %reference,
                amount = denomination,
                phone = %mask_phone(&record.subscriber),
                "payment record synthesized from callback"
            );
        }
        Ok(record)
    }

    async fn complete(
        &self,
        record: PaymentRecord,
    ) -> Result<ReconciliationOutcome, ReconciliationError> {
        if record.status.is_terminal() {
            return Ok(ReconciliationOutcome::AlreadyTerminal { payment: record });
        }

        let reference = record.reference.as_str();
        let denomination = record.denomination;
        let subscriber = record.subscriber.as_str();

        if self.config.single_issue_per_subscriber
            && self
                .vouchers
                .subscriber_holds_denomination(subscriber, denomination, reference)
                .await?
        {
            info!(
                reference = %reference,
                phone = %mask_phone(subscriber),
                amount = denomination,
                "subscriber already holds a voucher of this value"
            );
            return self
                .complete_without_voucher(reference, Shortfall::SubscriberAlreadyServed)
                .await;
        }

        for attempt in 1..=self.config.assignment_attempts {
            let Some(candidate) = self.vouchers.find_available(denomination).await? else {
                warn!(
                    reference = %reference,
                    amount = denomination,
                    "no voucher available for denomination"
                );
                return self
                    .complete_without_voucher(reference, Shortfall::InventoryExhausted)
                    .await;
            };

            if candidate.denomination != denomination {
                error!(
                    severity = "critical",
                    reference = %reference,
                    expected = denomination,
                    found = candidate.denomination,
                    code = %candidate.code,
                    "voucher inventory returned a mismatched denomination"
                );
                return self
                    .complete_without_voucher(reference, Shortfall::IntegrityFault)
                    .await;
            }

            match self
                .payments
                .complete_with_voucher(reference, &candidate.code, subscriber)
                .await?
            {
                Assignment::Assigned { payment, voucher } => {
                    info!(
                        reference = %reference,
                        code = %voucher.code,
                        amount = voucher.denomination,
                        "voucher assigned"
                    );
                    self.notifications.notify_voucher_assigned(&payment, &voucher);
                    return Ok(ReconciliationOutcome::Completed {
                        payment,
                        voucher: Some(voucher),
                        shortfall: None,
                    });
                }
                Assignment::VoucherTaken => {
                    info!(
                        reference = %reference,
                        code = %candidate.code,
                        attempt = attempt,
                        "voucher claimed concurrently, trying next"
                    );
                }
                Assignment::NotProcessing(payment) => {
                    return Ok(ReconciliationOutcome::AlreadyTerminal { payment });
                }
                Assignment::Missing => {
                    return Err(ReconciliationError::PaymentVanished(reference.to_string()));
                }
            }
        }

        Err(ReconciliationError::VoucherContention {
            reference: reference.to_string(),
            attempts: self.config.assignment_attempts,
        })
    }

    async fn complete_without_voucher(
        &self,
        reference: &str,
        shortfall: Shortfall,
    ) -> Result<ReconciliationOutcome, ReconciliationError> {
        match self.payments.mark_successful_without_voucher(reference).await? {
            Transition::Applied(payment) => Ok(ReconciliationOutcome::Completed {
                payment,
                voucher: None,
                shortfall: Some(shortfall),
            }),
            Transition::NotProcessing(payment) => {
                Ok(ReconciliationOutcome::AlreadyTerminal { payment })
            }
            Transition::Missing => Err(ReconciliationError::PaymentVanished(reference.to_string())),
        }
    }

    async fn fail(
        &self,
        record: PaymentRecord,
    ) -> Result<ReconciliationOutcome, ReconciliationError> {
        if record.status != PaymentStatus::Processing {
            return Ok(ReconciliationOutcome::AlreadyTerminal { payment: record });
        }

        match self.payments.mark_failed(&record.reference).await? {
            Transition::Applied(payment) => {
                info!(reference = %payment.reference, "payment marked failed");
                Ok(ReconciliationOutcome::Failed { payment })
            }
            Transition::NotProcessing(payment) => {
                Ok(ReconciliationOutcome::AlreadyTerminal { payment })
            }
            Transition::Missing => Err(ReconciliationError::PaymentVanished(record.reference)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryStore;

    fn engine(store: &Arc<MemoryStore>) -> ReconciliationEngine {
        ReconciliationEngine::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(NotificationService::log_only("UGX")),
            VoucherConfig::default(),
        )
    }

    fn webhook(reference: &str, status: &str, uuid: &str) -> ReconciliationRequest {
        ReconciliationRequest {
            reference: Some(reference.to_string()),
            event_type: "collection.completed".to_string(),
            report: StatusReport::Provider {
                status: status.to_string(),
                network: Some("mtn".to_string()),
            },
            amount: Some(1000),
            subscriber: Some("+256712345678".to_string()),
            provider_transaction_uuid: Some(uuid.to_string()),
        }
    }

    async fn seed(store: &MemoryStore, reference: &str) {
        store
            .insert(NewPayment {
                reference: reference.to_string(),
                subscriber: "256712345678".to_string(),
                denomination: 1000,
                provider: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_reference_is_rejected_before_claiming() {
        let store = Arc::new(MemoryStore::new());
        let mut request = webhook("R1", "completed", "U1");
        request.reference = None;

        let outcome = engine(&store).handle_callback(request).await;
        assert!(matches!(outcome, ReconciliationOutcome::Errored { .. }));
        assert_eq!(store.count_processed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pending_report_leaves_record_processing() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "R1").await;

        let outcome = engine(&store)
            .reconcile(webhook("R1", "pending", "U1"))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ReconciliationOutcome::StillProcessing { ref provider_status, .. } if provider_status == "pending"
        ));
        let record = store.find("R1").await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Processing);
        assert_eq!(store.count_processed().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stored_amount_wins_over_callback_amount() {
        let store = Arc::new(MemoryStore::new());
        store.add("V600-A", 600).await.unwrap();
        store.add("V1000-A", 1000).await.unwrap();
        seed(&store, "R1").await;

        let mut request = webhook("R1", "completed", "U1");
        request.amount = Some(600);

        let outcome = engine(&store).reconcile(request).await.unwrap();
        match outcome {
            ReconciliationOutcome::Completed { voucher, .. } => {
                assert_eq!(voucher.map(|v| v.code).as_deref(), Some("V1000-A"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn synthesis_fails_without_valid_amount() {
        let store = Arc::new(MemoryStore::new());
        let mut request = webhook("R9", "completed", "U9");
        request.amount = Some(999);
        let key = request.key().unwrap();

        let err = engine(&store).reconcile(request.clone()).await.unwrap_err();
        assert!(matches!(err, ReconciliationError::CannotSynthesize { .. }));
        assert!(store.find("R9").await.unwrap().is_none());
        assert!(store.last_callback_error(&key).await.is_some());

        // released claim can be retried
        let again = engine(&store).handle_callback(request).await;
        assert!(matches!(again, ReconciliationOutcome::Errored { .. }));
    }

    #[tokio::test]
    async fn single_issue_policy_withholds_second_voucher() {
        let store = Arc::new(MemoryStore::new());
        store.add("V1000-A", 1000).await.unwrap();
        store.add("V1000-B", 1000).await.unwrap();
        seed(&store, "R1").await;
        seed(&store, "R2").await;

        let engine = ReconciliationEngine::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(NotificationService::log_only("UGX")),
            VoucherConfig {
                single_issue_per_subscriber: true,
                ..VoucherConfig::default()
            },
        );

        engine.reconcile(webhook("R1", "completed", "U1")).await.unwrap();
        let second = engine
            .reconcile(webhook("R2", "completed", "U2"))
            .await
            .unwrap();

        assert!(matches!(
            second,
            ReconciliationOutcome::Completed {
                voucher: None,
                shortfall: Some(Shortfall::SubscriberAlreadyServed),
                ..
            }
        ));
        assert!(store.find_available(1000).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn internal_failure_is_applied_without_mapping() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "R1").await;

        let outcome = engine(&store)
            .reconcile(ReconciliationRequest::internal_failure("R1", "sweeper.expired"))
            .await
            .unwrap();

        assert!(matches!(outcome, ReconciliationOutcome::Failed { .. }));
    }

    #[test]
    fn poll_event_type_carries_mapped_status() {
        let record = PaymentRecord::processing(
            NewPayment {
                reference: "R1".to_string(),
                subscriber: "256712345678".to_string(),
                denomination: 1000,
                provider: Some("airtel".to_string()),
            },
            chrono::Utc::now(),
        );

        let request = ReconciliationRequest::poll(&record, "T-1", "TS", None);
        assert_eq!(request.event_type, "poll.completed");
        assert_eq!(request.key().unwrap().provider_uuid, "T-1");
    }

    #[test]
    fn acknowledgment_reports_failure_flag() {
        let ack = ReconciliationOutcome::Errored {
            message: "db down".to_string(),
        }
        .acknowledgment();
        assert_eq!(ack["success"], false);
        assert_eq!(ReconciliationOutcome::Duplicate.acknowledgment()["duplicate"], true);
    }
}
