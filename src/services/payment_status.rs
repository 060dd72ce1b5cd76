//! Status queries, with an optional provider refresh, and the bounded
//! settlement wait.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::throttle::PollThrottle;
use crate::database::error::DatabaseError;
use crate::database::payment_repository::{PaymentRecord, PaymentStatus};
use crate::database::repository::PaymentStore;
use crate::error::{AppError, AppErrorKind, DomainError};
use crate::payments::error::PaymentError;
use crate::payments::provider::CollectionProvider;
use crate::services::reconciliation::{
    ReconciliationEngine, ReconciliationOutcome, ReconciliationRequest,
};

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("payment {0} not found")]
    NotFound(String),

    #[error("payment {reference} did not settle within {waited_secs}s")]
    Timeout { reference: String, waited_secs: u64 },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<StatusError> for AppError {
    fn from(err: StatusError) -> Self {
        match err {
            StatusError::NotFound(reference) => AppError::payment_not_found(reference),
            StatusError::Timeout {
                reference,
                waited_secs,
            } => AppError::new(AppErrorKind::Domain(DomainError::SettlementTimeout {
                reference,
                waited_secs,
            })),
            StatusError::Database(e) => e.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusConfig {
    /// Upper bound (and default) for `await_settlement`
    pub wait_timeout: Duration,
    pub wait_interval: Duration,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(300),
            wait_interval: Duration::from_secs(3),
        }
    }
}

impl StatusConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |name: &str, fallback: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };

        Self {
            wait_timeout: secs("PAYMENT_WAIT_TIMEOUT_SECS", defaults.wait_timeout),
            wait_interval: secs("PAYMENT_WAIT_INTERVAL_SECS", defaults.wait_interval)
                .max(Duration::from_millis(100)),
        }
    }
}

/// Public view of a payment
#[derive(Debug, Clone, Serialize)]
pub struct PaymentStatusView {
    pub reference: String,
    pub status: PaymentStatus,
    pub amount: i64,
    pub phone: String,
    pub voucher: Option<String>,
    pub provider_transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<PaymentRecord> for PaymentStatusView {
    fn from(record: PaymentRecord) -> Self {
        Self {
            reference: record.reference,
            status: record.status,
            amount: record.denomination,
            phone: record.subscriber,
            voucher: record.voucher_code,
            provider_transaction_id: record.provider_transaction_id,
            created_at: record.created_at,
            updated_at: record.updated_at,
            completed_at: record.completed_at,
        }
    }
}

pub struct PaymentStatusService {
    payments: Arc<dyn PaymentStore>,
    provider: Arc<dyn CollectionProvider>,
    engine: Arc<ReconciliationEngine>,
    throttle: Arc<dyn PollThrottle>,
    config: StatusConfig,
}

impl PaymentStatusService {
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        provider: Arc<dyn CollectionProvider>,
        engine: Arc<ReconciliationEngine>,
        throttle: Arc<dyn PollThrottle>,
        config: StatusConfig,
    ) -> Self {
        Self {
            payments,
            provider,
            engine,
            throttle,
            config,
        }
    }

    /// Current state of `reference`, refreshed from the provider when the
    /// record is still processing and the throttle allows a check.
    pub async fn get_status(&self, reference: &str) -> Result<PaymentStatusView, StatusError> {
        let record = self
            .payments
            .find(reference)
            .await?
            .ok_or_else(|| StatusError::NotFound(reference.to_string()))?;

        if record.status != PaymentStatus::Processing || record.provider_transaction_id.is_none()
        {
            return Ok(record.into());
        }
        if !self.throttle.try_acquire(reference).await {
            debug!(reference = %reference, "provider check throttled, serving local state");
            return Ok(record.into());
        }

        match self.poll_provider(&record).await {
            Ok(outcome) => {
                if let Some(payment) = outcome.payment() {
                    return Ok(payment.clone().into());
                }
                // Duplicate or errored poll: whatever the store holds now is authoritative
                let latest = self.payments.find(reference).await?.unwrap_or(record);
                Ok(latest.into())
            }
            Err(e) => {
                warn!(
                    reference = %reference,
                    error = %e,
                    "provider status check failed, serving local state"
                );
                Ok(record.into())
            }
        }
    }

    /// Ask the provider about `record` and feed the answer to the engine.
    ///
    /// Returns `Err` only when the provider could not be asked; engine
    /// failures come back as `ReconciliationOutcome::Errored`.
    pub async fn poll_provider(
        &self,
        record: &PaymentRecord,
    ) -> Result<ReconciliationOutcome, PaymentError> {
        let provider_transaction_id =
            record
                .provider_transaction_id
                .as_deref()
                .ok_or_else(|| PaymentError::ValidationError {
                    message: format!("payment {} has no provider transaction id", record.reference),
                    field: Some("provider_transaction_id".to_string()),
                })?;

        let status = self
            .provider
            .collection_status(provider_transaction_id)
            .await?;

        let request = ReconciliationRequest::poll(
            record,
            provider_transaction_id,
            &status.status,
            status.network.as_deref(),
        );
        Ok(self.engine.handle_callback(request).await)
    }

    /// Poll until `reference` is terminal or `timeout` (capped by the
    /// configured maximum) elapses.
    pub async fn await_settlement(
        &self,
        reference: &str,
        timeout: Option<Duration>,
    ) -> Result<PaymentStatusView, StatusError> {
        let limit = timeout
            .unwrap_or(self.config.wait_timeout)
            .min(self.config.wait_timeout);
        let started = Instant::now();

        loop {
            let view = self.get_status(reference).await?;
            if view.status.is_terminal() {
                info!(
                    reference = %reference,
                    status = %view.status,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "payment settled"
                );
                return Ok(view);
            }

            let elapsed = started.elapsed();
            if elapsed >= limit {
                return Err(StatusError::Timeout {
                    reference: reference.to_string(),
                    waited_secs: elapsed.as_secs(),
                });
            }
            tokio::time::sleep(self.config.wait_interval.min(limit - elapsed)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::throttle::MemoryThrottle;
    use crate::config::VoucherConfig;
    use crate::database::memory::MemoryStore;
    use crate::database::payment_repository::NewPayment;
    use crate::database::repository::VoucherStore;
    use crate::payments::error::PaymentResult;
    use crate::payments::types::{
        CollectionRequest, CollectionResponse, CollectionStatus, ProviderName,
        WebhookVerificationResult,
    };
    use crate::services::notification::NotificationService;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedStatusProvider {
        status: Option<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CollectionProvider for FixedStatusProvider {
        async fn collect(&self, _request: CollectionRequest) -> PaymentResult<CollectionResponse> {
            unreachable!("status tests never initiate")
        }

        async fn collection_status(&self, id: &str) -> PaymentResult<CollectionStatus> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.status {
                Some(status) => Ok(CollectionStatus {
                    provider_transaction_id: id.to_string(),
                    reference: None,
                    status: status.to_string(),
                    network: Some("mtn".to_string()),
                    amount: None,
                    provider_data: serde_json::Value::Null,
                }),
                None => Err(PaymentError::NetworkError {
                    message: "connection refused".to_string(),
                }),
            }
        }

        fn name(&self) -> ProviderName {
            ProviderName::Sandbox
        }

        fn supported_currencies(&self) -> &'static [&'static str] {
            &["UGX"]
        }

        fn verify_webhook(
            &self,
            _payload: &[u8],
            _signature: Option<&str>,
        ) -> PaymentResult<WebhookVerificationResult> {
            Ok(WebhookVerificationResult {
                valid: true,
                reason: None,
            })
        }
    }

    async fn setup(
        status: Option<&'static str>,
        window: Duration,
    ) -> (Arc<MemoryStore>, Arc<FixedStatusProvider>, PaymentStatusService) {
        let store = Arc::new(MemoryStore::new());
        store.add("V1000-A", 1000).await.unwrap();
        store
            .insert(NewPayment {
                reference: "R1".to_string(),
                subscriber: "256712345678".to_string(),
                denomination: 1000,
                provider: None,
            })
            .await
            .unwrap();
        store.set_provider_transaction_id("R1", "T-1").await.unwrap();

        let provider = Arc::new(FixedStatusProvider {
            status,
            calls: AtomicUsize::new(0),
        });
        let engine = Arc::new(ReconciliationEngine::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(NotificationService::log_only("UGX")),
            VoucherConfig::default(),
        ));
        let service = PaymentStatusService::new(
            store.clone(),
            provider.clone(),
            engine,
            Arc::new(MemoryThrottle::new(window)),
            StatusConfig {
                wait_timeout: Duration::from_millis(300),
                wait_interval: Duration::from_millis(50),
            },
        );
        (store, provider, service)
    }

    #[tokio::test]
    async fn unknown_reference_is_not_found() {
        let (_, _, service) = setup(Some("pending"), Duration::from_secs(5)).await;
        let err = service.get_status("nope").await.unwrap_err();
        assert!(matches!(err, StatusError::NotFound(_)));
        assert_eq!(AppError::from(err).status_code(), 404);
    }

    #[tokio::test]
    async fn provider_completion_is_reconciled_on_query() {
        let (store, _, service) = setup(Some("successful"), Duration::from_secs(5)).await;

        let view = service.get_status("R1").await.unwrap();
        assert_eq!(view.status, PaymentStatus::Successful);
        assert_eq!(view.voucher.as_deref(), Some("V1000-A"));
        assert!(store.find_available(1000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn provider_outage_serves_local_state() {
        let (_, provider, service) = setup(None, Duration::ZERO).await;

        let view = service.get_status("R1").await.unwrap();
        assert_eq!(view.status, PaymentStatus::Processing);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn throttle_limits_provider_checks() {
        let (_, provider, service) = setup(Some("pending"), Duration::from_secs(60)).await;

        service.get_status("R1").await.unwrap();
        service.get_status("R1").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_times_out_while_pending() {
        let (_, _, service) = setup(Some("pending"), Duration::ZERO).await;

        let err = service
            .await_settlement("R1", Some(Duration::from_secs(3600)))
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::Timeout { .. }));
        assert_eq!(AppError::from(err).status_code(), 408);
    }

    #[tokio::test]
    async fn wait_returns_once_settled() {
        let (_, _, service) = setup(Some("failed"), Duration::ZERO).await;

        let view = service.await_settlement("R1", None).await.unwrap();
        assert_eq!(view.status, PaymentStatus::Failed);
        assert!(view.voucher.is_none());
    }
}
