use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::database::error::DatabaseError;
use crate::database::payment_repository::{NewPayment, PaymentStatus, Transition};
use crate::database::repository::PaymentStore;
use crate::error::{AppError, AppErrorKind, ValidationError};
use crate::logging::mask_phone;
use crate::payments::error::PaymentError;
use crate::payments::provider::CollectionProvider;
use crate::payments::types::{CollectionRequest, Money};
use crate::services::denominations::{DenominationSet, InvalidDenomination};
use crate::services::phone::normalize_phone;

#[derive(Debug, Error)]
pub enum InitiationError {
    #[error("invalid phone number: {0}")]
    InvalidPhone(String),

    #[error(transparent)]
    InvalidDenomination(#[from] InvalidDenomination),

    /// The record exists under `reference`; it is Failed when the provider
    /// definitively refused, otherwise still Processing.
    #[error("payment provider error for {reference}: {source}")]
    Provider {
        reference: String,
        #[source]
        source: PaymentError,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl InitiationError {
    pub fn reference(&self) -> Option<&str> {
        match self {
            InitiationError::Provider { reference, .. } => Some(reference),
            _ => None,
        }
    }
}

impl From<InitiationError> for AppError {
    fn from(err: InitiationError) -> Self {
        match err {
            InitiationError::InvalidPhone(phone) => {
                AppError::new(AppErrorKind::Validation(ValidationError::InvalidPhoneNumber {
                    phone,
                }))
            }
            InitiationError::InvalidDenomination(e) => e.into(),
            InitiationError::Provider { source, .. } => source.into(),
            InitiationError::Database(e) => e.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InitiatedPayment {
    pub reference: String,
    pub provider_transaction_id: String,
    pub status: PaymentStatus,
    pub amount: i64,
    pub phone: String,
    pub payment_response: JsonValue,
}

pub struct PaymentInitiationService {
    payments: Arc<dyn PaymentStore>,
    provider: Arc<dyn CollectionProvider>,
    denominations: DenominationSet,
    currency: String,
}

impl PaymentInitiationService {
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        provider: Arc<dyn CollectionProvider>,
        denominations: DenominationSet,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            payments,
            provider,
            denominations,
            currency: currency.into(),
        }
    }

    /// Open a `Processing` record, then ask the gateway to start the collection.
    pub async fn initiate(
        &self,
        phone: &str,
        amount: i64,
    ) -> Result<InitiatedPayment, InitiationError> {
        let denomination = self.denominations.check(amount)?;
        let subscriber =
            normalize_phone(phone).ok_or_else(|| InitiationError::InvalidPhone(phone.to_string()))?;
        let reference = Uuid::new_v4().to_string();

        self.payments
            .insert(NewPayment {
                reference: reference.clone(),
                subscriber: subscriber.clone(),
                denomination,
                provider: None,
            })
            .await?;

        info!(
            reference = %reference,
            phone = %mask_phone(&subscriber),
            amount = denomination,
            "payment record created, starting collection"
        );

        let request = CollectionRequest {
            reference: reference.clone(),
            phone_number: subscriber.clone(),
            amount: Money {
                amount: denomination,
                currency: self.currency.clone(),
            },
            description: format!("{} {} voucher", self.currency, denomination),
            callback_url: None,
        };

        let response = match self.provider.collect(request).await {
            Ok(response) => response,
            Err(e) => return Err(self.reject(reference, e).await),
        };

        if let Err(e) = self
            .payments
            .set_provider_transaction_id(&reference, &response.provider_transaction_id)
            .await
        {
            // Webhooks still correlate by reference
            error!(
                reference = %reference,
                error = %e,
                "failed to store provider transaction id"
            );
        }

        Ok(InitiatedPayment {
            reference,
            provider_transaction_id: response.provider_transaction_id,
            status: PaymentStatus::Processing,
            amount: denomination,
            phone: subscriber,
            payment_response: response.provider_data,
        })
    }

    async fn reject(&self, reference: String, source: PaymentError) -> InitiationError {
        if !source.is_definitive_refusal() {
            warn!(
                reference = %reference,
                error = %source,
                "collection outcome unknown, leaving payment processing"
            );
        } else {
            match self.payments.mark_failed(&reference).await {
                Ok(Transition::Applied(_)) => warn!(
                    reference = %reference,
                    error = %source,
                    "collection refused, payment marked failed"
                ),
                Ok(_) => {}
                Err(e) => error!(
                    reference = %reference,
                    error = %e,
                    "failed to mark refused payment as failed"
                ),
            }
        }

        InitiationError::Provider { reference, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryStore;
    use crate::payments::error::PaymentResult;
    use crate::payments::types::{
        CollectionResponse, CollectionStatus, ProviderName, WebhookVerificationResult,
    };
    use async_trait::async_trait;

    struct FailingProvider {
        error: PaymentError,
    }

    #[async_trait]
    impl CollectionProvider for FailingProvider {
        async fn collect(&self, _request: CollectionRequest) -> PaymentResult<CollectionResponse> {
            Err(self.error.clone())
        }

        async fn collection_status(&self, _id: &str) -> PaymentResult<CollectionStatus> {
            Err(self.error.clone())
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

    fn service(store: &Arc<MemoryStore>, error: PaymentError) -> PaymentInitiationService {
        PaymentInitiationService::new(
            store.clone(),
            Arc::new(FailingProvider { error }),
            DenominationSet::default(),
            "UGX",
        )
    }

    #[tokio::test]
    async fn invalid_denomination_creates_nothing() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(
            &store,
            PaymentError::NetworkError {
                message: "down".to_string(),
            },
        );

        let err = svc.initiate("+256712345678", 999).await.unwrap_err();
        assert!(matches!(err, InitiationError::InvalidDenomination(_)));

        let err = svc.initiate("12345", 1000).await.unwrap_err();
        assert!(matches!(err, InitiationError::InvalidPhone(_)));
        assert!(store
            .list_processing(chrono::Utc::now() + chrono::Duration::seconds(1), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn declined_collection_marks_record_failed() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(
            &store,
            PaymentError::PaymentDeclinedError {
                message: "invalid number".to_string(),
                provider_code: None,
            },
        );

        let err = svc.initiate("0712345678", 1000).await.unwrap_err();
        let reference = err.reference().unwrap().to_string();

        let record = store.find(&reference).await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Failed);
        assert_eq!(AppError::from(err).status_code(), 502);
    }

    #[tokio::test]
    async fn unreachable_provider_leaves_record_processing() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(
            &store,
            PaymentError::NetworkError {
                message: "timeout".to_string(),
            },
        );

        let err = svc.initiate("0712345678", 1500).await.unwrap_err();
        let record = store.find(err.reference().unwrap()).await.unwrap().unwrap();

        assert_eq!(record.status, PaymentStatus::Processing);
        assert_eq!(record.subscriber, "256712345678");
        assert_eq!(record.denomination, 1500);
    }

    #[tokio::test]
    async fn unreadable_gateway_answer_leaves_record_processing() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(
            &store,
            PaymentError::ProviderError {
                provider: "marzpay".to_string(),
                message: "invalid provider JSON response".to_string(),
                provider_code: None,
                retryable: true,
            },
        );

        let err = svc.initiate("0712345678", 1000).await.unwrap_err();
        let record = store.find(err.reference().unwrap()).await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Processing);
    }

    #[tokio::test]
    async fn client_error_from_gateway_marks_record_failed() {
        let store = Arc::new(MemoryStore::new());
        let svc = service(
            &store,
            PaymentError::ProviderError {
                provider: "marzpay".to_string(),
                message: "HTTP 422 Unprocessable Entity: invalid msisdn".to_string(),
                provider_code: Some("422".to_string()),
                retryable: false,
            },
        );

        let err = svc.initiate("0712345678", 1000).await.unwrap_err();
        let record = store.find(err.reference().unwrap()).await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Failed);
    }
}
