use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::CollectionProvider;
use crate::payments::types::{
    CollectionRequest, CollectionResponse, CollectionStatus, ProviderName, RawAmount,
    WebhookVerificationResult,
};
use crate::payments::utils::{verify_hmac_sha256_hex, HttpAuth, PaymentHttpClient};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{debug, info};

const PROVIDER: &str = "marzpay";

#[derive(Debug, Clone)]
pub struct MarzPayConfig {
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
    pub callback_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub country: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for MarzPayConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            base_url: "https://wallet.wearemarz.com/api/v1".to_string(),
            callback_url: None,
            webhook_secret: None,
            country: "UG".to_string(),
            timeout_secs: 30,
            max_retries: 2,
        }
    }
}

impl MarzPayConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let required = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| PaymentError::ValidationError {
                    message: format!("{} environment variable is required", name),
                    field: Some(name.to_string()),
                })
        };

        Ok(Self {
            api_key: required("MARZPAY_API_KEY")?,
            api_secret: required("MARZPAY_API_SECRET")?,
            base_url: std::env::var("MARZPAY_BASE_URL")
                .unwrap_or_else(|_| "https://wallet.wearemarz.com/api/v1".to_string()),
            callback_url: std::env::var("MARZPAY_CALLBACK_URL").ok(),
            webhook_secret: std::env::var("MARZPAY_WEBHOOK_SECRET")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            country: std::env::var("MARZPAY_COUNTRY").unwrap_or_else(|_| "UG".to_string()),
            timeout_secs: std::env::var("MARZPAY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30),
            max_retries: std::env::var("MARZPAY_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(2),
        })
    }
}

pub struct MarzPayProvider {
    config: MarzPayConfig,
    auth: HttpAuth,
    http: PaymentHttpClient,
}

impl MarzPayProvider {
    pub fn new(config: MarzPayConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(
            PROVIDER,
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        let auth = HttpAuth::Basic {
            username: config.api_key.clone(),
            password: config.api_secret.clone(),
        };
        Ok(Self { config, auth, http })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(MarzPayConfig::from_env()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Parse the envelope, keeping the raw body for passthrough
    fn unwrap_envelope(raw: JsonValue) -> PaymentResult<(MarzData, JsonValue)> {
        let envelope: MarzEnvelope =
            serde_json::from_value(raw.clone()).map_err(|e| PaymentError::ProviderError {
                provider: PROVIDER.to_string(),
                message: format!("unexpected response shape: {}", e),
                provider_code: None,
                retryable: true,
            })?;

        if !envelope.status.eq_ignore_ascii_case("success") {
            return Err(PaymentError::PaymentDeclinedError {
                message: envelope
                    .message
                    .unwrap_or_else(|| "collection rejected".to_string()),
                provider_code: Some(envelope.status),
            });
        }

        let data = envelope.data.ok_or_else(|| PaymentError::ProviderError {
            provider: PROVIDER.to_string(),
            message: "response has no data".to_string(),
            provider_code: None,
            retryable: true,
        })?;

        Ok((data, raw))
    }
}

#[async_trait]
impl CollectionProvider for MarzPayProvider {
    async fn collect(&self, request: CollectionRequest) -> PaymentResult<CollectionResponse> {
        request.amount.validate_positive("amount")?;
        if request.phone_number.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "phone_number is required".to_string(),
                field: Some("phone_number".to_string()),
            });
        }

        let payload = serde_json::json!({
            "amount": request.amount.amount,
            "phone_number": format!("+{}", request.phone_number.trim_start_matches('+')),
            "country": self.config.country,
            "reference": request.reference,
            "description": request.description,
            "callback_url": request.callback_url.as_ref().or(self.config.callback_url.as_ref()),
        });

        let raw: JsonValue = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/collect-money"),
                Some(&self.auth),
                Some(&payload),
                &[("Content-Type", "application/json")],
            )
            .await?;
        let (data, raw) = Self::unwrap_envelope(raw)?;

        info!(
            reference = %request.reference,
            provider_transaction_id = %data.transaction.uuid,
            "marzpay collection initiated"
        );

        Ok(CollectionResponse {
            provider_transaction_id: data.transaction.uuid,
            reference: data.transaction.reference.unwrap_or(request.reference),
            status: data
                .transaction
                .status
                .unwrap_or_else(|| "pending".to_string()),
            network: data.collection.and_then(|c| c.provider),
            provider_data: raw,
        })
    }

    async fn collection_status(
        &self,
        provider_transaction_id: &str,
    ) -> PaymentResult<CollectionStatus> {
        if provider_transaction_id.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "provider transaction id is required".to_string(),
                field: Some("uuid".to_string()),
            });
        }

        let raw: JsonValue = self
            .http
            .request_json(
                reqwest::Method::GET,
                &self.endpoint(&format!("/collect-money/{}", provider_transaction_id)),
                Some(&self.auth),
                None,
                &[],
            )
            .await?;
        let (data, raw) = Self::unwrap_envelope(raw)?;
        debug!(
            provider_transaction_id = %provider_transaction_id,
            status = ?data.transaction.status,
            "marzpay status fetched"
        );

        Ok(CollectionStatus {
            provider_transaction_id: data.transaction.uuid,
            reference: data.transaction.reference,
            status: data
                .transaction
                .status
                .unwrap_or_else(|| "pending".to_string()),
            network: data.collection.and_then(|c| c.provider),
            amount: data
                .transaction
                .amount
                .and_then(|a| a.raw)
                .and_then(|raw| raw.as_i64()),
            provider_data: raw,
        })
    }

    fn name(&self) -> ProviderName {
        ProviderName::Marzpay
    }

    fn supported_currencies(&self) -> &'static [&'static str] {
        &["UGX"]
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> PaymentResult<WebhookVerificationResult> {
        let Some(secret) = self.config.webhook_secret.as_deref() else {
            return Ok(WebhookVerificationResult {
                valid: true,
                reason: None,
            });
        };

        let valid = signature.is_some_and(|sig| verify_hmac_sha256_hex(payload, secret, sig));
        Ok(WebhookVerificationResult {
            valid,
            reason: match (valid, signature) {
                (true, _) => None,
                (false, None) => Some("missing marzpay signature".to_string()),
                (false, Some(_)) => Some("invalid marzpay signature".to_string()),
            },
        })
    }
}

#[derive(Debug, Deserialize)]
struct MarzEnvelope {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<MarzData>,
}

#[derive(Debug, Deserialize)]
struct MarzData {
    transaction: MarzTransaction,
    #[serde(default)]
    collection: Option<MarzCollection>,
}

#[derive(Debug, Deserialize)]
struct MarzTransaction {
    uuid: String,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    amount: Option<MarzAmount>,
}

#[derive(Debug, Deserialize)]
struct MarzAmount {
    #[serde(default)]
    raw: Option<RawAmount>,
}

#[derive(Debug, Deserialize)]
struct MarzCollection {
    #[serde(default)]
    provider: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(webhook_secret: Option<&str>) -> MarzPayProvider {
        MarzPayProvider::new(MarzPayConfig {
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            webhook_secret: webhook_secret.map(str::to_string),
            timeout_secs: 5,
            max_retries: 0,
            ..MarzPayConfig::default()
        })
        .expect("provider init should succeed")
    }

    #[test]
    fn webhook_signature_validation_invalid() {
        let provider = provider(Some("whsec"));
        let payload = br#"{"event_type":"collection.completed"}"#;

        let result = provider
            .verify_webhook(payload, Some("invalid_signature"))
            .expect("verification should not error");
        assert!(!result.valid);

        let missing = provider.verify_webhook(payload, None).unwrap();
        assert_eq!(missing.reason.as_deref(), Some("missing marzpay signature"));
    }

    #[test]
    fn webhook_signature_accepted_when_no_secret() {
        let result = provider(None).verify_webhook(b"{}", None).unwrap();
        assert!(result.valid);
    }

    #[test]
    fn envelope_success_yields_transaction() {
        let raw = serde_json::json!({
            "status": "success",
            "message": "Collection initiated",
            "data": {
                "transaction": { "uuid": "T-1", "reference": "R1", "status": "processing" },
                "collection": { "provider": "mtn" }
            }
        });

        let (data, passthrough) = MarzPayProvider::unwrap_envelope(raw.clone()).unwrap();
        assert_eq!(data.transaction.uuid, "T-1");
        assert_eq!(data.collection.and_then(|c| c.provider).as_deref(), Some("mtn"));
        assert_eq!(passthrough, raw);
    }

    #[test]
    fn envelope_error_is_a_decline() {
        let raw = serde_json::json!({ "status": "error", "message": "Invalid phone number" });

        let err = MarzPayProvider::unwrap_envelope(raw).unwrap_err();
        assert!(matches!(err, PaymentError::PaymentDeclinedError { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn malformed_success_envelope_is_ambiguous() {
        for raw in [
            serde_json::json!({ "unexpected": true }),
            serde_json::json!({ "status": "success", "message": "queued" }),
        ] {
            let err = MarzPayProvider::unwrap_envelope(raw).unwrap_err();
            assert!(err.is_retryable());
            assert!(!err.is_definitive_refusal());
        }
    }

    #[test]
    fn endpoint_tolerates_trailing_slash() {
        let provider = MarzPayProvider::new(MarzPayConfig {
            base_url: "https://example.test/api/v1/".to_string(),
            ..MarzPayConfig::default()
        })
        .unwrap();
        assert_eq!(
            provider.endpoint("/collect-money"),
            "https://example.test/api/v1/collect-money"
        );
    }
}
