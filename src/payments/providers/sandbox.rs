use crate::payments::error::PaymentResult;
use crate::payments::provider::CollectionProvider;
use crate::payments::types::{
    CollectionRequest, CollectionResponse, CollectionStatus, ProviderName,
    WebhookVerificationResult,
};
use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

/// Accepts every collection without contacting a gateway.
///
/// Collections stay pending until a webhook (or the failure simulation) resolves them.
#[derive(Debug, Default, Clone)]
pub struct SandboxProvider;

#[async_trait]
impl CollectionProvider for SandboxProvider {
    async fn collect(&self, request: CollectionRequest) -> PaymentResult<CollectionResponse> {
        request.amount.validate_positive("amount")?;
        let provider_transaction_id = Uuid::new_v4().to_string();

        info!(
            reference = %request.reference,
            provider_transaction_id = %provider_transaction_id,
            amount = request.amount.amount,
            "sandbox collection accepted"
        );

        Ok(CollectionResponse {
            provider_data: serde_json::json!({
                "status": "success",
                "message": "sandbox collection accepted",
                "data": {
                    "transaction": {
                        "uuid": provider_transaction_id,
                        "reference": request.reference,
                        "status": "pending",
                    }
                }
            }),
            provider_transaction_id,
            reference: request.reference,
            status: "pending".to_string(),
            network: None,
        })
    }

    async fn collection_status(
        &self,
        provider_transaction_id: &str,
    ) -> PaymentResult<CollectionStatus> {
        Ok(CollectionStatus {
            provider_transaction_id: provider_transaction_id.to_string(),
            reference: None,
            status: "pending".to_string(),
            network: None,
            amount: None,
            provider_data: serde_json::json!({}),
        })
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
