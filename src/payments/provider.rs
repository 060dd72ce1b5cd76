use crate::payments::error::PaymentResult;
use crate::payments::types::{
    CollectionRequest, CollectionResponse, CollectionStatus, ProviderName,
    WebhookVerificationResult,
};
use async_trait::async_trait;

/// Mobile-money collection gateway
#[async_trait]
pub trait CollectionProvider: Send + Sync {
    /// Start a collection prompt on the subscriber's handset
    async fn collect(&self, request: CollectionRequest) -> PaymentResult<CollectionResponse>;

    /// Current gateway-side status of a collection
    async fn collection_status(
        &self,
        provider_transaction_id: &str,
    ) -> PaymentResult<CollectionStatus>;

    fn name(&self) -> ProviderName;

    fn supported_currencies(&self) -> &'static [&'static str];

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> PaymentResult<WebhookVerificationResult>;
}
