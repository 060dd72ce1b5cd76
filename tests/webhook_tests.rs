#[cfg(test)]
mod webhook_tests {
    use serde_json::json;
    use voucher_backend::payments::providers::{MarzPayConfig, MarzPayProvider};
    use voucher_backend::payments::types::WebhookPayload;
    use voucher_backend::payments::utils::hmac_sha256_hex;
    use voucher_backend::payments::{map_provider_status, CollectionProvider, MappedStatus};
    use voucher_backend::services::reconciliation::ReconciliationRequest;

    fn provider_with_secret(secret: Option<&str>) -> MarzPayProvider {
        MarzPayProvider::new(MarzPayConfig {
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            webhook_secret: secret.map(str::to_string),
            ..MarzPayConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_amount_as_numeric_string() {
        let payload: WebhookPayload = serde_json::from_value(json!({
            "event_type": "collection.completed",
            "transaction": {
                "uuid": "U1",
                "reference": "R1",
                "status": "successful",
                "amount": { "raw": "1500" }
            }
        }))
        .unwrap();

        assert_eq!(payload.amount(), Some(1500));
    }

    #[test]
    fn test_fractional_amount_is_rejected() {
        let payload: WebhookPayload = serde_json::from_value(json!({
            "transaction": { "reference": "R1", "amount": { "raw": "1000.50" } }
        }))
        .unwrap();

        assert_eq!(payload.amount(), None);
    }

    #[test]
    fn test_network_falls_back_to_transaction_provider() {
        let payload: WebhookPayload = serde_json::from_value(json!({
            "transaction": { "reference": "R1", "status": "TS", "provider": "airtel" },
            "collection": { "provider": "  " }
        }))
        .unwrap();

        assert_eq!(payload.network(), Some("airtel"));
        assert_eq!(
            map_provider_status(payload.status().unwrap(), payload.network()),
            MappedStatus::Completed
        );
    }

    #[test]
    fn test_missing_fields_still_parse() {
        let payload: WebhookPayload = serde_json::from_str("{}").unwrap();

        assert_eq!(payload.event_type(), "unknown");
        assert_eq!(payload.reference(), None);
        assert!(ReconciliationRequest::from_webhook(&payload).key().is_none());
    }

    #[test]
    fn test_callback_key_uses_event_and_uuid() {
        let payload: WebhookPayload = serde_json::from_value(json!({
            "event_type": "collection.completed",
            "transaction": { "uuid": "U9", "reference": "R9", "status": "completed" }
        }))
        .unwrap();

        let key = ReconciliationRequest::from_webhook(&payload).key().unwrap();
        assert_eq!(key.reference, "R9");
        assert_eq!(key.event_type, "collection.completed");
        assert_eq!(key.provider_uuid, "U9");
    }

    #[test]
    fn test_signature_accepted_when_no_secret_configured() {
        let provider = provider_with_secret(None);
        let result = provider.verify_webhook(b"{}", None).unwrap();
        assert!(result.valid);
    }

    #[test]
    fn test_hmac_signature_verification() {
        let provider = provider_with_secret(Some("whsec_test"));
        let body = br#"{"event_type":"collection.completed"}"#;
        let signature = hmac_sha256_hex(body, "whsec_test").unwrap();

        assert!(provider.verify_webhook(body, Some(&signature)).unwrap().valid);
        assert!(
            provider
                .verify_webhook(body, Some(&format!("sha256={}", signature.to_uppercase())))
                .unwrap()
                .valid
        );

        let tampered = provider
            .verify_webhook(br#"{"event_type":"collection.failed"}"#, Some(&signature))
            .unwrap();
        assert!(!tampered.valid);

        let missing = provider.verify_webhook(body, None).unwrap();
        assert!(!missing.valid);
        assert_eq!(missing.reason.as_deref(), Some("missing marzpay signature"));
    }
}
