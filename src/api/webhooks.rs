use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::{error, info, warn};

use crate::api::ApiContext;
use crate::payments::types::WebhookPayload;
use crate::services::reconciliation::ReconciliationRequest;

pub const SIGNATURE_HEADER: &str = "x-marz-signature";
pub const SUPPORTED_EVENTS: [&str; 2] = ["collection.completed", "collection.failed"];

pub fn routes(ctx: &ApiContext) -> Router {
    Router::new()
        .route("/api/webhook", post(handle_webhook).get(webhook_status))
        .route("/api/webhook/completed", post(handle_webhook))
        .route("/api/webhook/success", post(handle_webhook))
        .route("/api/webhook/failure", post(handle_webhook))
        .route("/api/webhook/verify", get(verify_endpoint))
        .with_state(ctx.clone())
}

/// The gateway retries anything that is not a 200, so every branch answers 200.
fn acknowledge(body: serde_json::Value) -> Response {
    (StatusCode::OK, Json(body)).into_response()
}

fn rejected(message: &str, reason: Option<String>) -> Response {
    acknowledge(json!({
        "success": false,
        "message": message,
        "error": reason,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// POST /api/webhook (and aliases)
pub async fn handle_webhook(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match ctx.provider.verify_webhook(&body, signature) {
        Ok(result) if result.valid => {}
        Ok(result) => {
            warn!(reason = ?result.reason, "webhook signature rejected");
            return rejected("Invalid signature", result.reason);
        }
        Err(e) => {
            error!(error = %e, "webhook signature check failed");
            return rejected("Invalid signature", Some(e.to_string()));
        }
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, body_len = body.len(), "malformed webhook body");
            return rejected("Malformed payload", Some(e.to_string()));
        }
    };

    info!(
        event_type = %payload.event_type(),
        reference = ?payload.reference(),
        status = ?payload.status(),
        network = ?payload.network(),
        "webhook received"
    );

    let outcome = ctx
        .engine
        .handle_callback(ReconciliationRequest::from_webhook(&payload))
        .await;
    acknowledge(outcome.acknowledgment())
}

/// GET /api/webhook
pub async fn webhook_status(State(ctx): State<ApiContext>) -> Json<serde_json::Value> {
    let processed = match ctx.stores.ledger.count_processed().await {
        Ok(count) => Some(count),
        Err(e) => {
            warn!(error = %e, "could not count processed callbacks");
            None
        }
    };

    Json(json!({
        "message": "Webhook endpoint is active",
        "processed_callbacks": processed,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// GET /api/webhook/verify
pub async fn verify_endpoint() -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "message": "Webhook endpoint verified",
        "supported_events": SUPPORTED_EVENTS,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
