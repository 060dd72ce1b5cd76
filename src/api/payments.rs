use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

use crate::api::ApiContext;
use crate::error::{AppError, AppErrorKind, ValidationError};
use crate::middleware::error::{
    error_response_with_details, get_request_id_from_headers, success_response,
};
use crate::payments::types::RawAmount;
use crate::services::payment_status::PaymentStatusView;
use crate::payments::MappedStatus;
use crate::services::reconciliation::ReconciliationRequest;

pub const SIMULATED_FAILURE_EVENT: &str = "simulation.failed";
pub const SIMULATED_COMPLETION_EVENT: &str = "simulation.completed";

pub fn routes(ctx: &ApiContext) -> Router {
    Router::new()
        .route("/api/pay", post(initiate_payment))
        .route("/api/check-payment", post(check_payment))
        .route("/api/check-payment/wait", post(wait_for_payment))
        .with_state(ctx.clone())
}

pub fn test_routes(ctx: &ApiContext) -> Router {
    Router::new()
        .route("/api/test-failed-payment", post(simulate_failed_payment))
        .route("/api/test-callback", post(simulate_completed_payment))
        .with_state(ctx.clone())
}

#[derive(Debug, Deserialize)]
pub struct PayRequest {
    pub phone: Option<String>,
    pub amount: Option<RawAmount>,
}

#[derive(Debug, Deserialize)]
pub struct ReferenceRequest {
    pub reference: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WaitRequest {
    pub reference: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Turn an extractor rejection into the JSON error body
pub(crate) fn parse_body<T>(
    body: Result<Json<T>, JsonRejection>,
    request_id: Option<&String>,
) -> Result<T, AppError> {
    body.map(|Json(value)| value).map_err(|rejection| {
        tag(AppError::invalid_payload(rejection.body_text()), request_id)
    })
}

pub(crate) fn tag(error: AppError, request_id: Option<&String>) -> AppError {
    match request_id {
        Some(id) => error.with_request_id(id.clone()),
        None => error,
    }
}

pub(crate) fn required(
    value: Option<String>,
    field: &str,
    request_id: Option<&String>,
) -> Result<String, AppError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| tag(AppError::missing_field(field), request_id))
}

fn parse_amount(raw: Option<RawAmount>, request_id: Option<&String>) -> Result<i64, AppError> {
    let raw = raw.ok_or_else(|| tag(AppError::missing_field("amount"), request_id))?;
    raw.as_i64().ok_or_else(|| {
        let shown = match &raw {
            RawAmount::Number(n) => n.to_string(),
            RawAmount::Text(s) => s.clone(),
        };
        tag(
            AppError::new(AppErrorKind::Validation(ValidationError::InvalidAmount {
                amount: shown,
                reason: "must be a whole number".to_string(),
            })),
            request_id,
        )
    })
}

/// POST /api/pay
pub async fn initiate_payment(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    body: Result<Json<PayRequest>, JsonRejection>,
) -> Response {
    let request_id = get_request_id_from_headers(&headers);
    let rid = request_id.as_ref();

    let request = match parse_body(body, rid) {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };
    let phone = match required(request.phone, "phone", rid) {
        Ok(phone) => phone,
        Err(e) => return e.into_response(),
    };
    let amount = match parse_amount(request.amount, rid) {
        Ok(amount) => amount,
        Err(e) => return e.into_response(),
    };

    match ctx.initiation.initiate(&phone, amount).await {
        Ok(payment) => {
            info!(
                reference = %payment.reference,
                amount = payment.amount,
                "payment initiated"
            );
            success_response(payment).into_response()
        }
        Err(e) => {
            let reference = e.reference().map(str::to_string);
            let error = tag(AppError::from(e), rid);
            match reference {
                Some(reference) => {
                    error_response_with_details(error, serde_json::json!({ "reference": reference }))
                }
                None => error.into_response(),
            }
        }
    }
}

/// POST /api/check-payment
pub async fn check_payment(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    body: Result<Json<ReferenceRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let request_id = get_request_id_from_headers(&headers);
    let rid = request_id.as_ref();

    let request = parse_body(body, rid)?;
    let reference = required(request.reference, "reference", rid)?;

    let view = ctx
        .status
        .get_status(&reference)
        .await
        .map_err(|e| tag(e.into(), rid))?;
    Ok(success_response(view).into_response())
}

/// POST /api/check-payment/wait
pub async fn wait_for_payment(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    body: Result<Json<WaitRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let request_id = get_request_id_from_headers(&headers);
    let rid = request_id.as_ref();

    let request = parse_body(body, rid)?;
    let reference = required(request.reference, "reference", rid)?;

    let view = ctx
        .status
        .await_settlement(&reference, request.timeout_secs.map(Duration::from_secs))
        .await
        .map_err(|e| tag(e.into(), rid))?;
    Ok(success_response(view).into_response())
}

/// POST /api/test-failed-payment
pub async fn simulate_failed_payment(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    body: Result<Json<ReferenceRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    simulate(ctx, headers, body, SIMULATED_FAILURE_EVENT, MappedStatus::Failed).await
}

/// POST /api/test-callback
pub async fn simulate_completed_payment(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    body: Result<Json<ReferenceRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    simulate(
        ctx,
        headers,
        body,
        SIMULATED_COMPLETION_EVENT,
        MappedStatus::Completed,
    )
    .await
}

/// Drive the engine for an existing record as if the gateway had answered
async fn simulate(
    ctx: ApiContext,
    headers: HeaderMap,
    body: Result<Json<ReferenceRequest>, JsonRejection>,
    event_type: &str,
    status: MappedStatus,
) -> Result<Response, AppError> {
    let request_id = get_request_id_from_headers(&headers);
    let rid = request_id.as_ref();

    let request = parse_body(body, rid)?;
    let reference = required(request.reference, "reference", rid)?;

    if ctx
        .stores
        .payments
        .find(&reference)
        .await
        .map_err(|e| tag(e.into(), rid))?
        .is_none()
    {
        return Err(tag(AppError::payment_not_found(reference), rid));
    }

    let outcome = ctx
        .engine
        .handle_callback(ReconciliationRequest::internal(&reference, event_type, status))
        .await;
    info!(
        reference = %reference,
        event = event_type,
        outcome = outcome.label(),
        "simulated gateway verdict"
    );

    let record = ctx
        .stores
        .payments
        .find(&reference)
        .await
        .map_err(|e| tag(e.into(), rid))?
        .ok_or_else(|| tag(AppError::payment_not_found(reference.clone()), rid))?;

    Ok(success_response(PaymentStatusView::from(record)).into_response())
}
