//! Voucher inventory administration and manual SMS resends.
//!
//! Mounted only when an admin token is configured; every route requires
//! `Authorization: Bearer <token>`.

use axum::{
    extract::{rejection::JsonRejection, Query, Request, State},
    http::{header, HeaderMap},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::payments::{parse_body, required, tag};
use crate::api::ApiContext;
use crate::database::voucher_repository::VoucherFilter;
use crate::error::{AppError, AppErrorKind, DomainError, ValidationError};
use crate::logging::mask_phone;
use crate::middleware::error::{
    get_request_id_from_headers, success_response, success_response_with_meta,
};
use crate::payments::utils::secure_eq;
use crate::services::phone::normalize_phone;

pub const DEFAULT_LIST_LIMIT: i64 = 50;
pub const MAX_LIST_LIMIT: i64 = 500;

pub fn routes(ctx: &ApiContext, token: &str) -> Router {
    let token: Arc<str> = Arc::from(token);

    Router::new()
        .route("/api/admin/vouchers", post(add_voucher).get(list_vouchers))
        .route("/api/admin/vouchers/bulk", post(add_vouchers_bulk))
        .route("/api/admin/vouchers/summary", get(voucher_summary))
        .route("/api/send-sms", post(send_sms))
        .route_layer(middleware::from_fn_with_state(token, require_admin))
        .with_state(ctx.clone())
}

/// Constant-time bearer token check
pub async fn require_admin(
    State(token): State<Arc<str>>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match presented {
        Some(presented) if secure_eq(presented.as_bytes(), token.as_bytes()) => {
            next.run(request).await
        }
        _ => {
            warn!(path = %request.uri().path(), "admin request rejected");
            let mut error = AppError::new(AppErrorKind::Domain(DomainError::Unauthorized));
            if let Some(id) = get_request_id_from_headers(request.headers()) {
                error = error.with_request_id(id);
            }
            error.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AddVoucherRequest {
    pub code: Option<String>,
    pub amount: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct BulkVoucherRequest {
    pub amount: Option<i64>,
    #[serde(default)]
    pub codes: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct VoucherListQuery {
    pub amount: Option<i64>,
    pub used: Option<bool>,
    pub limit: Option<i64>,
}

impl VoucherListQuery {
    pub fn into_filter(self) -> VoucherFilter {
        VoucherFilter {
            denomination: self.amount,
            consumed: self.used,
            limit: self
                .limit
                .unwrap_or(DEFAULT_LIST_LIMIT)
                .clamp(1, MAX_LIST_LIMIT),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SendSmsRequest {
    pub phone: Option<String>,
    pub message: Option<String>,
}

fn checked_amount(
    ctx: &ApiContext,
    amount: Option<i64>,
    request_id: Option<&String>,
) -> Result<i64, AppError> {
    let amount = amount.ok_or_else(|| tag(AppError::missing_field("amount"), request_id))?;
    ctx.vouchers
        .denominations
        .check(amount)
        .map_err(|e| tag(e.into(), request_id))
}

/// POST /api/admin/vouchers
pub async fn add_voucher(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    body: Result<Json<AddVoucherRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let request_id = get_request_id_from_headers(&headers);
    let rid = request_id.as_ref();

    let request = parse_body(body, rid)?;
    let code = required(request.code, "code", rid)?;
    let amount = checked_amount(&ctx, request.amount, rid)?;

    let voucher = ctx
        .stores
        .vouchers
        .add(&code, amount)
        .await
        .map_err(|e| tag(e.into(), rid))?;
    info!(code = %voucher.code, amount = voucher.denomination, "voucher added");

    Ok(success_response(voucher).into_response())
}

/// POST /api/admin/vouchers/bulk
pub async fn add_vouchers_bulk(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    body: Result<Json<BulkVoucherRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let request_id = get_request_id_from_headers(&headers);
    let rid = request_id.as_ref();

    let request = parse_body(body, rid)?;
    let amount = checked_amount(&ctx, request.amount, rid)?;
    let codes: Vec<String> = request
        .codes
        .iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if codes.is_empty() {
        return Err(tag(AppError::missing_field("codes"), rid));
    }

    let summary = ctx
        .stores
        .vouchers
        .add_bulk(&codes, amount)
        .await
        .map_err(|e| tag(e.into(), rid))?;
    info!(
        amount = amount,
        inserted = summary.inserted,
        skipped = summary.skipped.len(),
        "voucher batch imported"
    );

    Ok(success_response(summary).into_response())
}

/// GET /api/admin/vouchers
pub async fn list_vouchers(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    query: Result<Query<VoucherListQuery>, axum::extract::rejection::QueryRejection>,
) -> Result<Response, AppError> {
    let request_id = get_request_id_from_headers(&headers);
    let rid = request_id.as_ref();

    let Query(query) = query
        .map_err(|rejection| tag(AppError::invalid_payload(rejection.body_text()), rid))?;
    let filter = query.into_filter();

    let vouchers = ctx
        .stores
        .vouchers
        .list(&filter)
        .await
        .map_err(|e| tag(e.into(), rid))?;

    let meta = serde_json::json!({
        "count": vouchers.len(),
        "limit": filter.limit,
        "amount": filter.denomination,
        "used": filter.consumed,
    });
    Ok(success_response_with_meta(vouchers, meta).into_response())
}

/// GET /api/admin/vouchers/summary
pub async fn voucher_summary(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let request_id = get_request_id_from_headers(&headers);

    let stock = ctx
        .stores
        .vouchers
        .counts_by_denomination()
        .await
        .map_err(|e| tag(e.into(), request_id.as_ref()))?;

    Ok(success_response(stock).into_response())
}

/// POST /api/send-sms
pub async fn send_sms(
    State(ctx): State<ApiContext>,
    headers: HeaderMap,
    body: Result<Json<SendSmsRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let request_id = get_request_id_from_headers(&headers);
    let rid = request_id.as_ref();

    let request = parse_body(body, rid)?;
    let raw_phone = required(request.phone, "phone", rid)?;
    let message = required(request.message, "message", rid)?;
    let phone = normalize_phone(&raw_phone).ok_or_else(|| {
        tag(
            AppError::new(AppErrorKind::Validation(ValidationError::InvalidPhoneNumber {
                phone: raw_phone.clone(),
            })),
            rid,
        )
    })?;

    let notifier = ctx.notifications.notifier();
    let provider_response = notifier
        .send_sms(&phone, &message)
        .await
        .map_err(|e| tag(e.into(), rid))?;
    info!(phone = %mask_phone(&phone), channel = notifier.name(), "manual SMS sent");

    Ok(success_response(serde_json::json!({
        "phone": phone,
        "channel": notifier.name(),
        "provider_response": provider_response,
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_limit_is_defaulted_and_capped() {
        assert_eq!(VoucherListQuery::default().into_filter().limit, 50);

        let capped = VoucherListQuery {
            limit: Some(10_000),
            ..VoucherListQuery::default()
        };
        assert_eq!(capped.into_filter().limit, 500);

        let floor = VoucherListQuery {
            limit: Some(0),
            ..VoucherListQuery::default()
        };
        assert_eq!(floor.into_filter().limit, 1);
    }
}
