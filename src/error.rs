//! Unified error handling for the voucher backend
//!
//! This module provides a unified error system with proper HTTP status mapping,
//! user-friendly messages, and structured error codes for client handling.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::services::denominations::InvalidDenomination;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "PAYMENT_NOT_FOUND")]
    PaymentNotFound,
    #[serde(rename = "INVALID_DENOMINATION")]
    InvalidDenomination,
    #[serde(rename = "DUPLICATE_VOUCHER")]
    DuplicateVoucher,
    #[serde(rename = "PAYMENT_TIMEOUT")]
    PaymentTimeout,
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CACHE_ERROR")]
    CacheError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors (502, 503, 504)
    #[serde(rename = "PAYMENT_PROVIDER_ERROR")]
    PaymentProviderError,
    #[serde(rename = "SMS_PROVIDER_ERROR")]
    SmsProviderError,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Domain-specific business logic errors
#[derive(Debug, Clone)]
pub enum DomainError {
    /// No payment record exists for the reference
    PaymentNotFound { reference: String },
    /// Amount is not one of the sold voucher values
    InvalidDenomination { amount: i64, allowed: String },
    /// Voucher code already loaded into inventory
    DuplicateVoucher { code: String },
    /// Bounded wait elapsed before the payment settled
    SettlementTimeout { reference: String, waited_secs: u64 },
    /// Missing or wrong operator token
    Unauthorized,
}

/// Infrastructure-level errors (database, cache, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    /// Database connection or query failure
    Database { message: String, is_retryable: bool },
    /// Redis cache unavailable
    Cache { message: String },
    /// Missing or invalid configuration
    Configuration { message: String },
}

/// External service errors (payment gateway, SMS gateway)
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// Mobile money collection gateway error
    PaymentProvider {
        provider: String,
        message: String,
        is_retryable: bool,
    },
    /// SMS gateway error
    Sms { message: String },
    /// External service timeout
    Timeout { service: String, timeout_secs: u64 },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    /// Required field missing
    MissingField { field: String },
    /// Phone number fails the subscriber number check
    InvalidPhoneNumber { phone: String },
    /// Invalid amount (format or value)
    InvalidAmount { amount: String, reason: String },
    /// Request body could not be parsed
    InvalidPayload { reason: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Validation(ValidationError::MissingField {
            field: field.into(),
        }))
    }

    pub fn invalid_payload(reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Validation(ValidationError::InvalidPayload {
            reason: reason.into(),
        }))
    }

    pub fn payment_not_found(reference: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Domain(DomainError::PaymentNotFound {
            reference: reference.into(),
        }))
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentNotFound { .. } => 404,
                DomainError::InvalidDenomination { .. } => 400,
                DomainError::DuplicateVoucher { .. } => 409, // Conflict
                DomainError::SettlementTimeout { .. } => 408, // Request Timeout
                DomainError::Unauthorized => 401,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => 502, // Bad Gateway
                ExternalError::Sms { .. } => 502,
                ExternalError::Timeout { .. } => 504, // Gateway Timeout
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentNotFound { .. } => ErrorCode::PaymentNotFound,
                DomainError::InvalidDenomination { .. } => ErrorCode::InvalidDenomination,
                DomainError::DuplicateVoucher { .. } => ErrorCode::DuplicateVoucher,
                DomainError::SettlementTimeout { .. } => ErrorCode::PaymentTimeout,
                DomainError::Unauthorized => ErrorCode::Unauthorized,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Cache { .. } => ErrorCode::CacheError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => ErrorCode::PaymentProviderError,
                ExternalError::Sms { .. } => ErrorCode::SmsProviderError,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentNotFound { .. } => "Payment not found".to_string(),
                DomainError::InvalidDenomination { amount, allowed } => {
                    format!(
                        "Amount {} is not available. Choose one of: {}",
                        amount, allowed
                    )
                }
                DomainError::DuplicateVoucher { code } => {
                    format!("Voucher '{}' already exists", code)
                }
                DomainError::SettlementTimeout { waited_secs, .. } => {
                    format!(
                        "Payment was not confirmed within {} seconds. Check again later or contact support",
                        waited_secs
                    )
                }
                DomainError::Unauthorized => "Authorization required".to_string(),
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider {
                    provider,
                    is_retryable,
                    ..
                } => {
                    if *is_retryable {
                        format!(
                            "Payment provider ({}) is temporarily unavailable. Please try again",
                            provider
                        )
                    } else {
                        "Payment could not be started. Please contact support".to_string()
                    }
                }
                ExternalError::Sms { .. } => "Failed to send SMS".to_string(),
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => {
                    format!(
                        "{} request timed out after {} seconds. Please try again",
                        service, timeout_secs
                    )
                }
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::InvalidPhoneNumber { .. } => {
                    "Please enter a valid Ugandan phone number".to_string()
                }
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                ValidationError::InvalidPayload { reason } => {
                    format!("Invalid request body: {}", reason)
                }
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(err) => matches!(err, DomainError::SettlementTimeout { .. }),
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Cache { .. } => true,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { is_retryable, .. } => *is_retryable,
                ExternalError::Sms { .. } => true,
                ExternalError::Timeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

// Note: From<DatabaseError> is implemented in database/error.rs to avoid circular dependency

impl From<InvalidDenomination> for AppError {
    fn from(err: InvalidDenomination) -> Self {
        AppError::new(AppErrorKind::Domain(DomainError::InvalidDenomination {
            amount: err.amount,
            allowed: err.allowed,
        }))
    }
}

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_not_found_error() {
        let error = AppError::payment_not_found("R1");

        assert_eq!(error.status_code(), 404);
        assert_eq!(error.error_code(), ErrorCode::PaymentNotFound);
        assert_eq!(error.user_message(), "Payment not found");
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_invalid_denomination_error() {
        let error: AppError = InvalidDenomination {
            amount: 999,
            allowed: "600,1000".to_string(),
        }
        .into();

        assert_eq!(error.status_code(), 400);
        assert_eq!(error.error_code(), ErrorCode::InvalidDenomination);
        assert!(error.user_message().contains("600,1000"));
    }

    #[test]
    fn test_provider_error_is_bad_gateway() {
        let error = AppError::new(AppErrorKind::External(ExternalError::PaymentProvider {
            provider: "marzpay".to_string(),
            message: "HTTP 503".to_string(),
            is_retryable: true,
        }));

        assert_eq!(error.status_code(), 502);
        assert_eq!(error.error_code(), ErrorCode::PaymentProviderError);
        assert!(error.is_retryable());
    }

    #[test]
    fn test_validation_error() {
        let error = AppError::missing_field("reference");

        assert_eq!(error.status_code(), 400);
        assert_eq!(error.error_code(), ErrorCode::ValidationError);
        assert_eq!(error.user_message(), "Required field 'reference' is missing");
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_settlement_timeout_error() {
        let error = AppError::new(AppErrorKind::Domain(DomainError::SettlementTimeout {
            reference: "R1".to_string(),
            waited_secs: 300,
        }));

        assert_eq!(error.status_code(), 408);
        assert_eq!(error.error_code(), ErrorCode::PaymentTimeout);
        assert!(error.is_retryable());
    }
}
