use crate::database::payment_repository::PaymentRecord;
use crate::database::voucher_repository::VoucherCode;
use crate::logging::mask_phone;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("SMS provider is not configured")]
    NotConfigured,
    #[error("SMS request failed: {0}")]
    Transport(String),
    #[error("SMS provider rejected message: {0}")]
    Rejected(String),
}

impl From<NotificationError> for crate::error::AppError {
    fn from(err: NotificationError) -> Self {
        use crate::error::{AppError, AppErrorKind, ExternalError};

        AppError::new(AppErrorKind::External(ExternalError::Sms {
            message: err.to_string(),
        }))
    }
}

/// Outbound text-message channel
#[async_trait]
pub trait VoucherNotifier: Send + Sync {
    async fn send_sms(&self, phone: &str, message: &str) -> Result<String, NotificationError>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct EgoSmsConfig {
    pub username: String,
    pub password: String,
    pub sender: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl EgoSmsConfig {
    /// `None` when credentials are absent; SMS is then disabled
    pub fn from_env() -> Option<Self> {
        let username = std::env::var("EGOSMS_USERNAME")
            .ok()
            .filter(|v| !v.trim().is_empty())?;
        let password = std::env::var("EGOSMS_PASSWORD")
            .ok()
            .filter(|v| !v.trim().is_empty())?;

        Some(Self {
            username,
            password,
            sender: std::env::var("EGOSMS_SENDER").unwrap_or_else(|_| "Egosms".to_string()),
            base_url: std::env::var("EGOSMS_BASE_URL")
                .unwrap_or_else(|_| "https://www.egosms.co/api/v1/plain/".to_string()),
            timeout_secs: std::env::var("EGOSMS_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(30),
        })
    }
}

pub struct EgoSmsNotifier {
    config: EgoSmsConfig,
    client: reqwest::Client,
}

impl EgoSmsNotifier {
    pub fn new(config: EgoSmsConfig) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| NotificationError::Transport(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn request_url(&self, phone: &str, message: &str) -> Result<reqwest::Url, NotificationError> {
        let number = format!("+{}", phone.trim().trim_start_matches('+'));
        reqwest::Url::parse_with_params(
            &self.config.base_url,
            &[
                ("number", number.as_str()),
                ("message", message),
                ("username", self.config.username.as_str()),
                ("password", self.config.password.as_str()),
                ("sender", self.config.sender.as_str()),
                ("priority", "0"),
            ],
        )
        .map_err(|e| NotificationError::Transport(format!("invalid SMS URL: {}", e)))
    }
}

#[async_trait]
impl VoucherNotifier for EgoSmsNotifier {
    async fn send_sms(&self, phone: &str, message: &str) -> Result<String, NotificationError> {
        let url = self.request_url(phone, message)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| NotificationError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(NotificationError::Rejected(format!("HTTP {}: {}", status, body)));
        }
        if !body.to_uppercase().contains("OK") {
            return Err(NotificationError::Rejected(body));
        }

        Ok(body)
    }

    fn name(&self) -> &'static str {
        "egosms"
    }
}

/// Writes messages to the log instead of sending them
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl VoucherNotifier for LogNotifier {
    async fn send_sms(&self, phone: &str, message: &str) -> Result<String, NotificationError> {
        info!(
            phone = %mask_phone(phone),
            message_len = message.len(),
            "🔔 SMS (log only)"
        );
        Ok("OK".to_string())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

pub fn voucher_message(code: &str, denomination: i64, currency: &str) -> String {
    format!(
        "Payment received. Your {} {} voucher code is {}. Thank you!",
        currency, denomination, code
    )
}

pub struct NotificationService {
    notifier: Arc<dyn VoucherNotifier>,
    currency: String,
}

impl NotificationService {
    pub fn new(notifier: Arc<dyn VoucherNotifier>, currency: impl Into<String>) -> Self {
        Self {
            notifier,
            currency: currency.into(),
        }
    }

    pub fn log_only(currency: impl Into<String>) -> Self {
        Self::new(Arc::new(LogNotifier), currency)
    }

    /// EgoSMS when configured, otherwise log-only
    pub fn from_env(currency: impl Into<String>) -> Self {
        match EgoSmsConfig::from_env().map(EgoSmsNotifier::new) {
            Some(Ok(notifier)) => Self::new(Arc::new(notifier), currency),
            Some(Err(e)) => {
                warn!(error = %e, "SMS client could not be built, falling back to log notifier");
                Self::log_only(currency)
            }
            None => {
                info!("EGOSMS credentials not set, voucher SMS will be logged only");
                Self::log_only(currency)
            }
        }
    }

    pub fn notifier(&self) -> Arc<dyn VoucherNotifier> {
        self.notifier.clone()
    }

    /// Deliver in the background; failures are logged and never surface.
    pub fn notify_voucher_assigned(&self, payment: &PaymentRecord, voucher: &VoucherCode) {
        let notifier = self.notifier.clone();
        let phone = payment.subscriber.clone();
        let reference = payment.reference.clone();
        let message = voucher_message(&voucher.code, voucher.denomination, &self.currency);

        tokio::spawn(async move {
            match notifier.send_sms(&phone, &message).await {
                Ok(_) => info!(
                    reference = %reference,
                    phone = %mask_phone(&phone),
                    channel = notifier.name(),
                    "voucher SMS sent"
                ),
                Err(e) => error!(
                    reference = %reference,
                    phone = %mask_phone(&phone),
                    error = %e,
                    "voucher SMS failed"
                ),
            }
        });
    }
}
