use crate::payments::error::PaymentError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderName {
    Marzpay,
    /// Logs collections instead of calling a gateway
    Sandbox,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Marzpay => "marzpay",
            ProviderName::Sandbox => "sandbox",
        }
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "marzpay" | "marz" => Ok(ProviderName::Marzpay),
            "sandbox" => Ok(ProviderName::Sandbox),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported provider: {}", value),
                field: Some("provider".to_string()),
            }),
        }
    }
}

/// Whole-unit amount in a currency without minor units (UGX)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Money {
    pub amount: i64,
    pub currency: String,
}

impl Money {
    pub fn validate_positive(&self, field: &str) -> Result<(), PaymentError> {
        if self.amount <= 0 {
            return Err(PaymentError::ValidationError {
                message: "amount must be greater than zero".to_string(),
                field: Some(field.to_string()),
            });
        }
        if self.currency.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "currency is required".to_string(),
                field: Some("currency".to_string()),
            });
        }
        Ok(())
    }
}

/// A mobile-money collection to start on the subscriber's handset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionRequest {
    pub reference: String,
    /// Normalized `256XXXXXXXXX`
    pub phone_number: String,
    pub amount: Money,
    pub description: String,
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionResponse {
    pub provider_transaction_id: String,
    pub reference: String,
    /// Raw gateway status, not yet mapped
    pub status: String,
    /// Mobile network that will prompt the subscriber (`mtn`, `airtel`)
    pub network: Option<String>,
    pub provider_data: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStatus {
    pub provider_transaction_id: String,
    pub reference: Option<String>,
    pub status: String,
    pub network: Option<String>,
    pub amount: Option<i64>,
    pub provider_data: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookVerificationResult {
    pub valid: bool,
    pub reason: Option<String>,
}

/// Amount as delivered by the gateway: a JSON number or a numeric string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawAmount {
    Number(serde_json::Number),
    Text(String),
}

impl RawAmount {
    /// Whole-unit value; fractional or non-numeric input yields `None`
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RawAmount::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            RawAmount::Text(s) => {
                let trimmed = s.trim();
                trimmed.parse::<i64>().ok().or_else(|| {
                    trimmed
                        .parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite() && f.fract() == 0.0)
                        .map(|f| f as i64)
                })
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookAmount {
    pub formatted: Option<String>,
    pub raw: Option<RawAmount>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookTransaction {
    pub uuid: Option<String>,
    pub reference: Option<String>,
    pub status: Option<String>,
    pub amount: Option<WebhookAmount>,
    pub provider: Option<String>,
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookCollection {
    pub provider: Option<String>,
    pub phone_number: Option<String>,
    #[serde(default, deserialize_with = "lenient_value")]
    pub amount: Option<JsonValue>,
    pub mode: Option<String>,
    pub provider_reference: Option<String>,
}

/// Collection callback body. Every field is optional so a partial body
/// still reaches the handler and gets acknowledged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event_type: Option<String>,
    pub transaction: Option<WebhookTransaction>,
    pub collection: Option<WebhookCollection>,
    pub business: Option<JsonValue>,
    pub metadata: Option<JsonValue>,
}

fn lenient_value<'de, D>(deserializer: D) -> Result<Option<JsonValue>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(if value.is_null() { None } else { Some(value) })
}

fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

impl WebhookPayload {
    pub fn event_type(&self) -> &str {
        non_blank(self.event_type.as_ref()).unwrap_or("unknown")
    }

    pub fn reference(&self) -> Option<&str> {
        non_blank(self.transaction.as_ref()?.reference.as_ref())
    }

    pub fn transaction_uuid(&self) -> Option<&str> {
        non_blank(self.transaction.as_ref()?.uuid.as_ref())
    }

    pub fn status(&self) -> Option<&str> {
        non_blank(self.transaction.as_ref()?.status.as_ref())
    }

    /// `collection.provider`, falling back to `transaction.provider`
    pub fn network(&self) -> Option<&str> {
        self.collection
            .as_ref()
            .and_then(|c| non_blank(c.provider.as_ref()))
            .or_else(|| {
                self.transaction
                    .as_ref()
                    .and_then(|t| non_blank(t.provider.as_ref()))
            })
    }

    pub fn phone_number(&self) -> Option<&str> {
        self.transaction
            .as_ref()
            .and_then(|t| non_blank(t.phone_number.as_ref()))
            .or_else(|| {
                self.collection
                    .as_ref()
                    .and_then(|c| non_blank(c.phone_number.as_ref()))
            })
    }

    pub fn amount(&self) -> Option<i64> {
        self.transaction
            .as_ref()?
            .amount
            .as_ref()?
            .raw
            .as_ref()?
            .as_i64()
    }
}
