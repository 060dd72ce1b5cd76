//! Normalizes mobile-network status vocabularies into the three states the
//! reconciliation engine acts on.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MobileNetwork {
    Mtn,
    Airtel,
    Other(String),
}

impl MobileNetwork {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "mtn" => MobileNetwork::Mtn,
            "airtel" => MobileNetwork::Airtel,
            _ => MobileNetwork::Other(value.to_string()),
        }
    }
}

/// Result of mapping a provider status.
///
/// `Passthrough` carries the input unchanged and is indeterminate, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappedStatus {
    Completed,
    Failed,
    Pending,
    Passthrough(String),
}

impl MappedStatus {
    pub fn as_str(&self) -> &str {
        match self {
            MappedStatus::Completed => "completed",
            MappedStatus::Failed => "failed",
            MappedStatus::Pending => "pending",
            MappedStatus::Passthrough(raw) => raw,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MappedStatus::Completed | MappedStatus::Failed)
    }
}

impl fmt::Display for MappedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn map_status(provider_status: &str, network: &MobileNetwork) -> MappedStatus {
    let normalized = provider_status.trim().to_lowercase();

    let mapped = match network {
        MobileNetwork::Mtn => match normalized.as_str() {
            "successful" | "completed" | "success" => Some(MappedStatus::Completed),
            "failed" | "rejected" | "failure" | "expired" => Some(MappedStatus::Failed),
            "pending" | "timeout" | "pending_confirmation" => Some(MappedStatus::Pending),
            _ => None,
        },
        MobileNetwork::Airtel => match normalized.as_str() {
            "ts" => Some(MappedStatus::Completed),
            "tf" => Some(MappedStatus::Failed),
            "tp" => Some(MappedStatus::Pending),
            _ => None,
        },
        MobileNetwork::Other(_) => None,
    };

    mapped.unwrap_or_else(|| MappedStatus::Passthrough(provider_status.to_string()))
}

/// Map a status whose network may be absent.
///
/// Gateway-level statuses (no network attached) share the MTN vocabulary;
/// a named but unknown network passes through.
pub fn map_provider_status(provider_status: &str, network: Option<&str>) -> MappedStatus {
    let network = network
        .filter(|n| !n.trim().is_empty())
        .map(MobileNetwork::parse)
        .unwrap_or(MobileNetwork::Mtn);
    map_status(provider_status, &network)
}
