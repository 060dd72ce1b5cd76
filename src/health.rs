//! Health check module
//! Provides health status for the application and its dependencies

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info};

use crate::database::repository::PaymentStore;

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ComponentState {
    Up,
    Down,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }

    fn record(&mut self, component: &str, result: Result<u128, String>) {
        let health = match result {
            Ok(response_time) => {
                info!("{} health check: OK ({}ms)", component, response_time);
                ComponentHealth::up(Some(response_time))
            }
            Err(e) => {
                error!("{} health check failed: {}", component, e);
                self.status = HealthState::Unhealthy;
                ComponentHealth::down(Some(e))
            }
        };
        self.checks.insert(component.to_string(), health);
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }
}

/// Health checker for the application
#[derive(Clone)]
pub struct HealthChecker {
    store: Arc<dyn PaymentStore>,
    #[cfg(feature = "cache")]
    cache: Option<crate::cache::RedisPool>,
    check_timeout: Duration,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn PaymentStore>) -> Self {
        Self {
            store,
            #[cfg(feature = "cache")]
            cache: None,
            check_timeout: Duration::from_secs(5),
        }
    }

    #[cfg(feature = "cache")]
    pub fn with_cache(mut self, pool: crate::cache::RedisPool) -> Self {
        self.cache = Some(pool);
        self
    }

    /// Perform comprehensive health check
    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();

        let store = match timeout(self.check_timeout, check_store_health(self.store.as_ref())).await
        {
            Ok(result) => result,
            Err(_) => Err("Timeout".to_string()),
        };
        health_status.record("database", store);

        #[cfg(feature = "cache")]
        if let Some(pool) = &self.cache {
            let cache = match timeout(self.check_timeout, check_cache_health(pool)).await {
                Ok(result) => result,
                Err(_) => Err("Timeout".to_string()),
            };
            health_status.record("cache", cache);
        }

        health_status
    }
}

pub async fn check_store_health(store: &dyn PaymentStore) -> Result<u128, String> {
    let start = Instant::now();
    store
        .ping()
        .await
        .map(|_| start.elapsed().as_millis())
        .map_err(|e| e.to_string())
}

#[cfg(feature = "cache")]
pub async fn check_cache_health(pool: &crate::cache::RedisPool) -> Result<u128, String> {
    let start = Instant::now();
    crate::cache::health_check(pool)
        .await
        .map(|_| start.elapsed().as_millis())
        .map_err(|e| e.to_string())
}
