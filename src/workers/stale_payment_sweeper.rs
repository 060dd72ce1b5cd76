use crate::database::payment_repository::PaymentRecord;
use crate::database::repository::PaymentStore;
use crate::services::payment_status::PaymentStatusService;
use crate::services::reconciliation::{
    ReconciliationEngine, ReconciliationOutcome, ReconciliationRequest,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const EXPIRED_EVENT: &str = "sweeper.expired";

#[derive(Debug, thiserror::Error)]
pub enum SweeperError {
    #[error("database error: {0}")]
    Database(#[from] crate::database::error::DatabaseError),

    #[error("invalid sweeper window: {0}")]
    Window(String),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub enabled: bool,
    /// How often the worker wakes up.
    pub interval: Duration,
    /// Records younger than this are left to webhooks and status queries.
    pub min_age: Duration,
    /// Records older than this with no terminal provider answer are failed.
    pub expire_after: Duration,
    pub batch_size: i64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            min_age: Duration::from_secs(120),
            expire_after: Duration::from_secs(86_400),
            batch_size: 100,
        }
    }
}

impl SweeperConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.enabled = std::env::var("SWEEPER_ENABLED")
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(cfg.enabled);
        cfg.interval = Duration::from_secs(
            std::env::var("SWEEPER_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.interval.as_secs())
                .max(1),
        );
        cfg.min_age = Duration::from_secs(
            std::env::var("SWEEPER_MIN_AGE_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.min_age.as_secs()),
        );
        cfg.expire_after = Duration::from_secs(
            std::env::var("SWEEPER_EXPIRE_AFTER_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.expire_after.as_secs()),
        );
        cfg.batch_size = std::env::var("SWEEPER_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(cfg.batch_size);
        cfg
    }
}

/// Per-cycle tally, mostly for logging and tests
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepSummary {
    pub examined: usize,
    pub settled: usize,
    pub expired: usize,
    pub unreachable: usize,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct StalePaymentSweeper {
    payments: Arc<dyn PaymentStore>,
    status: Arc<PaymentStatusService>,
    engine: Arc<ReconciliationEngine>,
    config: SweeperConfig,
}

impl StalePaymentSweeper {
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        status: Arc<PaymentStatusService>,
        engine: Arc<ReconciliationEngine>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            payments,
            status,
            engine,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            min_age_secs = self.config.min_age.as_secs(),
            expire_after_secs = self.config.expire_after.as_secs(),
            batch_size = self.config.batch_size,
            "stale payment sweeper started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("stale payment sweeper stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    match self.sweep_once().await {
                        Ok(summary) if summary.examined > 0 => info!(
                            examined = summary.examined,
                            settled = summary.settled,
                            expired = summary.expired,
                            unreachable = summary.unreachable,
                            "sweep cycle finished"
                        ),
                        Ok(_) => debug!("sweep cycle found nothing to do"),
                        Err(e) => warn!(error = %e, "sweep cycle failed"),
                    }
                }
            }
        }

        info!("stale payment sweeper stopped");
    }

    pub async fn sweep_once(&self) -> Result<SweepSummary, SweeperError> {
        let min_age = chrono::Duration::from_std(self.config.min_age)
            .map_err(|e| SweeperError::Window(e.to_string()))?;
        let expire_after = chrono::Duration::from_std(self.config.expire_after)
            .map_err(|e| SweeperError::Window(e.to_string()))?;

        let now = Utc::now();
        let stale = self
            .payments
            .list_processing(now - min_age, self.config.batch_size)
            .await?;

        let mut summary = SweepSummary {
            examined: stale.len(),
            ..SweepSummary::default()
        };

        for record in stale {
            let expired = now - record.created_at >= expire_after;

            if record.provider_transaction_id.is_some() {
                match self.status.poll_provider(&record).await {
                    Ok(outcome) if settled(&outcome) => {
                        summary.settled += 1;
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Never expire what we could not ask about
                        warn!(
                            reference = %record.reference,
                            error = %e,
                            "provider unreachable during sweep"
                        );
                        summary.unreachable += 1;
                        continue;
                    }
                }
            }

            if expired && self.expire(&record).await {
                summary.expired += 1;
            }
        }

        Ok(summary)
    }

    async fn expire(&self, record: &PaymentRecord) -> bool {
        let outcome = self
            .engine
            .handle_callback(ReconciliationRequest::internal_failure(
                &record.reference,
                EXPIRED_EVENT,
            ))
            .await;

        match outcome {
            ReconciliationOutcome::Failed { .. } => {
                info!(
                    reference = %record.reference,
                    age_secs = (Utc::now() - record.created_at).num_seconds(),
                    "abandoned payment expired"
                );
                true
            }
            other => {
                debug!(
                    reference = %record.reference,
                    outcome = other.label(),
                    "expiry had no effect"
                );
                false
            }
        }
    }
}

fn settled(outcome: &ReconciliationOutcome) -> bool {
    outcome
        .payment()
        .is_some_and(|payment| payment.status.is_terminal())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_retention_window() {
        let cfg = SweeperConfig::default();
        assert!(cfg.enabled);
        assert_eq!(cfg.expire_after, Duration::from_secs(24 * 60 * 60));
        assert!(cfg.min_age < cfg.expire_after);
    }
}
