use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tracing::{error, info};

use crate::api::ApiContext;
use crate::health::{HealthChecker, HealthStatus};

pub fn routes(ctx: &ApiContext) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(readiness))
        .route("/health/live", get(liveness))
        .with_state(ctx.health.clone())
}

/// Always 200 with the component breakdown
pub async fn health(State(checker): State<HealthChecker>) -> Json<HealthStatus> {
    info!("🏥 Health check requested");
    Json(checker.check_health().await)
}

/// Readiness probe - 503 while any dependency is down
pub async fn readiness(
    State(checker): State<HealthChecker>,
) -> Result<Json<HealthStatus>, (StatusCode, Json<HealthStatus>)> {
    let health_status = checker.check_health().await;

    if health_status.is_healthy() {
        Ok(Json(health_status))
    } else {
        error!("❌ Readiness check failed - service unhealthy");
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(health_status)))
    }
}

/// Liveness probe - the process is up
pub async fn liveness() -> &'static str {
    "OK"
}
