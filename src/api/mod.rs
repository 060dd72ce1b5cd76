//! HTTP surface: axum handlers and router assembly

pub mod health;
pub mod payments;
pub mod vouchers;
pub mod webhooks;

use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::info;

use crate::cache::throttle::PollThrottle;
use crate::config::{AdminConfig, VoucherConfig};
use crate::database::Stores;
use crate::health::HealthChecker;
use crate::middleware::logging::{request_logging_middleware, UuidRequestId};
use crate::payments::provider::CollectionProvider;
use crate::services::notification::NotificationService;
use crate::services::payment_initiation::PaymentInitiationService;
use crate::services::payment_status::{PaymentStatusService, StatusConfig};
use crate::services::reconciliation::ReconciliationEngine;

/// Every service the handlers reach, wired once at start-up
#[derive(Clone)]
pub struct ApiContext {
    pub stores: Stores,
    pub provider: Arc<dyn CollectionProvider>,
    pub engine: Arc<ReconciliationEngine>,
    pub initiation: Arc<PaymentInitiationService>,
    pub status: Arc<PaymentStatusService>,
    pub notifications: Arc<NotificationService>,
    pub health: HealthChecker,
    pub vouchers: VoucherConfig,
    pub admin: AdminConfig,
}

impl ApiContext {
    pub fn new(
        stores: Stores,
        provider: Arc<dyn CollectionProvider>,
        notifications: Arc<NotificationService>,
        throttle: Arc<dyn PollThrottle>,
        vouchers: VoucherConfig,
        status: StatusConfig,
        admin: AdminConfig,
    ) -> Self {
        let engine = Arc::new(ReconciliationEngine::new(
            stores.payments.clone(),
            stores.vouchers.clone(),
            stores.ledger.clone(),
            notifications.clone(),
            vouchers.clone(),
        ));
        let initiation = Arc::new(PaymentInitiationService::new(
            stores.payments.clone(),
            provider.clone(),
            vouchers.denominations.clone(),
            vouchers.currency.clone(),
        ));
        let status = Arc::new(PaymentStatusService::new(
            stores.payments.clone(),
            provider.clone(),
            engine.clone(),
            throttle,
            status,
        ));
        let health = HealthChecker::new(stores.payments.clone());

        Self {
            stores,
            provider,
            engine,
            initiation,
            status,
            notifications,
            health,
            vouchers,
            admin,
        }
    }

    pub fn with_health(mut self, health: HealthChecker) -> Self {
        self.health = health;
        self
    }
}

/// Public routes, plus the admin and test routes when enabled.
pub fn router(ctx: &ApiContext) -> Router {
    let mut app = Router::new()
        .merge(health::routes(ctx))
        .merge(payments::routes(ctx))
        .merge(webhooks::routes(ctx));

    if ctx.admin.enable_test_endpoints {
        info!("test simulation endpoints enabled");
        app = app.merge(payments::test_routes(ctx));
    }

    match ctx.admin.api_token.as_deref() {
        Some(token) => {
            info!("voucher admin routes enabled");
            app = app.merge(vouchers::routes(ctx, token));
        }
        None => info!("ADMIN_API_TOKEN not set, voucher admin routes disabled"),
    }

    app.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
            .layer(axum::middleware::from_fn(request_logging_middleware))
            .layer(PropagateRequestIdLayer::x_request_id()),
    )
}
