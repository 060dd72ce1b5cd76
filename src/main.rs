use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dotenv::dotenv;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use voucher_backend::api::{self, ApiContext};
use voucher_backend::cache::throttle::{MemoryThrottle, PollThrottle};
use voucher_backend::config::AppConfig;
use voucher_backend::database::{self, memory::MemoryStore, Stores};
use voucher_backend::health::HealthChecker;
use voucher_backend::logging::init_tracing;
use voucher_backend::payments::provider::CollectionProvider;
use voucher_backend::payments::providers::{MarzPayProvider, SandboxProvider};
use voucher_backend::services::notification::NotificationService;
use voucher_backend::services::payment_status::StatusConfig;
use voucher_backend::workers::stale_payment_sweeper::{StalePaymentSweeper, SweeperConfig};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        skip_externals = config.skip_externals,
        denominations = %config.vouchers.denominations,
        "🚀 Starting voucher backend service"
    );

    // Stores
    let stores = match &config.database {
        Some(db_config) => {
            info!("📊 Initializing database connection pool...");
            let pool = database::init_pool_from_config(db_config)
                .await
                .map_err(|e| {
                    error!("Failed to initialize database pool: {}", e);
                    e
                })?;
            database::run_migrations(&pool).await?;
            info!(
                max_connections = pool.options().get_max_connections(),
                "✅ Database connection pool initialized"
            );
            Stores::postgres(pool)
        }
        None => {
            info!("⏭️  Using in-memory stores (SKIP_EXTERNALS=true)");
            Stores::memory(Arc::new(MemoryStore::new()))
        }
    };

    // Payment gateway
    let provider: Arc<dyn CollectionProvider> = if config.skip_externals {
        info!("⏭️  Using sandbox collection provider (SKIP_EXTERNALS=true)");
        Arc::new(SandboxProvider)
    } else {
        let marzpay = MarzPayProvider::from_env().map_err(|e| {
            error!("❌ Failed to load MarzPay configuration: {}", e);
            e
        })?;
        info!("✅ MarzPay provider initialized");
        Arc::new(marzpay)
    };

    // Poll throttle and health
    let throttle_window = Duration::from_secs(config.cache.poll_throttle_secs);
    #[cfg_attr(not(feature = "cache"), allow(unused_mut))]
    let mut health = HealthChecker::new(stores.payments.clone());
    #[cfg_attr(not(feature = "cache"), allow(unused_mut))]
    let mut throttle: Arc<dyn PollThrottle> = Arc::new(MemoryThrottle::new(throttle_window));

    #[cfg(feature = "cache")]
    if !config.skip_externals {
        use voucher_backend::cache::{init_cache_pool, throttle::RedisThrottle, RedisPoolConfig};

        info!("🔄 Initializing Redis cache connection pool...");
        match init_cache_pool(RedisPoolConfig::from(&config.cache)).await {
            Ok(pool) => {
                health = health.with_cache(pool.clone());
                throttle = Arc::new(RedisThrottle::new(pool, throttle_window));
                info!("✅ Redis poll throttle enabled");
            }
            Err(e) => {
                warn!(error = %e, "Redis unavailable, falling back to in-process poll throttle");
            }
        }
    }

    let notifications = Arc::new(NotificationService::from_env(
        config.vouchers.currency.clone(),
    ));

    let ctx = ApiContext::new(
        stores.clone(),
        provider,
        notifications,
        throttle,
        config.vouchers.clone(),
        StatusConfig::from_env(),
        config.admin.clone(),
    )
    .with_health(health);

    // Background sweeper
    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let sweeper_config = SweeperConfig::from_env();
    let sweeper_handle = if sweeper_config.enabled {
        let sweeper = StalePaymentSweeper::new(
            stores.payments.clone(),
            ctx.status.clone(),
            ctx.engine.clone(),
            sweeper_config,
        );
        Some(tokio::spawn(sweeper.run(worker_shutdown_rx)))
    } else {
        info!("Stale payment sweeper disabled (SWEEPER_ENABLED=false)");
        None
    };

    let app = api::router(&ctx);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid SERVER_HOST/SERVER_PORT")?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("❌ Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(address = %addr, "🚀 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await
        .context("server error")?;

    let _ = worker_shutdown_tx.send(true);
    if let Some(handle) = sweeper_handle {
        if let Err(e) = tokio::time::timeout(Duration::from_secs(5), handle).await {
            error!(error = %e, "Timed out waiting for sweeper shutdown");
        }
    }

    info!("👋 Server shutdown complete");

    Ok(())
}
