//! Redis-backed helpers and the provider poll throttle
//!
//! Redis is optional: without the `cache` feature (or with `SKIP_EXTERNALS`)
//! the in-memory throttle is used and nothing here touches the network.

pub mod error;
pub mod keys;
pub mod throttle;

#[cfg(feature = "cache")]
pub use redis_pool::*;

#[cfg(feature = "cache")]
mod redis_pool {
    use super::error::CacheError;
    use bb8::Pool;
    use bb8_redis::RedisConnectionManager;
    use redis::Client;
    use std::time::Duration;
    use tracing::{error, info, warn};

    /// Redis connection pool type alias
    pub type RedisPool = Pool<RedisConnectionManager>;

    /// Redis pool settings
    #[derive(Debug, Clone)]
    pub struct RedisPoolConfig {
        pub redis_url: String,
        pub max_connections: u32,
        pub min_idle: u32,
        pub connection_timeout: Duration,
        pub max_lifetime: Duration,
        pub idle_timeout: Duration,
    }

    impl Default for RedisPoolConfig {
        fn default() -> Self {
            Self {
                redis_url: "redis://127.0.0.1:6379".to_string(),
                max_connections: 10,
                min_idle: 1,
                connection_timeout: Duration::from_secs(5),
                max_lifetime: Duration::from_secs(300),
                idle_timeout: Duration::from_secs(60),
            }
        }
    }

    impl From<&crate::config::CacheConfig> for RedisPoolConfig {
        fn from(config: &crate::config::CacheConfig) -> Self {
            Self {
                redis_url: config.redis_url.clone(),
                max_connections: config.max_connections,
                ..Self::default()
            }
        }
    }

    /// Initialize Redis connection pool with fault tolerance
    pub async fn init_cache_pool(config: RedisPoolConfig) -> Result<RedisPool, CacheError> {
        info!(
            "Initializing Redis cache pool: max_connections={}",
            config.max_connections
        );

        let client = Client::open(config.redis_url.clone()).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            CacheError::ConnectionError(e.to_string())
        })?;

        let manager = RedisConnectionManager::new(client.get_connection_info().clone()).map_err(|e| {
            error!("Failed to create Redis connection manager: {}", e);
            CacheError::ConnectionError(e.to_string())
        })?;

        let pool = Pool::builder()
            .max_size(config.max_connections)
            .min_idle(config.min_idle)
            .connection_timeout(config.connection_timeout)
            .max_lifetime(config.max_lifetime)
            .idle_timeout(config.idle_timeout)
            .test_on_check_out(false)
            .build(manager)
            .await
            .map_err(|e| {
                error!("Failed to build Redis connection pool: {}", e);
                CacheError::ConnectionError(e.to_string())
            })?;

        if let Err(e) = health_check(&pool).await {
            // The throttle degrades to "allow" while Redis is down
            warn!("Initial Redis connection test failed, but continuing: {}", e);
        }

        info!("Redis cache pool initialized successfully");
        Ok(pool)
    }

    /// Health check for Redis connection pool
    pub async fn health_check(pool: &RedisPool) -> Result<(), CacheError> {
        let mut conn = pool.get().await?;

        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }
}
