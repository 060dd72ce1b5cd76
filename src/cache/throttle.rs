//! At most one provider status check per reference per window.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::keys::payment::PollThrottleKey;

#[async_trait]
pub trait PollThrottle: Send + Sync {
    /// `true` when the caller may contact the provider now
    async fn try_acquire(&self, reference: &str) -> bool;
}

const PRUNE_THRESHOLD: usize = 10_000;

pub struct MemoryThrottle {
    window: Duration,
    last_poll: Mutex<HashMap<String, Instant>>,
}

impl MemoryThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_poll: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl PollThrottle for MemoryThrottle {
    async fn try_acquire(&self, reference: &str) -> bool {
        let now = Instant::now();
        let mut last_poll = self.last_poll.lock().await;

        if last_poll.len() > PRUNE_THRESHOLD {
            let window = self.window;
            last_poll.retain(|_, at| now.duration_since(*at) < window);
        }

        let key = PollThrottleKey::new(reference).to_string();
        match last_poll.get(&key) {
            Some(at) if now.duration_since(*at) < self.window => false,
            _ => {
                last_poll.insert(key, now);
                true
            }
        }
    }
}

#[cfg(feature = "cache")]
pub use redis_throttle::RedisThrottle;

#[cfg(feature = "cache")]
mod redis_throttle {
    use super::*;
    use crate::cache::RedisPool;
    use tracing::warn;

    /// `SET key 1 NX EX window` shared by every instance
    pub struct RedisThrottle {
        pool: RedisPool,
        window_secs: u64,
    }

    impl RedisThrottle {
        pub fn new(pool: RedisPool, window: Duration) -> Self {
            Self {
                pool,
                window_secs: window.as_secs().max(1),
            }
        }

        async fn set_nx(&self, key: &str) -> Result<bool, crate::cache::error::CacheError> {
            let mut conn = self.pool.get().await?;
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(1)
                .arg("NX")
                .arg("EX")
                .arg(self.window_secs)
                .query_async(&mut *conn)
                .await?;
            Ok(reply.is_some())
        }
    }

    #[async_trait]
    impl PollThrottle for RedisThrottle {
        async fn try_acquire(&self, reference: &str) -> bool {
            let key = PollThrottleKey::new(reference).to_string();
            match self.set_nx(&key).await {
                Ok(acquired) => acquired,
                Err(e) => {
                    warn!(reference = %reference, error = %e, "poll throttle unavailable, allowing check");
                    true
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_poll_inside_window_is_refused() {
        let throttle = MemoryThrottle::new(Duration::from_secs(60));
        assert!(throttle.try_acquire("R1").await);
        assert!(!throttle.try_acquire("R1").await);
        assert!(throttle.try_acquire("R2").await);
    }

    #[tokio::test]
    async fn zero_window_never_throttles() {
        let throttle = MemoryThrottle::new(Duration::ZERO);
        assert!(throttle.try_acquire("R1").await);
        assert!(throttle.try_acquire("R1").await);
    }
}
