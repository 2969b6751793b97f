//! Broker connection setup with startup retries.

use core_config::redis::RedisConfig;
use redis::Client;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Backoff schedule for the initial broker connection.
#[derive(Debug, Clone)]
pub struct ConnectRetry {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor between attempts (typically 2.0)
    pub multiplier: f64,
    /// Scale each delay by a random 50-100%
    pub jitter: bool,
}

impl ConnectRetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `retry` (1-based), before jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1).min(32) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

impl Default for ConnectRetry {
    /// 5 retries, 200ms initial delay doubling up to 5s, with jitter.
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Open a connection manager and verify it with PING.
pub async fn connect(config: &RedisConfig) -> redis::RedisResult<ConnectionManager> {
    let url = config.connection_url();
    info!("Attempting to connect to Redis at {}", url);

    let client = Client::open(url)?;
    let manager = ConnectionManager::new(client).await?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    info!("Successfully connected to Redis");
    Ok(manager)
}

/// [`connect`], retried with exponential backoff.
pub async fn connect_with_retry(
    config: &RedisConfig,
    retry: &ConnectRetry,
) -> redis::RedisResult<ConnectionManager> {
    let mut attempt = 0;

    loop {
        match connect(config).await {
            Ok(manager) => {
                if attempt > 0 {
                    debug!("Connected after {} retries", attempt);
                }
                return Ok(manager);
            }
            Err(e) => {
                attempt += 1;
                if attempt > retry.max_retries {
                    warn!("Redis connection failed after {} attempts: {}", attempt, e);
                    return Err(e);
                }

                let mut delay = retry.delay_for(attempt);
                if retry.jitter {
                    delay = apply_jitter(delay);
                }

                warn!(
                    "Redis connection failed (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt,
                    retry.max_retries,
                    e,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Random 50-100% of `delay`.
fn apply_jitter(delay: Duration) -> Duration {
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;

    let random_factor =
        (RandomState::new().hash_one(std::time::SystemTime::now()) % 50) as f64 / 100.0 + 0.5;

    delay.mul_f64(random_factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let retry = ConnectRetry::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000));

        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(4), Duration::from_millis(800));
        assert_eq!(retry.delay_for(5), Duration::from_millis(1000));
        assert_eq!(retry.delay_for(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_apply_jitter() {
        let delay = Duration::from_millis(1000);
        for _ in 0..10 {
            let jittered = apply_jitter(delay);
            assert!(jittered >= Duration::from_millis(500));
            assert!(jittered <= delay);
        }
    }

    #[tokio::test]
    async fn test_unreachable_broker_gives_up() {
        let config = RedisConfig::new("redis://127.0.0.1:1");
        let retry = ConnectRetry::new()
            .with_max_retries(1)
            .with_initial_delay(Duration::from_millis(10))
            .without_jitter();

        assert!(connect_with_retry(&config, &retry).await.is_err());
    }
}
