//! Exponential backoff shared by queue admission, font fetches and migration uploads.

use crate::config::Config;
use crate::error::OptimizeError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base: Duration, cap: Duration) -> Self {
        Self { attempts: attempts.max(1), base, cap }
    }

    /// Policy for single asset fetches
    pub fn for_fetches(config: &Config) -> Self {
        Self::new(
            config.fetch_retries,
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_cap_ms),
        )
    }

    /// Policy for whole-job admission
    pub fn for_jobs(config: &Config) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_cap_ms),
        )
    }

    /// No waiting between attempts
    pub fn immediate(attempts: u32) -> Self {
        Self::new(attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (1-based): base · 2^(attempt-1), capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Run `op` until it succeeds, fails permanently or runs out of attempts
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, OptimizeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OptimizeError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    let delay = self.delay_for(attempt);
                    warn!("🔁 {} failed (attempt {}/{}): {}, retrying in {:?}", label, attempt, self.attempts, e, delay);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(30))
    }
}
