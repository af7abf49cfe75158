//! Bounded retry with exponential backoff and jitter.

use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): half of the capped exponential step
    /// plus a random share of the other half.
    pub fn delay(&self, retry: u32) -> Duration {
        let pow = retry.min(16);
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let capped = base_ms.saturating_mul(1u64 << pow).min(max_ms);
        let half = capped / 2;
        let spread = capped - half;
        let jitter = if spread == 0 {
            0
        } else {
            (Uuid::new_v4().as_u128() % (spread as u128 + 1)) as u64
        };
        Duration::from_millis(half + jitter)
    }

    pub async fn sleep(&self, retry: u32) {
        tokio::time::sleep(self.delay(retry)).await;
    }
}
