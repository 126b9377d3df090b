//! Exponential backoff with jitter for retryable provider failures.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

#[derive(Clone)]
pub struct RetryPolicy {
    cfg: RetryConfig,
}

impl RetryPolicy {
    pub fn new(cfg: RetryConfig) -> Self {
        Self { cfg }
    }

    pub fn max_attempts(&self) -> u32 {
        self.cfg.max_attempts.max(1)
    }

    /// delay_i = min(base × 2^(i-1), max) × (1 + rand(0..jitter)),
    /// with `attempt` 1-based.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.cfg.base_delay_ms as f64;
        let max = self.cfg.max_delay_ms as f64;

        let raw = base * 2_f64.powi(attempt.saturating_sub(1) as i32);
        let capped = raw.min(max);

        let jitter = if self.cfg.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..self.cfg.jitter)
        } else {
            0.0
        };

        Duration::from_millis((capped * (1.0 + jitter)) as u64)
    }

    pub async fn wait(&self, attempt: u32) {
        tokio::time::sleep(self.delay_for(attempt)).await;
    }
}
