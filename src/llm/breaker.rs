//! Per-provider circuit breaker.
//!
//! Durable state is derived on demand from the usage log — failures in
//! the trailing sample window and the timestamp of the most recent one —
//! so the breaker survives process restarts with no shared memory.
//! Only the HALF-OPEN success run is in-memory, scoped to this instance.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::config::BreakerConfig;
use crate::store::AgentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    provider: String,
    cfg: BreakerConfig,
    store: Arc<dyn AgentStore>,
    half_open_successes: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, cfg: BreakerConfig, store: Arc<dyn AgentStore>) -> Self {
        Self {
            provider: provider.into(),
            cfg,
            store,
            half_open_successes: AtomicU32::new(0),
        }
    }

    pub async fn state(&self) -> CircuitState {
        let window = self
            .store
            .failure_window(&self.provider, self.cfg.sample_window_secs)
            .await
            .unwrap_or_default();

        if window.failures < self.cfg.failure_threshold {
            return CircuitState::Closed;
        }

        // Enough consecutive probes succeeded in this instance's
        // HALF-OPEN phase: treat as closed again.
        if self.half_open_successes.load(Ordering::Relaxed) >= self.cfg.success_threshold {
            return CircuitState::Closed;
        }

        match window.last_failure_at {
            Some(last) if Utc::now() - last >= Duration::seconds(self.cfg.recovery_timeout_secs) => {
                CircuitState::HalfOpen
            }
            Some(_) => CircuitState::Open,
            None => CircuitState::Closed,
        }
    }

    /// False iff the circuit is OPEN. HALF-OPEN dispatches probes.
    pub async fn is_available(&self) -> bool {
        self.state().await != CircuitState::Open
    }

    /// Mutates only the in-memory HALF-OPEN counter; durable state comes
    /// from the usage log the tracker writes.
    pub fn record_success(&self) {
        self.half_open_successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Any failure in HALF-OPEN reopens; reset the probe run.
    pub fn record_failure(&self) {
        self.half_open_successes.store(0, Ordering::Relaxed);
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::UsageRow;
    use rust_decimal::Decimal;

    fn failure_row(provider: &str, age_secs: i64) -> UsageRow {
        UsageRow {
            user_id: "u1".into(),
            session_id: None,
            provider: provider.into(),
            model: "m".into(),
            task_type: "identify_text".into(),
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: Decimal::ZERO,
            latency_ms: 100,
            success: false,
            error_type: Some("server_error".into()),
            error_message: Some("boom".into()),
            created_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    fn cfg() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            recovery_timeout_secs: 60,
            success_threshold: 2,
            sample_window_secs: 300,
        }
    }

    async fn seed_failures(store: &MemoryStore, n: usize, age_secs: i64) {
        for _ in 0..n {
            store
                .insert_usage(&failure_row("gemini", age_secs))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_closed_below_threshold() {
        let store = Arc::new(MemoryStore::new());
        seed_failures(&store, 2, 5).await;
        let b = CircuitBreaker::new("gemini", cfg(), store);
        assert_eq!(b.state().await, CircuitState::Closed);
        assert!(b.is_available().await);
    }

    #[tokio::test]
    async fn test_opens_at_threshold_with_recent_failure() {
        let store = Arc::new(MemoryStore::new());
        seed_failures(&store, 3, 5).await;
        let b = CircuitBreaker::new("gemini", cfg(), store);
        assert_eq!(b.state().await, CircuitState::Open);
        assert!(!b.is_available().await);
    }

    #[tokio::test]
    async fn test_half_open_after_recovery_timeout() {
        let store = Arc::new(MemoryStore::new());
        // Failures over threshold but last one 120s ago (> 60s recovery)
        seed_failures(&store, 3, 120).await;
        let b = CircuitBreaker::new("gemini", cfg(), store);
        assert_eq!(b.state().await, CircuitState::HalfOpen);
        assert!(b.is_available().await);
    }

    #[tokio::test]
    async fn test_half_open_closes_after_success_run() {
        let store = Arc::new(MemoryStore::new());
        seed_failures(&store, 3, 120).await;
        let b = CircuitBreaker::new("gemini", cfg(), store);
        assert_eq!(b.state().await, CircuitState::HalfOpen);

        b.record_success();
        assert_eq!(b.state().await, CircuitState::HalfOpen);
        b.record_success();
        assert_eq!(b.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_resets_probe_run() {
        let store = Arc::new(MemoryStore::new());
        seed_failures(&store, 3, 120).await;
        let b = CircuitBreaker::new("gemini", cfg(), store);

        b.record_success();
        b.record_failure();
        b.record_success();
        // One success since the failure — still probing
        assert_eq!(b.state().await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_old_failures_outside_window_ignored() {
        let store = Arc::new(MemoryStore::new());
        seed_failures(&store, 5, 600).await; // outside 300s window
        let b = CircuitBreaker::new("gemini", cfg(), store);
        assert_eq!(b.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_other_provider_failures_do_not_count() {
        let store = Arc::new(MemoryStore::new());
        seed_failures(&store, 5, 5).await; // all gemini
        let b = CircuitBreaker::new("claude", cfg(), store);
        assert_eq!(b.state().await, CircuitState::Closed);
    }
}
