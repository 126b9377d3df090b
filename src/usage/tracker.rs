//! Usage logging, daily aggregates, and spend/request ceilings.
//!
//! Every outbound LLM call — successful or failed — lands in the usage
//! log. The daily aggregate is upserted after each log entry;
//! aggregate-side failures are logged and swallowed so analytics can
//! never fail a tasting.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::Caller;
use crate::config::Limits;
use crate::errors::AgentError;
use crate::providers::ProviderResponse;
use crate::store::{AgentStore, CostSummary, DailyUsage, IdentificationRow, UsageRow};

#[derive(Clone)]
pub struct CostTracker {
    store: Arc<dyn AgentStore>,
}

impl CostTracker {
    pub fn new(store: Arc<dyn AgentStore>) -> Self {
        Self { store }
    }

    /// Record one terminal provider response under the caller's identity.
    pub async fn log(&self, caller: &Caller, task_type: &str, resp: &ProviderResponse) {
        let row = UsageRow {
            user_id: caller.user_id.clone(),
            session_id: caller.session_id.clone(),
            provider: resp.provider.clone(),
            model: resp.model.clone(),
            task_type: task_type.to_string(),
            input_tokens: resp.input_tokens as i32,
            output_tokens: resp.output_tokens as i32,
            cost_usd: resp.cost_usd,
            latency_ms: resp.latency_ms as i64,
            success: resp.success,
            error_type: resp.error_kind.map(|k| k.as_str().to_string()),
            error_message: resp.error.clone(),
            created_at: Utc::now(),
        };

        if let Err(e) = self.store.insert_usage(&row).await {
            tracing::error!(provider = %row.provider, "failed to write usage log: {e}");
            return;
        }
        if let Err(e) = self.store.upsert_daily(&row).await {
            tracing::error!(provider = %row.provider, "failed to update daily aggregate: {e}");
        }
    }

    /// Human-readable limit violations; empty means within limits.
    pub async fn check_limits(&self, caller: &Caller, limits: &Limits) -> Vec<String> {
        let today = Utc::now().date_naive();
        let rows = match self.store.daily_usage(&caller.user_id, today).await {
            Ok(rows) => rows,
            Err(e) => {
                // Fail open: a broken aggregate must not lock users out.
                tracing::error!("limit check could not read daily usage: {e}");
                return Vec::new();
            }
        };

        let requests: i64 = rows.iter().map(|r| r.request_count).sum();
        let cost: Decimal = rows.iter().map(|r| r.total_cost_usd).sum();
        let cost_f64 = cost.to_f64().unwrap_or(0.0);

        let mut violations = Vec::new();
        if limits.daily_requests > 0 && requests >= limits.daily_requests {
            violations.push(format!(
                "daily request limit of {} reached (used: {})",
                limits.daily_requests, requests
            ));
        }
        if limits.daily_cost_usd > 0.0 && cost_f64 >= limits.daily_cost_usd {
            violations.push(format!(
                "daily spend limit of ${:.2} reached (spent: ${:.4})",
                limits.daily_cost_usd, cost_f64
            ));
        }
        violations
    }

    pub async fn daily_usage(&self, user_id: &str) -> Result<Vec<DailyUsage>, AgentError> {
        self.store
            .daily_usage(user_id, Utc::now().date_naive())
            .await
    }

    pub async fn detailed_stats(
        &self,
        user_id: &str,
        days: i64,
    ) -> Result<Vec<DailyUsage>, AgentError> {
        self.store.detailed_stats(user_id, days).await
    }

    pub async fn cost_summary(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<CostSummary, AgentError> {
        self.store.cost_summary(user_id, start, end).await
    }

    /// Final per-identification analytics row, best-effort.
    pub async fn log_identification(&self, row: IdentificationRow) {
        if let Err(e) = self.store.insert_identification(&row).await {
            tracing::error!("failed to write identification analytics: {e}");
        }
    }
}
