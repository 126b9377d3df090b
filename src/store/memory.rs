//! In-memory [`AgentStore`] used by tests and keyless local runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;

use super::{
    AgentStore, CostSummary, DailyUsage, EnrichmentRow, FailureWindow, IdentificationRow,
    ProviderCost, UsageRow,
};
use crate::errors::AgentError;

#[derive(Default)]
pub struct MemoryStore {
    usage: Mutex<Vec<UsageRow>>,
    daily: Mutex<HashMap<(String, NaiveDate, String), DailyUsage>>,
    identifications: Mutex<Vec<IdentificationRow>>,
    enrichment: Mutex<HashMap<(String, String, String), EnrichmentRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn usage_rows(&self) -> Vec<UsageRow> {
        self.usage.lock().unwrap().clone()
    }

    pub fn identification_rows(&self) -> Vec<IdentificationRow> {
        self.identifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn insert_usage(&self, row: &UsageRow) -> Result<(), AgentError> {
        self.usage.lock().unwrap().push(row.clone());
        Ok(())
    }

    async fn upsert_daily(&self, row: &UsageRow) -> Result<(), AgentError> {
        let key = (
            row.user_id.clone(),
            row.created_at.date_naive(),
            row.provider.clone(),
        );
        let mut daily = self.daily.lock().unwrap();
        let entry = daily.entry(key).or_insert_with(|| DailyUsage {
            user_id: row.user_id.clone(),
            date: row.created_at.date_naive(),
            provider: row.provider.clone(),
            request_count: 0,
            success_count: 0,
            failure_count: 0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_cost_usd: Decimal::ZERO,
            avg_latency_ms: 0,
        });
        entry.avg_latency_ms = (entry.avg_latency_ms * entry.request_count + row.latency_ms)
            / (entry.request_count + 1);
        entry.request_count += 1;
        if row.success {
            entry.success_count += 1;
        } else {
            entry.failure_count += 1;
        }
        entry.total_input_tokens += row.input_tokens as i64;
        entry.total_output_tokens += row.output_tokens as i64;
        entry.total_cost_usd += row.cost_usd;
        Ok(())
    }

    async fn daily_usage(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<DailyUsage>, AgentError> {
        let daily = self.daily.lock().unwrap();
        let mut rows: Vec<DailyUsage> = daily
            .values()
            .filter(|d| d.user_id == user_id && d.date == date)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(rows)
    }

    async fn detailed_stats(&self, user_id: &str, days: i64) -> Result<Vec<DailyUsage>, AgentError> {
        let since = Utc::now().date_naive() - Duration::days(days.max(0));
        let daily = self.daily.lock().unwrap();
        let mut rows: Vec<DailyUsage> = daily
            .values()
            .filter(|d| d.user_id == user_id && d.date >= since)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.date.cmp(&a.date).then(a.provider.cmp(&b.provider)));
        Ok(rows)
    }

    async fn cost_summary(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<CostSummary, AgentError> {
        let daily = self.daily.lock().unwrap();
        let mut by_provider: HashMap<String, ProviderCost> = HashMap::new();
        for d in daily
            .values()
            .filter(|d| d.user_id == user_id && d.date >= start && d.date <= end)
        {
            let entry = by_provider
                .entry(d.provider.clone())
                .or_insert_with(|| ProviderCost {
                    provider: d.provider.clone(),
                    request_count: 0,
                    total_cost_usd: Decimal::ZERO,
                });
            entry.request_count += d.request_count;
            entry.total_cost_usd += d.total_cost_usd;
        }
        let mut by_provider: Vec<ProviderCost> = by_provider.into_values().collect();
        by_provider.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(CostSummary {
            start_date: start,
            end_date: end,
            request_count: by_provider.iter().map(|p| p.request_count).sum(),
            total_cost_usd: by_provider.iter().map(|p| p.total_cost_usd).sum(),
            by_provider,
        })
    }

    async fn failure_window(
        &self,
        provider: &str,
        window_secs: i64,
    ) -> Result<FailureWindow, AgentError> {
        let since = Utc::now() - Duration::seconds(window_secs);
        let usage = self.usage.lock().unwrap();
        let mut window = FailureWindow::default();
        let retryable = ["timeout", "rate_limit", "server_error", "overloaded", "ssl_error"];
        for row in usage.iter().filter(|r| {
            r.provider == provider
                && !r.success
                && r.created_at >= since
                && r.error_type
                    .as_deref()
                    .map(|t| retryable.contains(&t))
                    .unwrap_or(false)
        }) {
            window.failures += 1;
            window.last_failure_at = match window.last_failure_at {
                Some(ts) if ts >= row.created_at => Some(ts),
                _ => Some(row.created_at),
            };
        }
        Ok(window)
    }

    async fn insert_identification(&self, row: &IdentificationRow) -> Result<(), AgentError> {
        self.identifications.lock().unwrap().push(row.clone());
        Ok(())
    }

    async fn get_enrichment(
        &self,
        producer: &str,
        wine_name: &str,
        vintage: &str,
    ) -> Result<Option<EnrichmentRow>, AgentError> {
        let map = self.enrichment.lock().unwrap();
        Ok(map
            .get(&(
                producer.to_string(),
                wine_name.to_string(),
                vintage.to_string(),
            ))
            .cloned())
    }

    async fn search_enrichment(&self, vintage: &str) -> Result<Vec<EnrichmentRow>, AgentError> {
        let map = self.enrichment.lock().unwrap();
        Ok(map
            .values()
            .filter(|r| r.canonical_vintage == vintage)
            .cloned()
            .collect())
    }

    async fn put_enrichment(&self, row: &EnrichmentRow) -> Result<(), AgentError> {
        let key = (
            row.canonical_producer.clone(),
            row.canonical_wine_name.clone(),
            row.canonical_vintage.clone(),
        );
        self.enrichment.lock().unwrap().insert(key, row.clone());
        Ok(())
    }
}
