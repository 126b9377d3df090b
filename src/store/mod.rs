//! Persistence boundary of the agent core.
//!
//! The core touches exactly four tables: the usage log, its daily
//! aggregates, identification analytics, and the enrichment cache.
//! [`AgentStore`] abstracts them so services and the router can be
//! exercised against [`memory::MemoryStore`] without a live Postgres.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;

use crate::errors::AgentError;

pub mod memory;
pub mod postgres;

#[derive(Debug, Clone)]
pub struct UsageRow {
    pub user_id: String,
    pub session_id: Option<String>,
    pub provider: String,
    pub model: String,
    pub task_type: String,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub cost_usd: Decimal,
    pub latency_ms: i64,
    pub success: bool,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DailyUsage {
    pub user_id: String,
    pub date: NaiveDate,
    pub provider: String,
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_cost_usd: Decimal,
    pub avg_latency_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSummary {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub request_count: i64,
    pub total_cost_usd: Decimal,
    pub by_provider: Vec<ProviderCost>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCost {
    pub provider: String,
    pub request_count: i64,
    pub total_cost_usd: Decimal,
}

/// Final per-query analytics row.
#[derive(Debug, Clone)]
pub struct IdentificationRow {
    pub user_id: String,
    pub session_id: Option<String>,
    pub input_type: String,
    pub input_hash: Option<String>,
    pub final_confidence: i32,
    pub final_action: String,
    pub final_tier: String,
    /// Ordered tier path: [{tier, model, confidence, costUSD}, ...]
    pub tiers: Value,
    pub total_cost_usd: Decimal,
    pub total_latency_ms: i64,
    pub identified_producer: Option<String>,
    pub identified_wine_name: Option<String>,
    pub identified_vintage: Option<String>,
    pub identified_region: Option<String>,
    pub inferences_applied: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EnrichmentRow {
    pub canonical_producer: String,
    pub canonical_wine_name: String,
    pub canonical_vintage: String,
    pub payload: Value,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl EnrichmentRow {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Failure picture for one provider inside the breaker's sample window.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureWindow {
    pub failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn insert_usage(&self, row: &UsageRow) -> Result<(), AgentError>;
    async fn upsert_daily(&self, row: &UsageRow) -> Result<(), AgentError>;
    async fn daily_usage(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<DailyUsage>, AgentError>;
    async fn detailed_stats(&self, user_id: &str, days: i64) -> Result<Vec<DailyUsage>, AgentError>;
    async fn cost_summary(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<CostSummary, AgentError>;
    /// Retryable failures for the provider within the trailing window.
    /// Durable source of the circuit breaker's state.
    async fn failure_window(
        &self,
        provider: &str,
        window_secs: i64,
    ) -> Result<FailureWindow, AgentError>;
    async fn insert_identification(&self, row: &IdentificationRow) -> Result<(), AgentError>;

    async fn get_enrichment(
        &self,
        producer: &str,
        wine_name: &str,
        vintage: &str,
    ) -> Result<Option<EnrichmentRow>, AgentError>;
    /// Read-only candidate query for the canonical-name resolver; keyed
    /// by vintage only so the resolver can score producer/name distance.
    async fn search_enrichment(&self, vintage: &str) -> Result<Vec<EnrichmentRow>, AgentError>;
    async fn put_enrichment(&self, row: &EnrichmentRow) -> Result<(), AgentError>;
}
