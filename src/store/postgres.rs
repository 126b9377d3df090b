use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;

use super::{
    AgentStore, CostSummary, DailyUsage, EnrichmentRow, FailureWindow, IdentificationRow,
    ProviderCost, UsageRow,
};
use crate::errors::AgentError;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn ping(&self) -> bool {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}

#[async_trait]
impl AgentStore for PgStore {
    async fn insert_usage(&self, row: &UsageRow) -> Result<(), AgentError> {
        sqlx::query(
            r#"INSERT INTO usage_log
               (user_id, session_id, provider, model, task_type, input_tokens, output_tokens,
                cost_usd, latency_ms, success, error_type, error_message, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"#,
        )
        .bind(&row.user_id)
        .bind(&row.session_id)
        .bind(&row.provider)
        .bind(&row.model)
        .bind(&row.task_type)
        .bind(row.input_tokens)
        .bind(row.output_tokens)
        .bind(row.cost_usd)
        .bind(row.latency_ms)
        .bind(row.success)
        .bind(&row.error_type)
        .bind(&row.error_message)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_daily(&self, row: &UsageRow) -> Result<(), AgentError> {
        let (succ, fail) = if row.success { (1i64, 0i64) } else { (0, 1) };
        sqlx::query(
            r#"INSERT INTO usage_daily
               (user_id, date, provider, request_count, success_count, failure_count,
                total_input_tokens, total_output_tokens, total_cost_usd, avg_latency_ms, updated_at)
               VALUES ($1, $2, $3, 1, $4, $5, $6, $7, $8, $9, now())
               ON CONFLICT (user_id, date, provider) DO UPDATE SET
                 request_count = usage_daily.request_count + 1,
                 success_count = usage_daily.success_count + $4,
                 failure_count = usage_daily.failure_count + $5,
                 total_input_tokens = usage_daily.total_input_tokens + $6,
                 total_output_tokens = usage_daily.total_output_tokens + $7,
                 total_cost_usd = usage_daily.total_cost_usd + $8,
                 avg_latency_ms = (usage_daily.avg_latency_ms * usage_daily.request_count + $9)
                                  / (usage_daily.request_count + 1),
                 updated_at = now()"#,
        )
        .bind(&row.user_id)
        .bind(row.created_at.date_naive())
        .bind(&row.provider)
        .bind(succ)
        .bind(fail)
        .bind(row.input_tokens as i64)
        .bind(row.output_tokens as i64)
        .bind(row.cost_usd)
        .bind(row.latency_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn daily_usage(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<DailyUsage>, AgentError> {
        let rows = sqlx::query_as::<_, DailyUsage>(
            r#"SELECT user_id, date, provider, request_count, success_count, failure_count,
                      total_input_tokens, total_output_tokens, total_cost_usd, avg_latency_ms
               FROM usage_daily WHERE user_id = $1 AND date = $2 ORDER BY provider"#,
        )
        .bind(user_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn detailed_stats(&self, user_id: &str, days: i64) -> Result<Vec<DailyUsage>, AgentError> {
        let since = Utc::now().date_naive() - Duration::days(days.max(0));
        let rows = sqlx::query_as::<_, DailyUsage>(
            r#"SELECT user_id, date, provider, request_count, success_count, failure_count,
                      total_input_tokens, total_output_tokens, total_cost_usd, avg_latency_ms
               FROM usage_daily WHERE user_id = $1 AND date >= $2
               ORDER BY date DESC, provider"#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn cost_summary(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<CostSummary, AgentError> {
        let rows = sqlx::query_as::<_, (String, i64, Decimal)>(
            r#"SELECT provider, SUM(request_count)::BIGINT, SUM(total_cost_usd)
               FROM usage_daily
               WHERE user_id = $1 AND date BETWEEN $2 AND $3
               GROUP BY provider ORDER BY provider"#,
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let by_provider: Vec<ProviderCost> = rows
            .into_iter()
            .map(|(provider, request_count, total_cost_usd)| ProviderCost {
                provider,
                request_count,
                total_cost_usd,
            })
            .collect();

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
        // Only retryable failures count toward the breaker; a 400 from a
        // bad prompt must never open the circuit.
        let row = sqlx::query_as::<_, (i64, Option<chrono::DateTime<Utc>>)>(
            r#"SELECT COUNT(*), MAX(created_at)
               FROM usage_log
               WHERE provider = $1 AND success = false AND created_at >= $2
                 AND error_type IN ('timeout', 'rate_limit', 'server_error', 'overloaded', 'ssl_error')"#,
        )
        .bind(provider)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(FailureWindow {
            failures: row.0 as u32,
            last_failure_at: row.1,
        })
    }

    async fn insert_identification(&self, row: &IdentificationRow) -> Result<(), AgentError> {
        sqlx::query(
            r#"INSERT INTO identification_results
               (user_id, session_id, input_type, input_hash, final_confidence, final_action,
                final_tier, tiers, total_cost_usd, total_latency_ms, identified_producer,
                identified_wine_name, identified_vintage, identified_region,
                inferences_applied, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"#,
        )
        .bind(&row.user_id)
        .bind(&row.session_id)
        .bind(&row.input_type)
        .bind(&row.input_hash)
        .bind(row.final_confidence)
        .bind(&row.final_action)
        .bind(&row.final_tier)
        .bind(&row.tiers)
        .bind(row.total_cost_usd)
        .bind(row.total_latency_ms)
        .bind(&row.identified_producer)
        .bind(&row.identified_wine_name)
        .bind(&row.identified_vintage)
        .bind(&row.identified_region)
        .bind(&row.inferences_applied)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_enrichment(
        &self,
        producer: &str,
        wine_name: &str,
        vintage: &str,
    ) -> Result<Option<EnrichmentRow>, AgentError> {
        let row = sqlx::query_as::<_, EnrichmentRow>(
            r#"SELECT canonical_producer, canonical_wine_name, canonical_vintage,
                      payload, source, created_at, expires_at
               FROM enrichment_cache
               WHERE canonical_producer = $1 AND canonical_wine_name = $2
                 AND canonical_vintage = $3"#,
        )
        .bind(producer)
        .bind(wine_name)
        .bind(vintage)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn search_enrichment(&self, vintage: &str) -> Result<Vec<EnrichmentRow>, AgentError> {
        let rows = sqlx::query_as::<_, EnrichmentRow>(
            r#"SELECT canonical_producer, canonical_wine_name, canonical_vintage,
                      payload, source, created_at, expires_at
               FROM enrichment_cache
               WHERE canonical_vintage = $1
               ORDER BY created_at DESC
               LIMIT 200"#,
        )
        .bind(vintage)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn put_enrichment(&self, row: &EnrichmentRow) -> Result<(), AgentError> {
        sqlx::query(
            r#"INSERT INTO enrichment_cache
               (canonical_producer, canonical_wine_name, canonical_vintage,
                payload, source, created_at, expires_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (canonical_producer, canonical_wine_name, canonical_vintage)
               DO UPDATE SET payload = $4, source = $5, created_at = $6, expires_at = $7"#,
        )
        .bind(&row.canonical_producer)
        .bind(&row.canonical_wine_name)
        .bind(&row.canonical_vintage)
        .bind(&row.payload)
        .bind(&row.source)
        .bind(row.created_at)
        .bind(row.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
