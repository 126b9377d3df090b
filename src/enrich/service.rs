//! Enrichment service: cache-first cellar cards with streaming generation.
//!
//! The cache is tried first (exact, then fuzzy with user confirmation);
//! misses stream a fresh card from the router with web grounding, then
//! validate, merge over any prior row, and persist with a TTL. Cache
//! hits are replayed field by field so the client renders progressively
//! either way.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Value};

use crate::api::sse::SseSession;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::errors::{AgentError, ErrorKind};
use crate::llm::LlmClient;
use crate::prompts;
use crate::providers::{Capability, CompletionOptions, ToolSpec};
use crate::store::{AgentStore, EnrichmentRow};
use crate::usage::Caller;

use super::canonical::{canonical_key, resolve, CanonicalKey};
use super::record::EnrichmentRecord;

/// Replay order for cached records: style first for fast visual
/// feedback, prose last.
const REPLAY_SECTIONS: [&str; 6] = [
    "grapeComposition",
    "drinkWindow",
    "criticScores",
    "tastingNotes",
    "foodPairings",
    "overview",
];

#[derive(Debug, Clone, Default)]
pub struct EnrichRequest {
    pub producer: String,
    pub wine_name: String,
    pub vintage: Option<String>,
    pub wine_type: Option<String>,
    pub region: Option<String>,
    pub confirm_match: bool,
    pub force_refresh: bool,
}

#[derive(Debug, Clone)]
pub enum EnrichOutcome {
    Record(EnrichmentRecord),
    PendingConfirmation {
        match_type: String,
        searched_for: String,
        matched_to: String,
        confidence: f64,
    },
}

enum CacheLookup {
    Fresh(EnrichmentRecord),
    Pending {
        matched_to: String,
        confidence: f64,
    },
    /// No usable row; carries the prior record (expired or refreshed
    /// over) for section-wise merge.
    Miss(Option<EnrichmentRecord>),
}

pub struct EnrichmentService {
    llm: Arc<LlmClient>,
    config: Arc<Config>,
    store: Arc<dyn AgentStore>,
}

impl EnrichmentService {
    pub fn new(llm: Arc<LlmClient>, config: Arc<Config>, store: Arc<dyn AgentStore>) -> Self {
        Self { llm, config, store }
    }

    // ── Buffered ──────────────────────────────────────────────

    pub async fn enrich(
        &self,
        req: &EnrichRequest,
        caller: &Caller,
        cancel: &CancelToken,
    ) -> Result<EnrichOutcome, AgentError> {
        let key = self.key_for(req);
        match self.lookup(req, &key).await? {
            CacheLookup::Fresh(record) => Ok(EnrichOutcome::Record(record)),
            CacheLookup::Pending {
                matched_to,
                confidence,
            } => Ok(EnrichOutcome::PendingConfirmation {
                match_type: "fuzzy".into(),
                searched_for: display_name(req),
                matched_to,
                confidence,
            }),
            CacheLookup::Miss(prior) => {
                let record = self
                    .generate(req, &key, prior, caller, cancel, None)
                    .await?;
                Ok(EnrichOutcome::Record(record))
            }
        }
    }

    // ── Streaming ─────────────────────────────────────────────

    pub async fn enrich_streaming(
        &self,
        req: &EnrichRequest,
        caller: &Caller,
        cancel: &CancelToken,
        session: &SseSession,
    ) {
        let key = self.key_for(req);
        let lookup = match self.lookup(req, &key).await {
            Ok(l) => l,
            Err(e) => {
                session.error(e.kind, &e.message, "agentEnrichStream");
                return;
            }
        };

        match lookup {
            CacheLookup::Fresh(record) => {
                self.replay_cached(&record, session).await;
                session.emit("result", record.to_value());
                session.done();
            }
            CacheLookup::Pending {
                matched_to,
                confidence,
            } => {
                session.emit(
                    "confirmation_required",
                    json!({
                        "matchType": "fuzzy",
                        "searchedFor": display_name(req),
                        "matchedTo": matched_to,
                        "confidence": confidence,
                    }),
                );
                session.done();
            }
            CacheLookup::Miss(prior) => {
                match self
                    .generate(req, &key, prior, caller, cancel, Some(session))
                    .await
                {
                    Ok(record) => {
                        session.emit("result", record.to_value());
                        session.done();
                    }
                    Err(e) => session.error(e.kind, &e.message, "agentEnrichStream"),
                }
            }
        }
    }

    // ── Cache lookup ──────────────────────────────────────────

    fn key_for(&self, req: &EnrichRequest) -> CanonicalKey {
        canonical_key(&req.producer, &req.wine_name, req.vintage.as_deref())
    }

    async fn lookup(
        &self,
        req: &EnrichRequest,
        key: &CanonicalKey,
    ) -> Result<CacheLookup, AgentError> {
        let now = Utc::now();
        let exact = self
            .store
            .get_enrichment(&key.producer, &key.wine_name, &key.vintage)
            .await?;

        if req.force_refresh {
            return Ok(CacheLookup::Miss(exact.map(|r| record_of(&r))));
        }

        if let Some(row) = &exact {
            if !row.is_expired(now) {
                let mut record = record_of(row);
                record.source = "cache".into();
                return Ok(CacheLookup::Fresh(record));
            }
        }

        // Fuzzy path only when there was no exact row at all; an expired
        // exact row regenerates below with its sections as the merge base.
        if exact.is_none() {
            let candidates = self.store.search_enrichment(&key.vintage).await?;
            let live: Vec<EnrichmentRow> = candidates
                .into_iter()
                .filter(|r| !r.is_expired(now))
                .collect();
            if let Some(proposal) =
                resolve(&live, key, &self.config.enrichment.fuzzy_thresholds)
            {
                let matched_to = format!(
                    "{} {}",
                    proposal.row.canonical_producer, proposal.row.canonical_wine_name
                );
                if req.confirm_match {
                    let mut record = record_of(proposal.row);
                    record.source = "cache".into();
                    return Ok(CacheLookup::Fresh(record));
                }
                return Ok(CacheLookup::Pending {
                    matched_to,
                    confidence: proposal.confidence,
                });
            }
        }

        Ok(CacheLookup::Miss(exact.map(|r| record_of(&r))))
    }

    // ── Generation ────────────────────────────────────────────

    async fn generate(
        &self,
        req: &EnrichRequest,
        key: &CanonicalKey,
        prior: Option<EnrichmentRecord>,
        caller: &Caller,
        cancel: &CancelToken,
        session: Option<&SseSession>,
    ) -> Result<EnrichmentRecord, AgentError> {
        let prompt = prompts::enrich(&req.producer, &req.wine_name, req.vintage.as_deref());
        let options = CompletionOptions {
            json_response: true,
            response_schema: Some(prompts::enrichment_schema()),
            tools: vec![ToolSpec::GoogleSearch],
            timeout_secs: Some(90),
            ..Default::default()
        };

        let resp = match session {
            Some(session) => {
                let field_session = session.clone();
                let mut on_field = move |name: &str, value: &Value| {
                    field_session.field(name, value);
                };
                self.llm
                    .stream_complete("enrich", &prompt, options, caller, cancel, &mut on_field)
                    .await
                    .response
            }
            None => {
                self.llm
                    .complete("enrich", &prompt, options, caller, cancel)
                    .await
            }
        };

        if !resp.success {
            // Degrade to whatever the cache still holds.
            if let Some(mut stale) = prior {
                tracing::warn!(
                    producer = %key.producer,
                    "enrichment failed, serving stale cache row"
                );
                stale.source = "cache".into();
                stale.stale = true;
                return Ok(stale);
            }
            let kind = resp.error_kind.unwrap_or(ErrorKind::EnrichmentError);
            return Err(AgentError::new(
                kind,
                resp.error.unwrap_or_else(|| "enrichment failed".into()),
            ));
        }

        let parsed: Value = serde_json::from_str(resp.content.trim()).unwrap_or(Value::Null);
        let mut record = EnrichmentRecord::from_value(&parsed);
        let dropped = record.validate();
        if !dropped.is_empty() {
            tracing::warn!(?dropped, "enrichment sections failed validation");
        }
        record.source = self.generation_source();

        if let Some(prior) = prior {
            record = record.merge_over(&prior);
        }

        let now = Utc::now();
        let row = EnrichmentRow {
            canonical_producer: key.producer.clone(),
            canonical_wine_name: key.wine_name.clone(),
            canonical_vintage: key.vintage.clone(),
            payload: record.to_value(),
            source: record.source.clone(),
            created_at: now,
            expires_at: now + Duration::days(self.config.enrichment.cache_ttl_days),
        };
        if let Err(e) = self.store.put_enrichment(&row).await {
            tracing::error!("failed to persist enrichment row: {e}");
        }

        Ok(record)
    }

    fn generation_source(&self) -> String {
        let grounded = self
            .config
            .route("enrich")
            .and_then(|r| self.llm.provider(&r.primary.provider))
            .map(|p| p.supports(Capability::Grounding))
            .unwrap_or(false);
        if grounded {
            "web_search".into()
        } else {
            "inference".into()
        }
    }

    // ── Cache-hit replay ──────────────────────────────────────

    /// Simulate streaming for a cached record: style scalars first, then
    /// the remaining sections, each separated by a small delay.
    async fn replay_cached(&self, record: &EnrichmentRecord, session: &SseSession) {
        let delay =
            std::time::Duration::from_millis(self.config.enrichment.cache_replay_delay_ms);
        let value = record.to_value();

        if let Some(style) = value.get("styleProfile").and_then(|v| v.as_object()) {
            for field in ["body", "tannin", "acidity", "sweetness"] {
                if let Some(v) = style.get(field) {
                    session.field(field, v);
                    tokio::time::sleep(delay).await;
                }
            }
        }
        for section in REPLAY_SECTIONS {
            if let Some(v) = value.get(section) {
                session.field(section, v);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn record_of(row: &EnrichmentRow) -> EnrichmentRecord {
    EnrichmentRecord::from_value(&row.payload)
}

fn display_name(req: &EnrichRequest) -> String {
    if req.producer == req.wine_name {
        req.producer.clone()
    } else {
        format!("{} {}", req.producer, req.wine_name)
    }
}
