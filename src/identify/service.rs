//! Tiered identification service.
//!
//! Tier 1 answers fast (streaming when the transport allows it); anything
//! under the confidence threshold escalates through deeper tiers, with
//! the client never seeing a regression: fields already emitted stay
//! valid, and a failed or non-improving escalation leaves the Tier 1
//! result in place.

use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::api::sse::SseSession;
use crate::cancel::CancelToken;
use crate::config::{Config, TierSpec};
use crate::errors::{AgentError, ErrorKind};
use crate::llm::LlmClient;
use crate::prompts;
use crate::providers::{CompletionOptions, ProviderResponse, ThinkingLevel, ToolSpec};
use crate::store::IdentificationRow;
use crate::usage::Caller;

use super::context::AugmentationContext;
use super::result::{
    derive_action, Escalation, EscalationStep, IdentificationOutcome, WineIdentification,
};

#[derive(Debug, Clone)]
pub enum IdentifyInput {
    Text(String),
    Image {
        bytes: Vec<u8>,
        mime_type: String,
        supplementary: Option<String>,
    },
}

impl IdentifyInput {
    pub fn task(&self) -> &'static str {
        match self {
            IdentifyInput::Text(_) => "identify_text",
            IdentifyInput::Image { .. } => "identify_image",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IdentifyInput::Text(_) => "text",
            IdentifyInput::Image { .. } => "image",
        }
    }

    fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        match self {
            IdentifyInput::Text(t) => hasher.update(t.as_bytes()),
            IdentifyInput::Image { bytes, .. } => hasher.update(bytes),
        }
        hex::encode(&hasher.finalize()[..8])
    }

    /// Tier wall-clock budgets: vision reads take longer.
    fn tier1_timeout_secs(&self) -> u64 {
        match self {
            IdentifyInput::Text(_) => 30,
            IdentifyInput::Image { .. } => 60,
        }
    }
}

pub struct IdentificationService {
    llm: Arc<LlmClient>,
    config: Arc<Config>,
}

impl IdentificationService {
    pub fn new(llm: Arc<LlmClient>, config: Arc<Config>) -> Self {
        Self { llm, config }
    }

    // ── Streaming path ────────────────────────────────────────

    pub async fn identify_streaming(
        &self,
        input: &IdentifyInput,
        augmentation: &AugmentationContext,
        caller: &Caller,
        cancel: &CancelToken,
        session: &SseSession,
    ) {
        let started = std::time::Instant::now();
        let task = input.task();

        // Streaming disabled for this task: run buffered and replay.
        if !self.config.streams_task(task) {
            match self.identify(input, augmentation, caller, cancel).await {
                Ok(outcome) => {
                    session.emit("result", serde_json::to_value(&outcome).unwrap_or(Value::Null));
                    session.done();
                }
                Err(e) => session.error(e.kind, &e.message, task),
            }
            return;
        }

        let options = self.tier1_options(input, true);
        let prompt = self.tier1_prompt(input, true);
        let field_session = session.clone();
        let mut on_field = move |name: &str, value: &Value| {
            field_session.field(name, value);
        };

        let sresp = match input {
            IdentifyInput::Text(_) => {
                self.llm
                    .stream_complete(task, &prompt, options, caller, cancel, &mut on_field)
                    .await
            }
            IdentifyInput::Image {
                bytes, mime_type, ..
            } => {
                self.llm
                    .stream_complete_with_image(
                        task, &prompt, bytes, mime_type, options, caller, cancel, &mut on_field,
                    )
                    .await
            }
        };

        let resp = sresp.response;
        if !resp.success {
            let kind = resp.error_kind.unwrap_or(ErrorKind::IdentificationError);
            session.error(kind, resp.error.as_deref().unwrap_or("identification failed"), task);
            return;
        }

        let mut wine = parse_identification(&resp.content);
        let mut inferences = augmentation.apply_locked(&mut wine);
        let streamed_confidence = wine.confidence;
        let mut escalation = Escalation {
            path: vec![step("tier1", &resp, wine.confidence)],
            ..Default::default()
        };

        // Cancel token created after the last byte was read still ends
        // in a clean `done`; only further work is skipped.
        let cancelled_after_stream = cancel.is_cancelled();

        // Confidence is always the last field the client sees before the
        // full payload.
        session.field("confidence", &json!(wine.confidence));

        if wine.confidence >= self.config.confidence.tier1_threshold || cancelled_after_stream {
            if cancelled_after_stream {
                escalation.cancelled = cancel.is_cancelled();
            }
            let outcome = self.outcome(wine, escalation);
            if !cancelled_after_stream {
                session.emit("result", serde_json::to_value(&outcome).unwrap_or(Value::Null));
            }
            session.done();
            self.log_analytics(
                caller,
                input,
                &outcome,
                started.elapsed().as_millis() as i64,
                &inferences,
            )
            .await;
            return;
        }

        // Sub-threshold: show what we have, then refine silently.
        let provisional = self.outcome(wine.clone(), escalation.clone());
        session.emit(
            "result",
            serde_json::to_value(&provisional).unwrap_or(Value::Null),
        );

        if cancel.is_cancelled() {
            escalation.cancelled = true;
            let outcome = self.outcome(wine, escalation);
            session.done();
            self.log_analytics(
                caller,
                input,
                &outcome,
                started.elapsed().as_millis() as i64,
                &inferences,
            )
            .await;
            return;
        }

        let refine_event = match input {
            IdentifyInput::Text(_) => "refining",
            IdentifyInput::Image { .. } => "escalating",
        };
        session.emit(
            refine_event,
            json!({
                "message": "Taking a closer look at this wine...",
                "tier1Confidence": streamed_confidence,
            }),
        );

        let before = wine.clone();
        let best = self
            .escalate(
                input,
                wine,
                &mut escalation,
                &mut inferences,
                augmentation,
                caller,
                cancel,
            )
            .await;

        let escalated = best.confidence > streamed_confidence;
        let outcome = self.outcome(best, escalation);
        if escalated {
            for (name, value) in before.shallow_diff(&outcome.wine) {
                if name != "confidence" {
                    session.field(&name, &value);
                }
            }
            session.field("confidence", &json!(outcome.wine.confidence));
        }
        let mut refined = serde_json::to_value(&outcome).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut refined {
            map.insert("escalated".to_string(), json!(escalated));
        }
        session.emit("refined", refined);
        session.done();
        self.log_analytics(
            caller,
            input,
            &outcome,
            started.elapsed().as_millis() as i64,
            &inferences,
        )
        .await;
    }

    // ── Buffered path ─────────────────────────────────────────

    pub async fn identify(
        &self,
        input: &IdentifyInput,
        augmentation: &AugmentationContext,
        caller: &Caller,
        cancel: &CancelToken,
    ) -> Result<IdentificationOutcome, AgentError> {
        let started = std::time::Instant::now();
        let options = self.tier1_options(input, false);
        let prompt = self.tier1_prompt(input, false);

        let resp = self.call(input, &prompt, options, caller, cancel).await;
        if !resp.success {
            let kind = resp.error_kind.unwrap_or(ErrorKind::IdentificationError);
            return Err(AgentError::new(
                kind,
                resp.error.unwrap_or_else(|| "identification failed".into()),
            ));
        }

        let mut wine = parse_identification(&resp.content);
        let mut inferences = augmentation.apply_locked(&mut wine);
        let mut escalation = Escalation {
            path: vec![step("tier1", &resp, wine.confidence)],
            ..Default::default()
        };

        let wine = if wine.confidence < self.config.confidence.tier1_threshold {
            self.escalate(
                input,
                wine,
                &mut escalation,
                &mut inferences,
                augmentation,
                caller,
                cancel,
            )
            .await
        } else {
            wine
        };

        let outcome = self.outcome(wine, escalation);
        self.log_analytics(
            caller,
            input,
            &outcome,
            started.elapsed().as_millis() as i64,
            &inferences,
        )
        .await;
        Ok(outcome)
    }

    // ── User-triggered tiers ──────────────────────────────────

    /// Tier 3. Never auto-invoked; reached only from its own endpoint.
    pub async fn identify_with_opus(
        &self,
        input: &IdentifyInput,
        prior: WineIdentification,
        augmentation: &AugmentationContext,
        caller: &Caller,
        cancel: &CancelToken,
    ) -> Result<IdentificationOutcome, AgentError> {
        let tier = self.config.tiers.tier3.clone();
        self.user_triggered_tier(input, prior, augmentation, caller, cancel, "tier3", tier, None)
            .await
    }

    /// Tier 1.5 against a label photo, user-triggered.
    pub async fn verify_image(
        &self,
        input: &IdentifyInput,
        prior: WineIdentification,
        augmentation: &AugmentationContext,
        caller: &Caller,
        cancel: &CancelToken,
    ) -> Result<IdentificationOutcome, AgentError> {
        let tier = self.config.tiers.tier1_5.clone();
        self.user_triggered_tier(
            input,
            prior,
            augmentation,
            caller,
            cancel,
            "tier1.5",
            tier,
            Some(ThinkingLevel::High),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn user_triggered_tier(
        &self,
        input: &IdentifyInput,
        prior: WineIdentification,
        augmentation: &AugmentationContext,
        caller: &Caller,
        cancel: &CancelToken,
        label: &str,
        tier: TierSpec,
        thinking: Option<ThinkingLevel>,
    ) -> Result<IdentificationOutcome, AgentError> {
        let started = std::time::Instant::now();
        let mut aug = augmentation.clone();
        aug.prior = Some(prior.clone());

        let options = CompletionOptions {
            provider: Some(tier.provider.clone()),
            model: Some(tier.model.clone()),
            thinking_level: thinking,
            tools: vec![ToolSpec::GoogleSearch],
            response_schema: Some(prompts::identification_schema()),
            json_response: true,
            timeout_secs: Some(tier.timeout_secs),
            ..Default::default()
        };
        let prompt = self.deep_prompt(input, &aug);

        let resp = self.call(input, &prompt, options, caller, cancel).await;
        if !resp.success {
            let kind = resp.error_kind.unwrap_or(ErrorKind::IdentificationError);
            return Err(AgentError::new(
                kind,
                resp.error.unwrap_or_else(|| "identification failed".into()),
            ));
        }

        let mut wine = parse_identification(&resp.content);
        let overridden = aug.apply_locked(&mut wine);

        // Never regress below what the user already had.
        let mut escalation = Escalation::default();
        let mut inferences = Vec::new();
        let new_step = step(label, &resp, wine.confidence);
        let wine = if wine.confidence > prior.confidence {
            escalation.path.push(new_step);
            inferences = overridden;
            wine
        } else {
            escalation.path.push(EscalationStep {
                tier: "prior".into(),
                model: "-".into(),
                confidence: prior.confidence,
                cost_usd: 0.0,
            });
            escalation.rejected.push(new_step);
            prior
        };

        let outcome = self.outcome(wine, escalation);
        self.log_analytics(
            caller,
            input,
            &outcome,
            started.elapsed().as_millis() as i64,
            &inferences,
        )
        .await;
        Ok(outcome)
    }

    // ── Escalation ladder ─────────────────────────────────────

    /// Run Tier 1.5 and, if still unconvincing, Tier 2. Tier 3 is never
    /// entered here. Returns the best result seen; the escalation record
    /// carries adopted steps, rejected attempts, cancellation, and the
    /// first terminal error.
    #[allow(clippy::too_many_arguments)]
    async fn escalate(
        &self,
        input: &IdentifyInput,
        mut best: WineIdentification,
        escalation: &mut Escalation,
        inferences: &mut Vec<String>,
        augmentation: &AugmentationContext,
        caller: &Caller,
        cancel: &CancelToken,
    ) -> WineIdentification {
        let ladder: [(&str, TierSpec, Option<ThinkingLevel>, bool); 2] = [
            (
                "tier1.5",
                self.config.tiers.tier1_5.clone(),
                Some(ThinkingLevel::High),
                true,
            ),
            ("tier2", self.config.tiers.tier2.clone(), None, false),
        ];

        for (label, tier, thinking, grounded) in ladder {
            if cancel.is_cancelled() {
                escalation.cancelled = true;
                return best;
            }

            let mut aug = augmentation.clone();
            aug.prior = Some(best.clone());
            let prompt = self.deep_prompt(input, &aug);

            let options = CompletionOptions {
                // Tier 2 forces the balanced model through the router's
                // provider-override path.
                provider: Some(tier.provider.clone()),
                model: Some(tier.model.clone()),
                thinking_level: thinking,
                tools: if grounded {
                    vec![ToolSpec::GoogleSearch]
                } else {
                    Vec::new()
                },
                response_schema: Some(prompts::identification_schema()),
                json_response: true,
                timeout_secs: Some(tier.timeout_secs),
                ..Default::default()
            };

            let resp = self.call(input, &prompt, options, caller, cancel).await;
            if !resp.success {
                // Escalation failure degrades to "no refinement".
                escalation.error = resp.error_kind.map(|k| k.as_str().to_string());
                return best;
            }

            let mut candidate = parse_identification(&resp.content);
            let overridden = aug.apply_locked(&mut candidate);
            let new_step = step(label, &resp, candidate.confidence);

            if candidate.confidence > best.confidence {
                best = candidate;
                inferences.extend(overridden);
                escalation.path.push(new_step);
            } else {
                escalation.rejected.push(new_step);
            }

            if best.confidence >= self.config.confidence.tier1_5_threshold {
                return best;
            }
        }
        best
    }

    // ── Shared helpers ────────────────────────────────────────

    async fn call(
        &self,
        input: &IdentifyInput,
        prompt: &str,
        options: CompletionOptions,
        caller: &Caller,
        cancel: &CancelToken,
    ) -> ProviderResponse {
        match input {
            IdentifyInput::Text(_) => {
                self.llm
                    .complete(input.task(), prompt, options, caller, cancel)
                    .await
            }
            IdentifyInput::Image {
                bytes, mime_type, ..
            } => {
                self.llm
                    .complete_with_image(
                        input.task(),
                        prompt,
                        bytes,
                        mime_type,
                        options,
                        caller,
                        cancel,
                    )
                    .await
            }
        }
    }

    fn tier1_options(&self, input: &IdentifyInput, streaming: bool) -> CompletionOptions {
        CompletionOptions {
            json_response: true,
            response_schema: Some(prompts::identification_schema()),
            thinking_level: Some(if streaming {
                ThinkingLevel::Minimal
            } else {
                ThinkingLevel::Low
            }),
            temperature: Some(0.2),
            timeout_secs: Some(input.tier1_timeout_secs()),
            ..Default::default()
        }
    }

    fn tier1_prompt(&self, input: &IdentifyInput, streaming: bool) -> String {
        match input {
            IdentifyInput::Text(text) => {
                if streaming {
                    prompts::identify_text_compact(text)
                } else {
                    prompts::identify_text_full(text)
                }
            }
            IdentifyInput::Image { supplementary, .. } => {
                if streaming {
                    prompts::identify_image_compact(supplementary.as_deref())
                } else {
                    prompts::identify_image_full(supplementary.as_deref())
                }
            }
        }
    }

    fn deep_prompt(&self, input: &IdentifyInput, aug: &AugmentationContext) -> String {
        let rendered = aug.render();
        match input {
            IdentifyInput::Text(text) => prompts::identify_text_deep(text, &rendered),
            IdentifyInput::Image { supplementary, .. } => {
                prompts::identify_image_deep(supplementary.as_deref(), &rendered)
            }
        }
    }

    fn outcome(&self, wine: WineIdentification, escalation: Escalation) -> IdentificationOutcome {
        let action = derive_action(&wine, &self.config.confidence);
        IdentificationOutcome {
            wine,
            action,
            escalation,
        }
    }

    async fn log_analytics(
        &self,
        caller: &Caller,
        input: &IdentifyInput,
        outcome: &IdentificationOutcome,
        total_latency_ms: i64,
        inferences: &[String],
    ) {
        let mut applied: Vec<&String> = inferences.iter().collect();
        applied.sort();
        applied.dedup();
        let row = IdentificationRow {
            user_id: caller.user_id.clone(),
            session_id: caller.session_id.clone(),
            input_type: input.kind().to_string(),
            input_hash: Some(input.hash()),
            final_confidence: outcome.wine.confidence as i32,
            final_action: serde_json::to_value(outcome.action)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            final_tier: outcome.final_tier().to_string(),
            tiers: serde_json::to_value(&outcome.escalation).unwrap_or(Value::Null),
            total_cost_usd: rust_decimal::Decimal::from_f64_retain(outcome.total_cost_usd())
                .unwrap_or_default(),
            total_latency_ms,
            identified_producer: outcome.wine.producer.clone(),
            identified_wine_name: outcome.wine.wine_name.clone(),
            identified_vintage: outcome.wine.vintage.clone(),
            identified_region: outcome.wine.region.clone(),
            inferences_applied: json!(applied),
            created_at: chrono::Utc::now(),
        };
        self.llm.tracker().log_identification(row).await;
    }
}

fn parse_identification(content: &str) -> WineIdentification {
    match serde_json::from_str::<Value>(content.trim()) {
        Ok(v) => WineIdentification::from_value(&v),
        Err(_) => WineIdentification::default(),
    }
}

fn step(tier: &str, resp: &ProviderResponse, confidence: u8) -> EscalationStep {
    EscalationStep {
        tier: tier.to_string(),
        model: resp.model.clone(),
        confidence,
        cost_usd: resp.cost_usd.to_f64().unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::sse::{SseFrame, SseSession};
    use crate::config::{RouteTarget, TaskRoute};
    use crate::providers::mock::{MockCall, MockProvider};
    use crate::providers::Provider;
    use crate::store::memory::MemoryStore;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    struct Rig {
        service: IdentificationService,
        gemini: Arc<MockProvider>,
        claude: Arc<MockProvider>,
        store: Arc<MemoryStore>,
    }

    fn rig(gemini: MockProvider, claude: MockProvider) -> Rig {
        let mut cfg = Config::default();
        cfg.retry.base_delay_ms = 1;
        cfg.retry.max_delay_ms = 2;
        cfg.tiers.tier1_5.provider = "gemini".into();
        cfg.tiers.tier2.provider = "claude".into();
        cfg.tiers.tier3.provider = "claude".into();
        for task in ["identify_text", "identify_image"] {
            cfg.task_routing.insert(
                task.into(),
                TaskRoute {
                    primary: RouteTarget {
                        provider: "gemini".into(),
                        model: "gemini-mock-model".into(),
                    },
                    fallback: None,
                },
            );
        }
        let config = Arc::new(cfg);
        let store = Arc::new(MemoryStore::new());
        let gemini = Arc::new(gemini);
        let claude = Arc::new(claude);
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        providers.insert("gemini".into(), gemini.clone());
        providers.insert("claude".into(), claude.clone());
        let llm = Arc::new(LlmClient::new(config.clone(), providers, store.clone()));
        Rig {
            service: IdentificationService::new(llm, config),
            gemini,
            claude,
            store,
        }
    }

    fn caller() -> Caller {
        Caller::new("u1", Some("s1".into()))
    }

    fn drain(mut rx: mpsc::UnboundedReceiver<SseFrame>) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        while let Ok(f) = rx.try_recv() {
            frames.push(f);
        }
        frames
    }

    fn events<'a>(frames: &'a [SseFrame]) -> Vec<&'a str> {
        frames.iter().map(|f| f.event.as_str()).collect()
    }

    const HIGH_CONF: &str = r#"{"producer":"Château Margaux","wineName":"Château Margaux","vintage":"2019","region":"Margaux","country":"France","wineType":"Red","grapes":["Cabernet Sauvignon"],"confidence":97}"#;
    const MID_CONF: &str = r#"{"producer":"Cloudy Bay","wineName":"Sauvignon Blanc","vintage":"2022","region":"Marlborough","country":"New Zealand","wineType":"White","grapes":["Sauvignon Blanc"],"confidence":72}"#;
    const REFINED: &str = r#"{"producer":"Cloudy Bay","wineName":"Te Koko","vintage":"2022","region":"Marlborough","country":"New Zealand","wineType":"White","grapes":["Sauvignon Blanc"],"confidence":82}"#;

    // ── Scenario 1: high confidence, no refining ──────────────

    #[tokio::test]
    async fn test_high_confidence_stops_at_tier1() {
        let r = rig(
            MockProvider::new("gemini").queue(MockCall::text(HIGH_CONF)),
            MockProvider::new("claude"),
        );
        let (session, rx) = SseSession::channel();
        r.service
            .identify_streaming(
                &IdentifyInput::Text("Château Margaux 2019".into()),
                &AugmentationContext::default(),
                &caller(),
                &CancelToken::none(),
                &session,
            )
            .await;

        let frames = drain(rx);
        let names = events(&frames);
        assert!(!names.contains(&"refining"));
        assert_eq!(*names.last().unwrap(), "done");

        let result = frames.iter().find(|f| f.event == "result").unwrap();
        assert_eq!(result.data["action"], "auto_populate");
        assert_eq!(result.data["confidence"], 97);
        assert_eq!(result.data["escalation"]["path"].as_array().unwrap().len(), 1);

        // Only the tier-1 call was made
        assert_eq!(r.gemini.calls().len(), 1);
        assert!(r.claude.calls().is_empty());

        // field events precede result; last field is confidence
        let field_names: Vec<&str> = frames
            .iter()
            .filter(|f| f.event == "field")
            .map(|f| f.data["field"].as_str().unwrap())
            .collect();
        assert_eq!(*field_names.last().unwrap(), "confidence");
        assert!(field_names.contains(&"producer"));
    }

    // ── Scenario 2: medium confidence escalates and refines ───

    #[tokio::test]
    async fn test_mid_confidence_refines_via_tier1_5() {
        let r = rig(
            MockProvider::new("gemini")
                .queue(MockCall::text(MID_CONF))
                .queue(MockCall::text(REFINED)),
            MockProvider::new("claude"),
        );
        let (session, rx) = SseSession::channel();
        r.service
            .identify_streaming(
                &IdentifyInput::Text("Cloudy Bay Sauv Blanc".into()),
                &AugmentationContext::default(),
                &caller(),
                &CancelToken::none(),
                &session,
            )
            .await;

        let frames = drain(rx);
        let names = events(&frames);
        assert!(names.contains(&"result"));
        assert!(names.contains(&"refining"));
        assert!(names.contains(&"refined"));
        assert_eq!(*names.last().unwrap(), "done");

        let refining = frames.iter().find(|f| f.event == "refining").unwrap();
        assert_eq!(refining.data["tier1Confidence"], 72);

        let refined = frames.iter().find(|f| f.event == "refined").unwrap();
        assert_eq!(refined.data["escalated"], true);
        assert_eq!(refined.data["wineName"], "Te Koko");
        assert_eq!(refined.data["confidence"], 82);

        // Changed fields re-emitted between result and refined
        let result_idx = names.iter().position(|e| *e == "result").unwrap();
        let wine_name_updates: Vec<&SseFrame> = frames[result_idx..]
            .iter()
            .filter(|f| f.event == "field" && f.data["field"] == "wineName")
            .collect();
        assert_eq!(wine_name_updates.len(), 1);
        assert_eq!(wine_name_updates[0].data["value"], "Te Koko");

        // Tier 1.5 prompt carried prior context
        let calls = r.gemini.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].prompt.contains("Previous attempt"));
        assert!(calls[1].prompt.contains("confidence: 72%"));

        // 82 >= tier1_5 threshold (70): tier 2 never ran
        assert!(r.claude.calls().is_empty());
    }

    // ── Scenario 3: ambiguous producer-only ───────────────────

    #[tokio::test]
    async fn test_ambiguous_producer_only_disambiguates() {
        let penfolds = r#"{"producer":"Penfolds","confidence":38,"candidates":[{"wineName":"Grange","score":95},{"wineName":"Bin 389","score":80},{"wineName":"RWT","score":65}]}"#;
        // Escalation runs (38 < 85) but does not improve
        let r = rig(
            MockProvider::new("gemini")
                .queue(MockCall::text(penfolds))
                .queue(MockCall::text(penfolds)),
            MockProvider::new("claude").queue(MockCall::text(penfolds)),
        );
        let (session, rx) = SseSession::channel();
        r.service
            .identify_streaming(
                &IdentifyInput::Text("Penfolds".into()),
                &AugmentationContext::default(),
                &caller(),
                &CancelToken::none(),
                &session,
            )
            .await;

        let frames = drain(rx);
        let result = frames.iter().find(|f| f.event == "result").unwrap();
        assert_eq!(result.data["action"], "disambiguate");
        assert_eq!(result.data["candidates"].as_array().unwrap().len(), 3);

        let refined = frames.iter().find(|f| f.event == "refined").unwrap();
        assert_eq!(refined.data["escalated"], false);
        assert_eq!(*events(&frames).last().unwrap(), "done");
    }

    // ── Tier 2 advance ────────────────────────────────────────

    #[tokio::test]
    async fn test_tier2_runs_when_tier1_5_still_low() {
        let low = r#"{"producer":"Mystery","confidence":40}"#;
        let t15 = r#"{"producer":"Mystery","wineName":"Estate Red","confidence":55}"#;
        let t2 = r#"{"producer":"Mystery Creek","wineName":"Estate Red","vintage":"2018","confidence":78}"#;
        let r = rig(
            MockProvider::new("gemini")
                .queue(MockCall::text(low))
                .queue(MockCall::text(t15)),
            MockProvider::new("claude").queue(MockCall::text(t2)),
        );

        let outcome = r
            .service
            .identify(
                &IdentifyInput::Text("mystery red".into()),
                &AugmentationContext::default(),
                &caller(),
                &CancelToken::none(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.wine.confidence, 78);
        let tiers: Vec<&str> = outcome
            .escalation
            .path
            .iter()
            .map(|s| s.tier.as_str())
            .collect();
        assert_eq!(tiers, vec!["tier1", "tier1.5", "tier2"]);
        // Invariant: last path entry's confidence is the final confidence
        assert_eq!(
            outcome.escalation.path.last().unwrap().confidence,
            outcome.wine.confidence
        );
        assert_eq!(r.claude.calls().len(), 1);
        // Tier 2 was forced onto the balanced model via override
        assert_eq!(r.claude.calls()[0].model, "claude-3-5-sonnet-latest");
    }

    // ── Boundary: exactly at threshold, no escalation ─────────

    #[tokio::test]
    async fn test_confidence_at_threshold_does_not_escalate() {
        let at = r#"{"producer":"P","wineName":"W","vintage":"2019","confidence":85}"#;
        let r = rig(
            MockProvider::new("gemini").queue(MockCall::text(at)),
            MockProvider::new("claude"),
        );
        let outcome = r
            .service
            .identify(
                &IdentifyInput::Text("x".into()),
                &AugmentationContext::default(),
                &caller(),
                &CancelToken::none(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.escalation.path.len(), 1);
        assert_eq!(r.gemini.calls().len(), 1);
    }

    // ── Escalation failure degrades, never regresses ──────────

    #[tokio::test]
    async fn test_escalation_failure_keeps_tier1_result() {
        let r = rig(
            MockProvider::new("gemini")
                .queue(MockCall::text(MID_CONF))
                .queue(MockCall::error(ErrorKind::InvalidRequest, "bad schema")),
            MockProvider::new("claude"),
        );
        let (session, rx) = SseSession::channel();
        r.service
            .identify_streaming(
                &IdentifyInput::Text("Cloudy Bay".into()),
                &AugmentationContext::default(),
                &caller(),
                &CancelToken::none(),
                &session,
            )
            .await;

        let frames = drain(rx);
        let refined = frames.iter().find(|f| f.event == "refined").unwrap();
        assert_eq!(refined.data["escalated"], false);
        assert_eq!(refined.data["confidence"], 72);
        assert_eq!(refined.data["escalation"]["error"], "invalid_request");
        assert_eq!(*events(&frames).last().unwrap(), "done");
    }

    // ── Tier-1 terminal failure ───────────────────────────────

    #[tokio::test]
    async fn test_tier1_failure_emits_error_then_done() {
        let r = rig(
            MockProvider::new("gemini").queue(MockCall::error(ErrorKind::Overloaded, "503"))
                .queue(MockCall::error(ErrorKind::Overloaded, "503"))
                .queue(MockCall::error(ErrorKind::Overloaded, "503")),
            MockProvider::new("claude"),
        );
        let (session, rx) = SseSession::channel();
        r.service
            .identify_streaming(
                &IdentifyInput::Text("x".into()),
                &AugmentationContext::default(),
                &caller(),
                &CancelToken::none(),
                &session,
            )
            .await;

        let frames = drain(rx);
        let names = events(&frames);
        assert_eq!(names, vec!["error", "done"]);
        let error = &frames[0];
        assert_eq!(error.data["type"], "overloaded");
        assert_eq!(error.data["retryable"], true);
    }

    // ── Cancellation between result and escalation ────────────

    #[tokio::test]
    async fn test_cancel_skips_escalation() {
        let dir = tempfile::tempdir().unwrap();
        let reg = crate::cancel::CancelRegistry::new(dir.path()).unwrap();
        reg.cancel("req-9").unwrap();
        let token = reg.token(Some("req-9"));

        let r = rig(
            MockProvider::new("gemini").queue(MockCall::text(MID_CONF)),
            MockProvider::new("claude"),
        );
        let (session, rx) = SseSession::channel();
        r.service
            .identify_streaming(
                &IdentifyInput::Text("Cloudy Bay".into()),
                &AugmentationContext::default(),
                &caller(),
                &token,
                &session,
            )
            .await;

        let frames = drain(rx);
        assert_eq!(*events(&frames).last().unwrap(), "done");
        assert!(!events(&frames).contains(&"refining"));
        assert!(!events(&frames).contains(&"refined"));
        // Only the tier-1 call happened
        assert_eq!(r.gemini.calls().len(), 1);

        // Analytics still recorded best-effort
        assert_eq!(r.store.identification_rows().len(), 1);
    }

    // ── Locked fields survive escalation ──────────────────────

    #[tokio::test]
    async fn test_locked_fields_survive_refinement() {
        let drifted = r#"{"producer":"Cloudy Bay","wineName":"Te Koko","vintage":"2021","confidence":82}"#;
        let r = rig(
            MockProvider::new("gemini")
                .queue(MockCall::text(MID_CONF))
                .queue(MockCall::text(drifted)),
            MockProvider::new("claude"),
        );
        let mut locked = std::collections::BTreeMap::new();
        locked.insert("vintage".to_string(), json!("2022"));
        let aug = AugmentationContext::default().with_locked(locked);

        let outcome = r
            .service
            .identify(
                &IdentifyInput::Text("Cloudy Bay".into()),
                &aug,
                &caller(),
                &CancelToken::none(),
            )
            .await
            .unwrap();
        // Tier 1.5 said 2021, but the user confirmed 2022
        assert_eq!(outcome.wine.vintage.as_deref(), Some("2022"));
        assert_eq!(outcome.wine.wine_name.as_deref(), Some("Te Koko"));

        // The analytics row records the override actually applied
        let rows = r.store.identification_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].inferences_applied, json!(["locked:vintage"]));
    }

    // ── Tier 3 ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_opus_adopts_improvement() {
        let opus = r#"{"producer":"Screaming Eagle","wineName":"Cabernet Sauvignon","vintage":"2016","confidence":91}"#;
        let r = rig(
            MockProvider::new("gemini"),
            MockProvider::new("claude").queue(MockCall::text(opus)),
        );
        let prior = WineIdentification {
            producer: Some("Screaming Eagle".into()),
            confidence: 45,
            ..Default::default()
        };
        let outcome = r
            .service
            .identify_with_opus(
                &IdentifyInput::Text("cult napa cab".into()),
                prior,
                &AugmentationContext::default(),
                &caller(),
                &CancelToken::none(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.wine.confidence, 91);
        assert_eq!(outcome.escalation.path[0].tier, "tier3");
        assert_eq!(r.claude.calls()[0].model, "claude-3-opus-latest");
        assert!(r.gemini.calls().is_empty());
    }

    #[tokio::test]
    async fn test_opus_never_regresses() {
        let worse = r#"{"producer":"Unknown","confidence":30}"#;
        let r = rig(
            MockProvider::new("gemini"),
            MockProvider::new("claude").queue(MockCall::text(worse)),
        );
        let prior = WineIdentification {
            producer: Some("Screaming Eagle".into()),
            wine_name: Some("Cabernet Sauvignon".into()),
            confidence: 60,
            ..Default::default()
        };
        let outcome = r
            .service
            .identify_with_opus(
                &IdentifyInput::Text("cult napa cab".into()),
                prior.clone(),
                &AugmentationContext::default(),
                &caller(),
                &CancelToken::none(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.wine.confidence, 60);
        assert_eq!(outcome.wine.producer, prior.producer);
        assert_eq!(outcome.escalation.rejected.len(), 1);
        assert_eq!(
            outcome.escalation.path.last().unwrap().confidence,
            outcome.wine.confidence
        );
    }

    // ── Analytics ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_analytics_row_written_per_identification() {
        let r = rig(
            MockProvider::new("gemini").queue(MockCall::text(HIGH_CONF)),
            MockProvider::new("claude"),
        );
        r.service
            .identify(
                &IdentifyInput::Text("Château Margaux 2019".into()),
                &AugmentationContext::default(),
                &caller(),
                &CancelToken::none(),
            )
            .await
            .unwrap();

        let rows = r.store.identification_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].input_type, "text");
        assert_eq!(rows[0].final_confidence, 97);
        assert_eq!(rows[0].final_action, "auto_populate");
        assert_eq!(rows[0].final_tier, "tier1");
        assert_eq!(rows[0].identified_producer.as_deref(), Some("Château Margaux"));
        assert!(rows[0].input_hash.is_some());
        // No locked fields in play, so nothing was overridden
        assert_eq!(rows[0].inferences_applied, json!([]));

        // And exactly one usage row for the single LLM call
        assert_eq!(r.store.usage_rows().len(), 1);
    }
}
