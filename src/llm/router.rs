//! Single entry point for all LLM work.
//!
//! Resolves task routing, gates on daily limits and the circuit breaker,
//! runs the retry policy against the primary provider, falls back across
//! providers once, and emits a usage row for every terminal response.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::errors::ErrorKind;
use crate::providers::{
    claude::ClaudeProvider, gemini::GeminiProvider, Capability, CompletionOptions, FieldCallback,
    Provider, ProviderResponse, StreamingResponse,
};
use crate::store::AgentStore;
use crate::usage::{Caller, CostTracker};

use super::breaker::{CircuitBreaker, CircuitState};
use super::retry::RetryPolicy;

pub struct LlmClient {
    config: Arc<Config>,
    providers: HashMap<String, Arc<dyn Provider>>,
    tracker: CostTracker,
    store: Arc<dyn AgentStore>,
    retry: RetryPolicy,
}

impl LlmClient {
    pub fn new(
        config: Arc<Config>,
        providers: HashMap<String, Arc<dyn Provider>>,
        store: Arc<dyn AgentStore>,
    ) -> Self {
        Self {
            retry: RetryPolicy::new(config.retry),
            tracker: CostTracker::new(store.clone()),
            config,
            providers,
            store,
        }
    }

    /// Build real adapters for every enabled provider in the config.
    pub fn from_config(config: Arc<Config>, store: Arc<dyn AgentStore>) -> Self {
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        for (name, pcfg) in &config.providers {
            if !pcfg.enabled {
                continue;
            }
            match name.as_str() {
                "gemini" => {
                    providers.insert(name.clone(), Arc::new(GeminiProvider::new(pcfg)));
                }
                "claude" => {
                    providers.insert(name.clone(), Arc::new(ClaudeProvider::new(pcfg)));
                }
                other => tracing::warn!("unknown provider '{}' in config, skipping", other),
            }
        }
        Self::new(config, providers, store)
    }

    pub fn tracker(&self) -> &CostTracker {
        &self.tracker
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn provider(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    // ── Buffered dispatch ─────────────────────────────────────

    pub async fn complete(
        &self,
        task: &str,
        prompt: &str,
        options: CompletionOptions,
        caller: &Caller,
        cancel: &CancelToken,
    ) -> ProviderResponse {
        self.dispatch(task, prompt, None, options, caller, cancel)
            .await
    }

    pub async fn complete_with_image(
        &self,
        task: &str,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
        options: CompletionOptions,
        caller: &Caller,
        cancel: &CancelToken,
    ) -> ProviderResponse {
        self.dispatch(task, prompt, Some((image, mime_type)), options, caller, cancel)
            .await
    }

    async fn dispatch(
        &self,
        task: &str,
        prompt: &str,
        image: Option<(&[u8], &str)>,
        options: CompletionOptions,
        caller: &Caller,
        cancel: &CancelToken,
    ) -> ProviderResponse {
        if let Some(denied) = self.limit_gate(caller).await {
            return denied;
        }

        let (provider, eff, explicit) = match self.resolve(task, options) {
            Ok(r) => r,
            Err(resp) => return resp,
        };

        let breaker = self.breaker_for(provider.name());
        let state = breaker.state().await;
        if state == CircuitState::Open {
            return ProviderResponse::failure(
                provider.name(),
                &eff.model.clone().unwrap_or_else(|| provider.model()),
                ErrorKind::CircuitOpen,
                format!("circuit open for provider {}", provider.name()),
                0,
            );
        }

        let terminal = self
            .attempt_with_retry(provider.as_ref(), prompt, image, &eff, cancel, &breaker, state)
            .await;
        self.tracker.log(caller, task, &terminal).await;

        if terminal.success || !terminal.is_retryable_failure() || explicit {
            return terminal;
        }

        // Primary budget exhausted on a retryable kind: one fallback
        // attempt, no retry on it.
        let fallback = self
            .config
            .route(task)
            .and_then(|r| r.fallback.clone());
        let Some(fb) = fallback else {
            return terminal;
        };
        let Some(fb_provider) = self.providers.get(&fb.provider).cloned() else {
            return terminal;
        };

        let fb_breaker = self.breaker_for(&fb.provider);
        if fb_breaker.state().await == CircuitState::Open {
            return terminal;
        }

        tracing::info!(
            task,
            from = provider.name(),
            to = %fb.provider,
            "falling back after retryable failure"
        );
        let mut fb_options = eff.clone();
        fb_options.provider = Some(fb.provider.clone());
        fb_options.model = Some(fb.model.clone());
        let fb_resp = match image {
            None => fb_provider.complete(prompt, &fb_options, cancel).await,
            Some((bytes, mime)) => {
                fb_provider
                    .complete_with_image(prompt, bytes, mime, &fb_options, cancel)
                    .await
            }
        };
        self.tracker.log(caller, task, &fb_resp).await;
        fb_resp
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_with_retry(
        &self,
        provider: &dyn Provider,
        prompt: &str,
        image: Option<(&[u8], &str)>,
        options: &CompletionOptions,
        cancel: &CancelToken,
        breaker: &CircuitBreaker,
        state: CircuitState,
    ) -> ProviderResponse {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let resp = match image {
                None => provider.complete(prompt, options, cancel).await,
                Some((bytes, mime)) => {
                    provider
                        .complete_with_image(prompt, bytes, mime, options, cancel)
                        .await
                }
            };

            if resp.success {
                if state == CircuitState::HalfOpen {
                    breaker.record_success();
                }
                return resp;
            }
            if state == CircuitState::HalfOpen {
                breaker.record_failure();
            }
            if !resp.is_retryable_failure() || attempt >= self.retry.max_attempts() {
                return resp;
            }
            if cancel.is_cancelled() {
                return resp;
            }
            tracing::warn!(
                provider = provider.name(),
                attempt,
                max = self.retry.max_attempts(),
                kind = ?resp.error_kind,
                "retrying provider call"
            );
            self.retry.wait(attempt).await;
        }
    }

    // ── Streaming dispatch ────────────────────────────────────

    pub async fn stream_complete(
        &self,
        task: &str,
        prompt: &str,
        options: CompletionOptions,
        caller: &Caller,
        cancel: &CancelToken,
        on_field: FieldCallback<'_>,
    ) -> StreamingResponse {
        self.stream_dispatch(task, prompt, None, options, caller, cancel, on_field)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn stream_complete_with_image(
        &self,
        task: &str,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
        options: CompletionOptions,
        caller: &Caller,
        cancel: &CancelToken,
        on_field: FieldCallback<'_>,
    ) -> StreamingResponse {
        self.stream_dispatch(
            task,
            prompt,
            Some((image, mime_type)),
            options,
            caller,
            cancel,
            on_field,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_dispatch(
        &self,
        task: &str,
        prompt: &str,
        image: Option<(&[u8], &str)>,
        options: CompletionOptions,
        caller: &Caller,
        cancel: &CancelToken,
        on_field: FieldCallback<'_>,
    ) -> StreamingResponse {
        if let Some(denied) = self.limit_gate(caller).await {
            return StreamingResponse::not_streamed(denied);
        }

        let (provider, eff, _explicit) = match self.resolve(task, options) {
            Ok(r) => r,
            Err(resp) => return StreamingResponse::not_streamed(resp),
        };

        let breaker = self.breaker_for(provider.name());
        let state = breaker.state().await;
        if state == CircuitState::Open {
            return StreamingResponse::not_streamed(ProviderResponse::failure(
                provider.name(),
                &eff.model.clone().unwrap_or_else(|| provider.model()),
                ErrorKind::CircuitOpen,
                format!("circuit open for provider {}", provider.name()),
                0,
            ));
        }

        // No streaming capability: run buffered (with its normal retry)
        // and synthesize per-field progress so clients always see fields.
        if !provider.supports(Capability::Streaming) {
            let resp = self
                .attempt_with_retry(provider.as_ref(), prompt, image, &eff, cancel, &breaker, state)
                .await;
            self.tracker.log(caller, task, &resp).await;
            if resp.success {
                synthesize_fields(&resp.content, on_field);
            }
            return StreamingResponse::not_streamed(resp);
        }

        // Partial streams cannot safely be redone: one attempt, no retry.
        let sresp = match image {
            None => {
                provider
                    .stream_complete(prompt, &eff, cancel, on_field)
                    .await
            }
            Some((bytes, mime)) => {
                provider
                    .stream_complete_with_image(prompt, bytes, mime, &eff, cancel, on_field)
                    .await
            }
        };

        if state == CircuitState::HalfOpen {
            if sresp.response.success {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
        self.tracker.log(caller, task, &sresp.response).await;
        sresp
    }

    // ── Gates and resolution ──────────────────────────────────

    async fn limit_gate(&self, caller: &Caller) -> Option<ProviderResponse> {
        let violations = self
            .tracker
            .check_limits(caller, &self.config.limits)
            .await;
        if violations.is_empty() {
            return None;
        }
        Some(ProviderResponse::failure(
            "router",
            "-",
            ErrorKind::LimitExceeded,
            violations.join("; "),
            0,
        ))
    }

    /// Returns (provider, effective options, explicit-override flag).
    fn resolve(
        &self,
        task: &str,
        mut options: CompletionOptions,
    ) -> Result<(Arc<dyn Provider>, CompletionOptions, bool), ProviderResponse> {
        let (name, explicit) = match &options.provider {
            // A higher tier picked the provider: used verbatim, no
            // routing fallback applies.
            Some(p) => (p.clone(), true),
            None => {
                let route = self.config.route(task).ok_or_else(|| {
                    ProviderResponse::failure(
                        "router",
                        "-",
                        ErrorKind::InvalidRequest,
                        format!("no routing configured for task '{task}'"),
                        0,
                    )
                })?;
                if options.model.is_none() {
                    options.model = Some(route.primary.model.clone());
                }
                (route.primary.provider.clone(), false)
            }
        };

        let provider = self.providers.get(&name).cloned().ok_or_else(|| {
            ProviderResponse::failure(
                &name,
                "-",
                ErrorKind::ProviderUnavailable,
                format!("provider '{name}' is not configured"),
                0,
            )
        })?;

        Ok((provider, options, explicit))
    }

    fn breaker_for(&self, provider: &str) -> CircuitBreaker {
        CircuitBreaker::new(provider, self.config.circuit_breaker, self.store.clone())
    }
}

/// Replay the top-level entries of a buffered result as field callbacks,
/// in deterministic (sorted) order.
fn synthesize_fields(content: &str, on_field: FieldCallback<'_>) {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(content) {
        for (name, value) in &map {
            on_field(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RouteTarget, TaskRoute};
    use crate::providers::mock::{MockCall, MockProvider};
    use crate::store::memory::MemoryStore;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.retry.base_delay_ms = 1;
        cfg.retry.max_delay_ms = 2;
        cfg.task_routing.insert(
            "identify_text".into(),
            TaskRoute {
                primary: RouteTarget {
                    provider: "gemini".into(),
                    model: "gemini-mock-model".into(),
                },
                fallback: Some(RouteTarget {
                    provider: "claude".into(),
                    model: "claude-mock-model".into(),
                }),
            },
        );
        cfg
    }

    struct Rig {
        client: LlmClient,
        gemini: Arc<MockProvider>,
        claude: Arc<MockProvider>,
        store: Arc<MemoryStore>,
    }

    fn rig_with(gemini: MockProvider, claude: MockProvider) -> Rig {
        let store = Arc::new(MemoryStore::new());
        let gemini = Arc::new(gemini);
        let claude = Arc::new(claude);
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        providers.insert("gemini".into(), gemini.clone());
        providers.insert("claude".into(), claude.clone());
        let client = LlmClient::new(Arc::new(test_config()), providers, store.clone());
        Rig {
            client,
            gemini,
            claude,
            store,
        }
    }

    fn caller() -> Caller {
        Caller::new("u1", None)
    }

    #[tokio::test]
    async fn test_success_logs_one_usage_row() {
        let rig = rig_with(
            MockProvider::new("gemini").queue(MockCall::text(r#"{"ok":true}"#)),
            MockProvider::new("claude"),
        );
        let resp = rig
            .client
            .complete(
                "identify_text",
                "p",
                CompletionOptions::default(),
                &caller(),
                &CancelToken::none(),
            )
            .await;
        assert!(resp.success);
        assert_eq!(rig.store.usage_rows().len(), 1);
        assert_eq!(rig.gemini.calls().len(), 1);
        assert!(rig.claude.calls().is_empty());
    }

    #[tokio::test]
    async fn test_retry_then_success_stays_on_primary() {
        let rig = rig_with(
            MockProvider::new("gemini")
                .queue(MockCall::error(ErrorKind::ServerError, "boom"))
                .queue(MockCall::text(r#"{"ok":true}"#)),
            MockProvider::new("claude"),
        );
        let resp = rig
            .client
            .complete(
                "identify_text",
                "p",
                CompletionOptions::default(),
                &caller(),
                &CancelToken::none(),
            )
            .await;
        assert!(resp.success);
        assert_eq!(rig.gemini.calls().len(), 2);
        assert!(rig.claude.calls().is_empty());
        // Only the terminal response is logged
        assert_eq!(rig.store.usage_rows().len(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast_no_fallback() {
        let rig = rig_with(
            MockProvider::new("gemini").queue(MockCall::error(ErrorKind::InvalidRequest, "bad")),
            MockProvider::new("claude").queue(MockCall::text("{}")),
        );
        let resp = rig
            .client
            .complete(
                "identify_text",
                "p",
                CompletionOptions::default(),
                &caller(),
                &CancelToken::none(),
            )
            .await;
        assert!(!resp.success);
        assert_eq!(resp.error_kind, Some(ErrorKind::InvalidRequest));
        assert_eq!(rig.gemini.calls().len(), 1);
        assert!(rig.claude.calls().is_empty());
    }

    #[tokio::test]
    async fn test_retry_exhaustion_falls_back_once() {
        let gemini = MockProvider::new("gemini")
            .queue(MockCall::error(ErrorKind::Overloaded, "503"))
            .queue(MockCall::error(ErrorKind::Overloaded, "503"))
            .queue(MockCall::error(ErrorKind::Overloaded, "503"));
        let claude = MockProvider::new("claude").queue(MockCall::text(r#"{"from":"claude"}"#));
        let rig = rig_with(gemini, claude);

        let resp = rig
            .client
            .complete(
                "identify_text",
                "p",
                CompletionOptions::default(),
                &caller(),
                &CancelToken::none(),
            )
            .await;
        assert!(resp.success);
        assert_eq!(resp.provider, "claude");
        // max_attempts on primary, exactly one on fallback
        assert_eq!(rig.gemini.calls().len(), 3);
        assert_eq!(rig.claude.calls().len(), 1);
        // Terminal primary failure and fallback success both logged
        let rows = rig.store.usage_rows();
        assert_eq!(rows.len(), 2);
        assert!(!rows[0].success);
        assert!(rows[1].success);
    }

    #[tokio::test]
    async fn test_explicit_provider_override_skips_fallback() {
        let rig = rig_with(
            MockProvider::new("gemini"),
            MockProvider::new("claude")
                .queue(MockCall::error(ErrorKind::Overloaded, "503"))
                .queue(MockCall::error(ErrorKind::Overloaded, "503"))
                .queue(MockCall::error(ErrorKind::Overloaded, "503")),
        );
        let options = CompletionOptions {
            provider: Some("claude".into()),
            model: Some("claude-3-opus-latest".into()),
            ..Default::default()
        };
        let resp = rig
            .client
            .complete("identify_text", "p", options, &caller(), &CancelToken::none())
            .await;
        assert!(!resp.success);
        assert_eq!(resp.provider, "claude");
        assert!(rig.gemini.calls().is_empty());
        assert_eq!(rig.claude.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_limit_exceeded_never_touches_provider() {
        let mut cfg = test_config();
        cfg.limits.daily_requests = 1;
        let store = Arc::new(MemoryStore::new());
        let gemini = Arc::new(MockProvider::new("gemini").queue(MockCall::text("{}")));
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        providers.insert("gemini".into(), gemini.clone());
        let client = LlmClient::new(Arc::new(cfg), providers, store.clone());

        // Burn the day's single request
        let first = client
            .complete(
                "identify_text",
                "p",
                CompletionOptions::default(),
                &caller(),
                &CancelToken::none(),
            )
            .await;
        assert!(first.success);

        let second = client
            .complete(
                "identify_text",
                "p",
                CompletionOptions::default(),
                &caller(),
                &CancelToken::none(),
            )
            .await;
        assert!(!second.success);
        assert_eq!(second.error_kind, Some(ErrorKind::LimitExceeded));
        assert_eq!(gemini.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_returns_without_provider_call() {
        let rig = rig_with(
            MockProvider::new("gemini").queue(MockCall::text("{}")),
            MockProvider::new("claude"),
        );
        // Seed enough recent retryable failures to open the circuit
        for _ in 0..5 {
            rig.store
                .insert_usage(&crate::store::UsageRow {
                    user_id: "u1".into(),
                    session_id: None,
                    provider: "gemini".into(),
                    model: "m".into(),
                    task_type: "identify_text".into(),
                    input_tokens: 0,
                    output_tokens: 0,
                    cost_usd: Decimal::ZERO,
                    latency_ms: 1,
                    success: false,
                    error_type: Some("overloaded".into()),
                    error_message: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let resp = rig
            .client
            .complete(
                "identify_text",
                "p",
                CompletionOptions::default(),
                &caller(),
                &CancelToken::none(),
            )
            .await;
        assert!(!resp.success);
        assert_eq!(resp.error_kind, Some(ErrorKind::CircuitOpen));
        assert!(rig.gemini.calls().is_empty());
    }

    #[tokio::test]
    async fn test_streaming_is_never_retried() {
        let rig = rig_with(
            MockProvider::new("gemini")
                .queue(MockCall::error(ErrorKind::ServerError, "mid-stream"))
                .queue(MockCall::text("{}")),
            MockProvider::new("claude"),
        );
        let mut fields = Vec::new();
        let mut on_field = |n: &str, v: &Value| fields.push((n.to_string(), v.clone()));
        let resp = rig
            .client
            .stream_complete(
                "identify_text",
                "p",
                CompletionOptions::default(),
                &caller(),
                &CancelToken::none(),
                &mut on_field,
            )
            .await;
        assert!(!resp.response.success);
        assert_eq!(rig.gemini.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_streaming_fallback_synthesizes_fields() {
        let rig = rig_with(
            MockProvider::new("gemini")
                .without_streaming()
                .queue(MockCall::text(r#"{"producer":"Guigal","vintage":"2019"}"#)),
            MockProvider::new("claude"),
        );
        let mut fields = Vec::new();
        let mut on_field = |n: &str, v: &Value| fields.push((n.to_string(), v.clone()));
        let resp = rig
            .client
            .stream_complete(
                "identify_text",
                "p",
                CompletionOptions::default(),
                &caller(),
                &CancelToken::none(),
                &mut on_field,
            )
            .await;
        assert!(resp.response.success);
        assert!(!resp.streamed);
        // Deterministic (sorted) synthesis order
        assert_eq!(fields[0].0, "producer");
        assert_eq!(fields[1].0, "vintage");
    }

    #[tokio::test]
    async fn test_unknown_task_is_invalid_request() {
        let rig = rig_with(MockProvider::new("gemini"), MockProvider::new("claude"));
        let resp = rig
            .client
            .complete(
                "juggle",
                "p",
                CompletionOptions::default(),
                &caller(),
                &CancelToken::none(),
            )
            .await;
        assert_eq!(resp.error_kind, Some(ErrorKind::InvalidRequest));
    }
}
