//! Claude adapter.
//!
//! Speaks the Anthropic `/v1/messages` API, buffered and streaming. The
//! API key travels only in the `x-api-key` header.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::cancel::CancelToken;
use crate::config::{ModelCaps, ProviderConfig};
use crate::errors::ErrorKind;
use crate::stream::{FieldDetector, SseParser};

use super::{
    await_with_cancel, pricing, select_json_part, Capability, CompletionOptions, FieldCallback,
    Provider, ProviderResponse, StreamingResponse, ThinkingLevel, ToolSpec, WaitOutcome,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct ClaudeProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: RwLock<String>,
    fallback_model: Option<String>,
    caps: BTreeMap<String, ModelCaps>,
    default_timeout: Duration,
}

impl ClaudeProvider {
    pub fn new(cfg: &ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: cfg.api_key.clone(),
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: RwLock::new(cfg.default_model.clone()),
            fallback_model: cfg.fallback_model.clone(),
            caps: cfg.models.clone(),
            default_timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }

    fn caps_for(&self, model: &str) -> ModelCaps {
        self.caps.get(model).copied().unwrap_or_default()
    }

    fn resolve_model(&self, options: &CompletionOptions) -> String {
        options
            .model
            .clone()
            .unwrap_or_else(|| self.model.read().unwrap().clone())
    }

    fn timeout_for(&self, options: &CompletionOptions) -> Duration {
        options
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    fn build_body(
        &self,
        prompt: &str,
        image: Option<(&[u8], &str)>,
        options: &CompletionOptions,
        model: &str,
        stream: bool,
    ) -> Value {
        let mut content = Vec::new();
        if let Some((bytes, mime)) = image {
            content.push(json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": mime,
                    "data": base64::engine::general_purpose::STANDARD.encode(bytes),
                }
            }));
        }
        content.push(json!({ "type": "text", "text": prompt }));

        let mut body = json!({
            "model": model,
            "max_tokens": options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": [{ "role": "user", "content": content }],
        });
        if let Some(t) = options.temperature {
            body["temperature"] = json!(t);
        }
        if stream {
            body["stream"] = json!(true);
        }
        // Extended thinking only for models advertising the capability;
        // dropped silently elsewhere. json_response / response_schema have
        // no native binding here — the prompt carries the structure.
        if let Some(level) = options.thinking_level {
            if self.caps_for(model).supports_thinking {
                body["thinking"] = json!({
                    "type": "enabled",
                    "budget_tokens": thinking_budget(level),
                });
            }
        }

        let functions: Vec<Value> = options
            .tools
            .iter()
            .filter_map(|t| match t {
                ToolSpec::Function(decl) => Some(decl.clone()),
                // Grounded retrieval is a capability this family does not
                // advertise; the sentinel is dropped, not an error.
                ToolSpec::GoogleSearch => None,
            })
            .collect();
        if !functions.is_empty() {
            body["tools"] = json!(functions);
        }

        body
    }

    async fn buffered(
        &self,
        prompt: &str,
        image: Option<(&[u8], &str)>,
        options: &CompletionOptions,
        cancel: &CancelToken,
    ) -> ProviderResponse {
        let model = self.resolve_model(options);
        let first = self
            .buffered_once(prompt, image, options, cancel, &model)
            .await;

        if !first.success {
            if let Some(sibling) = self.fallback_model.as_deref() {
                let unavailable = matches!(
                    first.error_kind,
                    Some(ErrorKind::Overloaded) | Some(ErrorKind::UnknownError)
                );
                if unavailable && sibling != model {
                    let mut demoted = options.clone();
                    demoted.thinking_level = None;
                    tracing::warn!(
                        from = %model,
                        to = %sibling,
                        "claude model unavailable, trying sibling"
                    );
                    return self
                        .buffered_once(prompt, image, &demoted, cancel, sibling)
                        .await;
                }
            }
        }
        first
    }

    async fn buffered_once(
        &self,
        prompt: &str,
        image: Option<(&[u8], &str)>,
        options: &CompletionOptions,
        cancel: &CancelToken,
        model: &str,
    ) -> ProviderResponse {
        let start = Instant::now();
        let body = self.build_body(prompt, image, options, model, false);
        let url = format!("{}/v1/messages", self.base_url);

        let fut = async {
            let resp = self
                .client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await?;
            let status = resp.status().as_u16();
            let text = resp.text().await?;
            Ok::<(u16, String), reqwest::Error>((status, text))
        };

        let (status, text) = match await_with_cancel(fut, cancel, self.timeout_for(options)).await {
            WaitOutcome::Done(Ok(pair)) => pair,
            WaitOutcome::Done(Err(e)) => {
                return ProviderResponse::failure(
                    "claude",
                    model,
                    ErrorKind::from_transport(&e),
                    e.to_string(),
                    start.elapsed().as_millis() as u64,
                );
            }
            WaitOutcome::Cancelled => {
                return ProviderResponse::failure(
                    "claude",
                    model,
                    ErrorKind::Timeout,
                    "request cancelled by client",
                    start.elapsed().as_millis() as u64,
                );
            }
            WaitOutcome::TimedOut => {
                return ProviderResponse::failure(
                    "claude",
                    model,
                    ErrorKind::Timeout,
                    "provider call exceeded wall-clock budget",
                    start.elapsed().as_millis() as u64,
                );
            }
        };

        let latency_ms = start.elapsed().as_millis() as u64;

        if !(200..300).contains(&status) {
            let kind = if status == 404 {
                ErrorKind::UnknownError
            } else {
                ErrorKind::from_status(status, &text)
            };
            return ProviderResponse::failure(
                "claude",
                model,
                kind,
                format!("claude returned {status}"),
                latency_ms,
            );
        }

        let payload: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                return ProviderResponse::failure(
                    "claude",
                    model,
                    ErrorKind::InvalidResponse,
                    format!("unparseable response body: {e}"),
                    latency_ms,
                );
            }
        };

        let parts: Vec<String> = payload["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"] == "text")
                    .filter_map(|b| b["text"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let content = match select_json_part(&parts) {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => {
                return ProviderResponse::failure(
                    "claude",
                    model,
                    ErrorKind::InvalidResponse,
                    "empty content in response",
                    latency_ms,
                );
            }
        };

        let input_tokens = payload["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
        let output_tokens = payload["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32;

        ProviderResponse {
            success: true,
            content,
            input_tokens,
            output_tokens,
            cost_usd: pricing::cost_usd("claude", model, input_tokens, output_tokens),
            latency_ms,
            provider: "claude".into(),
            model: model.to_string(),
            error: None,
            error_kind: None,
        }
    }

    async fn streamed(
        &self,
        prompt: &str,
        image: Option<(&[u8], &str)>,
        options: &CompletionOptions,
        cancel: &CancelToken,
        on_field: FieldCallback<'_>,
    ) -> StreamingResponse {
        let model = self.resolve_model(options);
        let start = Instant::now();
        let body = self.build_body(prompt, image, options, &model, true);
        let url = format!("{}/v1/messages", self.base_url);
        let budget = self.timeout_for(options);

        let send = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send();

        let resp = match await_with_cancel(send, cancel, budget).await {
            WaitOutcome::Done(Ok(r)) => r,
            WaitOutcome::Done(Err(e)) => {
                return StreamingResponse::not_streamed(ProviderResponse::failure(
                    "claude",
                    &model,
                    ErrorKind::from_transport(&e),
                    e.to_string(),
                    start.elapsed().as_millis() as u64,
                ));
            }
            WaitOutcome::Cancelled | WaitOutcome::TimedOut => {
                return StreamingResponse::not_streamed(ProviderResponse::failure(
                    "claude",
                    &model,
                    ErrorKind::Timeout,
                    "stream setup exceeded budget",
                    start.elapsed().as_millis() as u64,
                ));
            }
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return StreamingResponse::not_streamed(ProviderResponse::failure(
                "claude",
                &model,
                ErrorKind::from_status(status, &text),
                format!("claude returned {status}"),
                start.elapsed().as_millis() as u64,
            ));
        }

        let mut stream = resp.bytes_stream();
        let mut parser = SseParser::new();
        let mut detector = FieldDetector::new();
        let mut field_timings = BTreeMap::new();
        let mut ttfb_ms: Option<u64> = None;
        let mut input_tokens = 0u32;
        let mut output_tokens = 0u32;
        let mut cancelled = false;
        let mut stream_error: Option<String> = None;

        'read: loop {
            if start.elapsed() >= budget {
                stream_error = Some("stream exceeded wall-clock budget".into());
                break;
            }
            let next = tokio::time::timeout(Duration::from_secs(1), stream.next()).await;
            match next {
                Err(_) => {
                    if cancel.is_cancelled() {
                        cancelled = true;
                        break 'read;
                    }
                }
                Ok(None) => break 'read,
                Ok(Some(Err(e))) => {
                    stream_error = Some(e.to_string());
                    break 'read;
                }
                Ok(Some(Ok(bytes))) => {
                    if cancel.is_cancelled() {
                        cancelled = true;
                        break 'read;
                    }
                    for event in parser.feed(&bytes) {
                        match event["type"].as_str() {
                            Some("message_start") => {
                                if let Some(it) =
                                    event["message"]["usage"]["input_tokens"].as_u64()
                                {
                                    input_tokens = it as u32;
                                }
                            }
                            Some("content_block_delta") => {
                                if let Some(text) = event["delta"]["text"].as_str() {
                                    if ttfb_ms.is_none() && !text.is_empty() {
                                        ttfb_ms = Some(start.elapsed().as_millis() as u64);
                                    }
                                    for (name, value) in detector.feed(text) {
                                        let at = start.elapsed().as_millis() as u64;
                                        field_timings.entry(name.clone()).or_insert(at);
                                        on_field(&name, &value);
                                    }
                                }
                            }
                            Some("message_delta") => {
                                if let Some(out) = event["usage"]["output_tokens"].as_u64() {
                                    output_tokens = out as u32;
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        if !cancelled {
            for (name, value) in detector.finish() {
                let at = start.elapsed().as_millis() as u64;
                field_timings.entry(name.clone()).or_insert(at);
                on_field(&name, &value);
            }
        }

        let latency_ms = start.elapsed().as_millis() as u64;
        let content = detector.buffer().to_string();
        let emitted_any = !detector.emitted().is_empty();

        let response = if let Some(err) = stream_error.filter(|_| !emitted_any) {
            ProviderResponse::failure("claude", &model, ErrorKind::ServerError, err, latency_ms)
        } else {
            ProviderResponse {
                success: true,
                content,
                input_tokens,
                output_tokens,
                cost_usd: pricing::cost_usd("claude", &model, input_tokens, output_tokens),
                latency_ms,
                provider: "claude".into(),
                model,
                error: None,
                error_kind: None,
            }
        };

        StreamingResponse {
            response,
            streamed: true,
            ttfb_ms,
            field_timings,
        }
    }
}

fn thinking_budget(level: ThinkingLevel) -> u32 {
    match level {
        ThinkingLevel::Minimal => 1024,
        ThinkingLevel::Low => 2048,
        ThinkingLevel::Medium => 8192,
        ThinkingLevel::High => 16384,
    }
}

#[async_trait]
impl Provider for ClaudeProvider {
    fn name(&self) -> &str {
        "claude"
    }

    fn model(&self) -> String {
        self.model.read().unwrap().clone()
    }

    fn set_model(&self, model: &str) {
        *self.model.write().unwrap() = model.to_string();
    }

    fn supports(&self, cap: Capability) -> bool {
        let caps = self.caps_for(&self.model());
        match cap {
            Capability::Vision => caps.supports_vision,
            Capability::Tools => caps.supports_tools,
            Capability::Grounding => caps.supports_grounding,
            Capability::Thinking => caps.supports_thinking,
            Capability::Streaming => true,
        }
    }

    async fn is_healthy(&self) -> bool {
        let url = format!("{}/v1/models", self.base_url);
        self.client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        cancel: &CancelToken,
    ) -> ProviderResponse {
        self.buffered(prompt, None, options, cancel).await
    }

    async fn complete_with_image(
        &self,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
        options: &CompletionOptions,
        cancel: &CancelToken,
    ) -> ProviderResponse {
        self.buffered(prompt, Some((image, mime_type)), options, cancel)
            .await
    }

    async fn stream_complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        cancel: &CancelToken,
        on_field: FieldCallback<'_>,
    ) -> StreamingResponse {
        self.streamed(prompt, None, options, cancel, on_field).await
    }

    async fn stream_complete_with_image(
        &self,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
        options: &CompletionOptions,
        cancel: &CancelToken,
        on_field: FieldCallback<'_>,
    ) -> StreamingResponse {
        self.streamed(prompt, Some((image, mime_type)), options, cancel, on_field)
            .await
    }
}
