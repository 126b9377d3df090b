//! Gemini adapter.
//!
//! Speaks the `generateContent` / `streamGenerateContent?alt=sse` API.
//! The API key travels only in the `x-goog-api-key` header, never in the
//! URL or logs.

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

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: RwLock<String>,
    fallback_model: Option<String>,
    caps: BTreeMap<String, ModelCaps>,
    default_timeout: Duration,
}

impl GeminiProvider {
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
    ) -> Value {
        let mut parts = vec![json!({ "text": prompt })];
        if let Some((bytes, mime)) = image {
            parts.push(json!({
                "inline_data": {
                    "mime_type": mime,
                    "data": base64::engine::general_purpose::STANDARD.encode(bytes),
                }
            }));
        }

        let mut generation = serde_json::Map::new();
        if let Some(max) = options.max_tokens {
            generation.insert("maxOutputTokens".into(), json!(max));
        }
        if let Some(t) = options.temperature {
            generation.insert("temperature".into(), json!(t));
        }
        if options.json_response {
            generation.insert("responseMimeType".into(), json!("application/json"));
        }
        if let Some(schema) = &options.response_schema {
            generation.insert("responseMimeType".into(), json!("application/json"));
            generation.insert("responseSchema".into(), schema.clone());
        }
        // Thinking is a capability, not a keyword: dropped silently when
        // the resolved model does not advertise it.
        if let Some(level) = options.thinking_level {
            if self.caps_for(model).supports_thinking {
                generation.insert(
                    "thinkingConfig".into(),
                    json!({ "thinkingBudget": thinking_budget(level) }),
                );
            }
        }

        let mut body = json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": Value::Object(generation),
        });

        let mut tools = Vec::new();
        let mut declarations = Vec::new();
        for tool in &options.tools {
            match tool {
                ToolSpec::GoogleSearch => {
                    if self.caps_for(model).supports_grounding {
                        tools.push(json!({ "google_search": {} }));
                    }
                }
                ToolSpec::Function(decl) => declarations.push(decl.clone()),
            }
        }
        if !declarations.is_empty() {
            tools.push(json!({ "function_declarations": declarations }));
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
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

        // Single-shot sibling fallback on 503/404 for the requested
        // model. Not a retry: one attempt, thinking dropped.
        if !first.success {
            if let Some(sibling) = self.fallback_model.as_deref() {
                let overloaded = matches!(
                    first.error_kind,
                    Some(ErrorKind::Overloaded) | Some(ErrorKind::UnknownError)
                );
                if overloaded && sibling != model {
                    let mut demoted = options.clone();
                    demoted.thinking_level = None;
                    tracing::warn!(
                        from = %model,
                        to = %sibling,
                        "gemini model unavailable, trying sibling"
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
        let body = self.build_body(prompt, image, options, model);
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, model);

        let fut = async {
            let resp = self
                .client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
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
                    "gemini",
                    model,
                    ErrorKind::from_transport(&e),
                    e.to_string(),
                    start.elapsed().as_millis() as u64,
                );
            }
            WaitOutcome::Cancelled => {
                return ProviderResponse::failure(
                    "gemini",
                    model,
                    ErrorKind::Timeout,
                    "request cancelled by client",
                    start.elapsed().as_millis() as u64,
                );
            }
            WaitOutcome::TimedOut => {
                return ProviderResponse::failure(
                    "gemini",
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
                // Surfaced as unknown so the sibling fallback can fire.
                ErrorKind::UnknownError
            } else {
                ErrorKind::from_status(status, &text)
            };
            return ProviderResponse::failure(
                "gemini",
                model,
                kind,
                format!("gemini returned {status}"),
                latency_ms,
            );
        }

        let payload: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                return ProviderResponse::failure(
                    "gemini",
                    model,
                    ErrorKind::InvalidResponse,
                    format!("unparseable response body: {e}"),
                    latency_ms,
                );
            }
        };

        let parts = extract_parts(&payload);
        let content = match select_json_part(&parts) {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => {
                return ProviderResponse::failure(
                    "gemini",
                    model,
                    ErrorKind::InvalidResponse,
                    "empty content in response",
                    latency_ms,
                );
            }
        };

        let (input_tokens, output_tokens) = extract_usage(&payload);
        ProviderResponse {
            success: true,
            content,
            input_tokens,
            output_tokens,
            cost_usd: pricing::cost_usd("gemini", model, input_tokens, output_tokens),
            latency_ms,
            provider: "gemini".into(),
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
        let body = self.build_body(prompt, image, options, &model);
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, model
        );
        let budget = self.timeout_for(options);

        let send = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send();

        let resp = match await_with_cancel(send, cancel, budget).await {
            WaitOutcome::Done(Ok(r)) => r,
            WaitOutcome::Done(Err(e)) => {
                return StreamingResponse::not_streamed(ProviderResponse::failure(
                    "gemini",
                    &model,
                    ErrorKind::from_transport(&e),
                    e.to_string(),
                    start.elapsed().as_millis() as u64,
                ));
            }
            WaitOutcome::Cancelled | WaitOutcome::TimedOut => {
                return StreamingResponse::not_streamed(ProviderResponse::failure(
                    "gemini",
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
                "gemini",
                &model,
                ErrorKind::from_status(status, &text),
                format!("gemini returned {status}"),
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
            // Block on the socket at most 1 s per slice so the cancel
            // token is observed with bounded latency.
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
                    let payloads = parser.feed(&bytes);
                    for payload in payloads {
                        if let Some((inp, out)) = chunk_usage(&payload) {
                            input_tokens = inp;
                            output_tokens = out;
                        }
                        for text in chunk_texts(&payload) {
                            if ttfb_ms.is_none() && !text.is_empty() {
                                ttfb_ms = Some(start.elapsed().as_millis() as u64);
                            }
                            for (name, value) in detector.feed(&text) {
                                let at = start.elapsed().as_millis() as u64;
                                field_timings.entry(name.clone()).or_insert(at);
                                on_field(&name, &value);
                            }
                        }
                    }
                }
            }
        }

        if !cancelled && stream_error.is_none() {
            if let Some(payload) = parser.flush() {
                for text in chunk_texts(&payload) {
                    for (name, value) in detector.feed(&text) {
                        let at = start.elapsed().as_millis() as u64;
                        field_timings.entry(name.clone()).or_insert(at);
                        on_field(&name, &value);
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

        // A failure after the first emitted field degrades to a partial
        // result; the fields already shown stay valid.
        let response = if let Some(err) = stream_error.filter(|_| !emitted_any) {
            ProviderResponse::failure("gemini", &model, ErrorKind::ServerError, err, latency_ms)
        } else {
            ProviderResponse {
                success: true,
                content,
                input_tokens,
                output_tokens,
                cost_usd: pricing::cost_usd("gemini", &model, input_tokens, output_tokens),
                latency_ms,
                provider: "gemini".into(),
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
        ThinkingLevel::Minimal => 0,
        ThinkingLevel::Low => 1024,
        ThinkingLevel::Medium => 4096,
        ThinkingLevel::High => 8192,
    }
}

fn extract_parts(payload: &Value) -> Vec<String> {
    payload["candidates"][0]["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn extract_usage(payload: &Value) -> (u32, u32) {
    let meta = &payload["usageMetadata"];
    (
        meta["promptTokenCount"].as_u64().unwrap_or(0) as u32,
        meta["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
    )
}

fn chunk_usage(payload: &Value) -> Option<(u32, u32)> {
    let meta = payload.get("usageMetadata")?;
    Some((
        meta["promptTokenCount"].as_u64().unwrap_or(0) as u32,
        meta["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
    ))
}

fn chunk_texts(payload: &Value) -> Vec<String> {
    extract_parts(payload)
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
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
        let url = format!("{}/v1beta/models", self.base_url);
        self.client
            .get(&url)
            .header("x-goog-api-key", &self.api_key)
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

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> GeminiProvider {
        let mut cfg = ProviderConfig {
            api_key: "test-key".into(),
            default_model: "gemini-2.0-flash".into(),
            base_url: Some(server.uri()),
            fallback_model: Some("gemini-2.0-flash-lite".into()),
            timeout_secs: 10,
            ..Default::default()
        };
        cfg.models.insert(
            "gemini-2.0-flash".into(),
            ModelCaps {
                supports_vision: true,
                supports_tools: true,
                supports_grounding: true,
                supports_thinking: true,
            },
        );
        GeminiProvider::new(&cfg)
    }

    fn success_body(text: &str) -> Value {
        json!({
            "candidates": [{ "content": { "parts": [{ "text": text }] } }],
            "usageMetadata": { "promptTokenCount": 100, "candidatesTokenCount": 40 }
        })
    }

    #[tokio::test]
    async fn test_complete_success_with_usage_and_cost() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
            .and(header("x-goog-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body(
                r#"{"producer":"Penfolds","confidence":90}"#,
            )))
            .mount(&server)
            .await;

        let p = provider_for(&server);
        let resp = p
            .complete("identify", &CompletionOptions::default(), &CancelToken::none())
            .await;

        assert!(resp.success);
        assert_eq!(resp.input_tokens, 100);
        assert_eq!(resp.output_tokens, 40);
        assert!(resp.cost_usd > rust_decimal::Decimal::ZERO);
        assert!(resp.content.contains("Penfolds"));
    }

    #[tokio::test]
    async fn test_complete_classifies_429() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let p = provider_for(&server);
        let resp = p
            .complete("x", &CompletionOptions::default(), &CancelToken::none())
            .await;
        assert!(!resp.success);
        assert_eq!(resp.error_kind, Some(ErrorKind::RateLimit));
    }

    #[tokio::test]
    async fn test_503_falls_back_to_sibling_model_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:generateContent"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash-lite:generateContent"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(success_body(r#"{"ok":true}"#)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let p = provider_for(&server);
        let resp = p
            .complete("x", &CompletionOptions::default(), &CancelToken::none())
            .await;
        assert!(resp.success);
        assert_eq!(resp.model, "gemini-2.0-flash-lite");
    }

    #[tokio::test]
    async fn test_empty_content_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{ "content": { "parts": [] } }]
            })))
            .mount(&server)
            .await;

        let p = provider_for(&server);
        let resp = p
            .complete("x", &CompletionOptions::default(), &CancelToken::none())
            .await;
        assert!(!resp.success);
        assert_eq!(resp.error_kind, Some(ErrorKind::InvalidResponse));
    }

    #[tokio::test]
    async fn test_multi_part_selects_json_part() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{ "content": { "parts": [
                    { "text": "Considering the label..." },
                    { "text": r#"{"producer":"Guigal"}"# }
                ] } }]
            })))
            .mount(&server)
            .await;

        let p = provider_for(&server);
        let resp = p
            .complete("x", &CompletionOptions::default(), &CancelToken::none())
            .await;
        assert!(resp.success);
        assert_eq!(resp.content, r#"{"producer":"Guigal"}"#);
    }

    #[tokio::test]
    async fn test_stream_emits_fields_and_ttfb() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"{\\\"producer\\\": \\\"Cloudy\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\" Bay\\\", \\\"confidence\\\": 72}\"}]}}],\"usageMetadata\":{\"promptTokenCount\":50,\"candidatesTokenCount\":20}}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash:streamGenerateContent"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(sse, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let p = provider_for(&server);
        let mut seen: Vec<(String, Value)> = Vec::new();
        let mut on_field = |name: &str, value: &Value| {
            seen.push((name.to_string(), value.clone()));
        };
        let resp = p
            .stream_complete(
                "identify",
                &CompletionOptions::default(),
                &CancelToken::none(),
                &mut on_field,
            )
            .await;

        assert!(resp.response.success);
        assert!(resp.streamed);
        assert!(resp.ttfb_ms.is_some());
        assert_eq!(seen[0].0, "producer");
        assert_eq!(seen[0].1, json!("Cloudy Bay"));
        assert_eq!(seen[1].0, "confidence");
        assert_eq!(seen[1].1, json!(72));
        assert_eq!(resp.response.input_tokens, 50);
        assert!(resp.field_timings.contains_key("producer"));
    }

    #[tokio::test]
    async fn test_thinking_dropped_for_non_thinking_model() {
        let server = MockServer::start().await;
        let p = provider_for(&server);
        let mut opts = CompletionOptions {
            thinking_level: Some(ThinkingLevel::High),
            model: Some("gemini-2.0-flash-lite".into()),
            ..Default::default()
        };
        // flash-lite has no caps entry → no thinking support
        let body = p.build_body("x", None, &opts, "gemini-2.0-flash-lite");
        assert!(body["generationConfig"].get("thinkingConfig").is_none());

        opts.model = Some("gemini-2.0-flash".into());
        let body = p.build_body("x", None, &opts, "gemini-2.0-flash");
        assert_eq!(
            body["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            json!(8192)
        );
    }

    #[tokio::test]
    async fn test_google_search_tool_requires_grounding_cap() {
        let server = MockServer::start().await;
        let p = provider_for(&server);
        let opts = CompletionOptions {
            tools: vec![ToolSpec::GoogleSearch],
            ..Default::default()
        };
        let body = p.build_body("x", None, &opts, "gemini-2.0-flash");
        assert_eq!(body["tools"][0], json!({ "google_search": {} }));

        let body = p.build_body("x", None, &opts, "gemini-2.0-flash-lite");
        assert!(body.get("tools").is_none());
    }

    #[tokio::test]
    async fn test_image_body_carries_inline_data() {
        let server = MockServer::start().await;
        let p = provider_for(&server);
        let body = p.build_body(
            "read the label",
            Some((b"fakebytes", "image/jpeg")),
            &CompletionOptions::default(),
            "gemini-2.0-flash",
        );
        let part = &body["contents"][0]["parts"][1]["inline_data"];
        assert_eq!(part["mime_type"], json!("image/jpeg"));
        assert!(part["data"].as_str().unwrap().len() > 4);
    }
}
