//! Uniform contract over one LLM vendor.
//!
//! Adapters own HTTP, SSE decoding, error classification, and cost
//! computation; everything above them speaks [`ProviderResponse`] and the
//! [`Provider`] trait. Responses carry success/error inline rather than
//! as `Result` so every terminal outcome, failed or not, flows through
//! the usage log unchanged.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::errors::ErrorKind;

pub mod claude;
pub mod gemini;
pub mod mock;
pub mod pricing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Vision,
    Tools,
    Streaming,
    Grounding,
    Thinking,
}

/// Reasoning effort requested from thinking-capable models. Silently
/// dropped by adapters whose current model lacks the capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThinkingLevel {
    Minimal,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone)]
pub enum ToolSpec {
    /// Sentinel enabling grounded retrieval on providers that support it.
    GoogleSearch,
    /// Opaque function declaration passed through to the vendor.
    Function(Value),
}

#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub json_response: bool,
    /// Opaque JSON schema the provider must constrain output to.
    pub response_schema: Option<Value>,
    pub thinking_level: Option<ThinkingLevel>,
    pub tools: Vec<ToolSpec>,
    /// Per-call wall-clock budget in seconds; adapter default applies
    /// when unset.
    pub timeout_secs: Option<u64>,
    /// Explicit overrides used by higher escalation tiers.
    pub provider: Option<String>,
    pub model: Option<String>,
}

impl CompletionOptions {
    pub fn wants_search(&self) -> bool {
        self.tools
            .iter()
            .any(|t| matches!(t, ToolSpec::GoogleSearch))
    }
}

/// Buffered completion outcome. `success == false` carries the classified
/// error; token counts and cost are whatever the vendor reported before
/// failing (often zero).
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub success: bool,
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: Decimal,
    pub latency_ms: u64,
    pub provider: String,
    pub model: String,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl ProviderResponse {
    pub fn failure(
        provider: &str,
        model: &str,
        kind: ErrorKind,
        message: impl Into<String>,
        latency_ms: u64,
    ) -> Self {
        Self {
            success: false,
            content: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: Decimal::ZERO,
            latency_ms,
            provider: provider.to_string(),
            model: model.to_string(),
            error: Some(message.into()),
            error_kind: Some(kind),
        }
    }

    pub fn is_retryable_failure(&self) -> bool {
        !self.success && self.error_kind.map(|k| k.is_retryable()).unwrap_or(false)
    }
}

/// Streaming outcome: the buffered response plus stream-only metrics.
#[derive(Debug, Clone)]
pub struct StreamingResponse {
    pub response: ProviderResponse,
    pub streamed: bool,
    /// Time from request dispatch to the first byte of model output.
    pub ttfb_ms: Option<u64>,
    /// Milliseconds from dispatch to each field's completion.
    pub field_timings: BTreeMap<String, u64>,
}

impl StreamingResponse {
    pub fn not_streamed(response: ProviderResponse) -> Self {
        Self {
            response,
            streamed: false,
            ttfb_ms: None,
            field_timings: BTreeMap::new(),
        }
    }
}

/// Per-field callback invoked as each top-level field completes.
pub type FieldCallback<'a> = &'a mut (dyn FnMut(&str, &Value) + Send);

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> String;
    fn set_model(&self, model: &str);
    fn supports(&self, cap: Capability) -> bool;
    async fn is_healthy(&self) -> bool;

    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        cancel: &CancelToken,
    ) -> ProviderResponse;

    async fn complete_with_image(
        &self,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
        options: &CompletionOptions,
        cancel: &CancelToken,
    ) -> ProviderResponse;

    async fn stream_complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        cancel: &CancelToken,
        on_field: FieldCallback<'_>,
    ) -> StreamingResponse;

    async fn stream_complete_with_image(
        &self,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
        options: &CompletionOptions,
        cancel: &CancelToken,
        on_field: FieldCallback<'_>,
    ) -> StreamingResponse;
}

/// Outcome of a cancellable bounded wait.
pub enum WaitOutcome<T> {
    Done(T),
    Cancelled,
    TimedOut,
}

/// Await a future in ≤1 s slices so the cancel token and the wall clock
/// are both observed even when the vendor blocks.
pub async fn await_with_cancel<F, T>(
    fut: F,
    cancel: &CancelToken,
    timeout: Duration,
) -> WaitOutcome<T>
where
    F: Future<Output = T>,
{
    tokio::pin!(fut);
    let mut elapsed = Duration::ZERO;
    let slice = Duration::from_secs(1);

    loop {
        tokio::select! {
            out = &mut fut => return WaitOutcome::Done(out),
            _ = tokio::time::sleep(slice) => {
                elapsed += slice;
                if cancel.is_cancelled() {
                    return WaitOutcome::Cancelled;
                }
                if elapsed >= timeout {
                    return WaitOutcome::TimedOut;
                }
            }
        }
    }
}

/// Pick the JSON payload out of a multi-part answer (e.g. thinking plus
/// final): first part whose trimmed text begins with `{` or `[`,
/// otherwise the last non-empty part.
pub fn select_json_part(parts: &[String]) -> Option<&str> {
    parts
        .iter()
        .map(|p| p.trim())
        .find(|p| p.starts_with('{') || p.starts_with('['))
        .or_else(|| {
            parts
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .last()
        })
}
