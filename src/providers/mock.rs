//! Mock provider for deterministic testing.
//!
//! Returns pre-queued responses without touching the network; streaming
//! replays the queued content chunk by chunk through the field detector,
//! honouring the cancel token between chunks like a real adapter.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::cancel::CancelToken;
use crate::errors::ErrorKind;
use crate::stream::FieldDetector;

use super::{
    Capability, CompletionOptions, FieldCallback, Provider, ProviderResponse, StreamingResponse,
};

#[derive(Clone)]
pub struct MockCall {
    pub content: String,
    pub error: Option<(ErrorKind, String)>,
    /// Explicit chunking for streaming; defaults to one mid-string split.
    pub chunks: Option<Vec<String>>,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl MockCall {
    pub fn text(content: &str) -> Self {
        Self {
            content: content.to_string(),
            error: None,
            chunks: None,
            input_tokens: 100,
            output_tokens: 50,
        }
    }

    pub fn error(kind: ErrorKind, message: &str) -> Self {
        Self {
            content: String::new(),
            error: Some((kind, message.to_string())),
            chunks: None,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    pub fn chunked(chunks: &[&str]) -> Self {
        Self {
            content: chunks.concat(),
            error: None,
            chunks: Some(chunks.iter().map(|s| s.to_string()).collect()),
            input_tokens: 100,
            output_tokens: 50,
        }
    }
}

/// Recorded view of one dispatched call, for assertions.
#[derive(Clone, Debug)]
pub struct SeenCall {
    pub prompt: String,
    pub model: String,
    pub streamed: bool,
    pub had_image: bool,
}

pub struct MockProvider {
    name: String,
    model: RwLock<String>,
    queue: Mutex<Vec<MockCall>>,
    pub seen: Arc<Mutex<Vec<SeenCall>>>,
    streaming_supported: bool,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            model: RwLock::new(format!("{name}-mock-model")),
            queue: Mutex::new(Vec::new()),
            seen: Arc::new(Mutex::new(Vec::new())),
            streaming_supported: true,
        }
    }

    pub fn without_streaming(mut self) -> Self {
        self.streaming_supported = false;
        self
    }

    pub fn queue(self, call: MockCall) -> Self {
        self.queue.lock().unwrap().push(call);
        self
    }

    pub fn push(&self, call: MockCall) {
        self.queue.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<SeenCall> {
        self.seen.lock().unwrap().clone()
    }

    fn next(&self) -> MockCall {
        let mut q = self.queue.lock().unwrap();
        if q.is_empty() {
            MockCall::error(ErrorKind::UnknownError, "mock: no queued responses")
        } else {
            q.remove(0)
        }
    }

    fn record(&self, prompt: &str, options: &CompletionOptions, streamed: bool, had_image: bool) {
        self.seen.lock().unwrap().push(SeenCall {
            prompt: prompt.to_string(),
            model: options
                .model
                .clone()
                .unwrap_or_else(|| self.model.read().unwrap().clone()),
            streamed,
            had_image,
        });
    }

    fn respond(&self, call: MockCall, options: &CompletionOptions) -> ProviderResponse {
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| self.model.read().unwrap().clone());
        match call.error {
            Some((kind, message)) => {
                ProviderResponse::failure(&self.name, &model, kind, message, 5)
            }
            None => ProviderResponse {
                success: true,
                content: call.content,
                input_tokens: call.input_tokens,
                output_tokens: call.output_tokens,
                cost_usd: Decimal::new(1, 3), // $0.001 per mock call
                latency_ms: 5,
                provider: self.name.clone(),
                model,
                error: None,
                error_kind: None,
            },
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> String {
        self.model.read().unwrap().clone()
    }

    fn set_model(&self, model: &str) {
        *self.model.write().unwrap() = model.to_string();
    }

    fn supports(&self, cap: Capability) -> bool {
        match cap {
            Capability::Streaming => self.streaming_supported,
            _ => true,
        }
    }

    async fn is_healthy(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        _cancel: &CancelToken,
    ) -> ProviderResponse {
        self.record(prompt, options, false, false);
        self.respond(self.next(), options)
    }

    async fn complete_with_image(
        &self,
        prompt: &str,
        _image: &[u8],
        _mime_type: &str,
        options: &CompletionOptions,
        _cancel: &CancelToken,
    ) -> ProviderResponse {
        self.record(prompt, options, false, true);
        self.respond(self.next(), options)
    }

    async fn stream_complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        cancel: &CancelToken,
        on_field: FieldCallback<'_>,
    ) -> StreamingResponse {
        self.record(prompt, options, true, false);
        self.stream_inner(options, cancel, on_field).await
    }

    async fn stream_complete_with_image(
        &self,
        prompt: &str,
        _image: &[u8],
        _mime_type: &str,
        options: &CompletionOptions,
        cancel: &CancelToken,
        on_field: FieldCallback<'_>,
    ) -> StreamingResponse {
        self.record(prompt, options, true, true);
        self.stream_inner(options, cancel, on_field).await
    }
}

impl MockProvider {
    async fn stream_inner(
        &self,
        options: &CompletionOptions,
        cancel: &CancelToken,
        on_field: FieldCallback<'_>,
    ) -> StreamingResponse {
        let call = self.next();
        if call.error.is_some() {
            return StreamingResponse::not_streamed(self.respond(call, options));
        }

        let chunks = call.chunks.clone().unwrap_or_else(|| {
            let mid = call.content.len() / 2;
            // Split on a char boundary near the middle
            let mid = (mid..call.content.len())
                .find(|i| call.content.is_char_boundary(*i))
                .unwrap_or(call.content.len());
            vec![
                call.content[..mid].to_string(),
                call.content[mid..].to_string(),
            ]
        });

        let mut detector = FieldDetector::new();
        let mut field_timings = BTreeMap::new();
        let mut cancelled = false;
        let mut fed = String::new();

        for (i, chunk) in chunks.iter().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            tokio::task::yield_now().await;
            fed.push_str(chunk);
            for (name, value) in detector.feed(chunk) {
                field_timings.entry(name.clone()).or_insert(i as u64);
                on_field(&name, &value);
            }
        }
        if !cancelled {
            for (name, value) in detector.finish() {
                field_timings.entry(name.clone()).or_insert(chunks.len() as u64);
                on_field(&name, &value);
            }
        }

        let response = self.respond(
            MockCall {
                content: fed,
                ..call
            },
            options,
        );
        StreamingResponse {
            response,
            streamed: true,
            ttfb_ms: Some(1),
            field_timings,
        }
    }
}
