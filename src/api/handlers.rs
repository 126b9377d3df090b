//! HTTP endpoint handlers: parse JSON in, hand off to the services,
//! render JSON or SSE out. All the hard decisions live below this layer.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use base64::Engine;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::cancel::CancelToken;
use crate::enrich::{EnrichOutcome, EnrichRequest};
use crate::errors::{AgentError, ErrorKind};
use crate::identify::{AugmentationContext, IdentifyInput, WineIdentification};
use crate::providers::CompletionOptions;
use crate::usage::Caller;

use super::sse::{into_sse_response, SseSession};
use super::AppState;

const MAX_CLARIFY_OPTIONS: usize = 10;

// ── Request DTOs ──────────────────────────────────────────────

#[derive(Deserialize)]
pub struct IdentifyTextBody {
    text: String,
    #[serde(default)]
    clarification: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyImageBody {
    image: String,
    mime_type: String,
    #[serde(default)]
    supplementary_text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpusBody {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    prior_result: WineIdentification,
    #[serde(default)]
    locked_fields: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    escalation_context: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyImageBody {
    image: String,
    mime_type: String,
    prior_result: WineIdentification,
    #[serde(default)]
    supplementary_text: Option<String>,
    #[serde(default)]
    locked_fields: Option<BTreeMap<String, Value>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichBody {
    producer: String,
    wine_name: String,
    #[serde(default)]
    vintage: Option<String>,
    #[serde(default)]
    wine_type: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    confirm_match: bool,
    #[serde(default)]
    force_refresh: bool,
}

#[derive(Deserialize)]
pub struct ClarifyBody {
    #[serde(rename = "type")]
    kind: String,
    identified: String,
    options: Vec<String>,
}

#[derive(Deserialize)]
pub struct StatsQuery {
    #[serde(default = "default_days")]
    days: i64,
}

fn default_days() -> i64 {
    7
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryQuery {
    start_date: Option<chrono::NaiveDate>,
    end_date: Option<chrono::NaiveDate>,
}

// ── Header helpers ────────────────────────────────────────────

fn caller_from(headers: &HeaderMap) -> Caller {
    let user = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();
    let session = headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Caller::new(user, session)
}

fn request_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn decode_image(b64: &str, endpoint: &str) -> Result<Vec<u8>, AgentError> {
    base64::engine::general_purpose::STANDARD
        .decode(b64.trim())
        .map_err(|_| {
            AgentError::new(ErrorKind::InvalidRequest, "image is not valid base64")
                .with_support_ref(endpoint)
        })
}

fn augmentation_from(
    locked: Option<BTreeMap<String, Value>>,
    clarification: Option<&str>,
) -> AugmentationContext {
    let mut aug = AugmentationContext::default();
    if let Some(locked) = locked {
        aug = aug.with_locked(locked);
    }
    if let Some(text) = clarification {
        aug = aug.with_clarification(text);
    }
    aug
}

// ── Identification ────────────────────────────────────────────

pub async fn identify_text(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IdentifyTextBody>,
) -> Result<impl IntoResponse, AgentError> {
    let caller = caller_from(&headers);
    let aug = augmentation_from(None, body.clarification.as_deref());
    let outcome = state
        .identification
        .identify(
            &IdentifyInput::Text(body.text),
            &aug,
            &caller,
            &CancelToken::none(),
        )
        .await
        .map_err(|e| e.with_support_ref("identifyText"))?;
    Ok(Json(json!({ "success": true, "result": outcome })))
}

pub async fn identify_text_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IdentifyTextBody>,
) -> impl IntoResponse {
    let caller = caller_from(&headers);
    let request_id = request_id_from(&headers);
    let aug = augmentation_from(None, body.clarification.as_deref());
    stream_identification(state, IdentifyInput::Text(body.text), aug, caller, request_id)
}

pub async fn identify_image(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IdentifyImageBody>,
) -> Result<impl IntoResponse, AgentError> {
    let caller = caller_from(&headers);
    let bytes = decode_image(&body.image, "identifyImage")?;
    let outcome = state
        .identification
        .identify(
            &IdentifyInput::Image {
                bytes,
                mime_type: body.mime_type,
                supplementary: body.supplementary_text,
            },
            &AugmentationContext::default(),
            &caller,
            &CancelToken::none(),
        )
        .await
        .map_err(|e| e.with_support_ref("identifyImage"))?;
    Ok(Json(json!({ "success": true, "result": outcome })))
}

pub async fn identify_image_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IdentifyImageBody>,
) -> Result<impl IntoResponse, AgentError> {
    let caller = caller_from(&headers);
    let request_id = request_id_from(&headers);
    let bytes = decode_image(&body.image, "identifyImageStream")?;
    let input = IdentifyInput::Image {
        bytes,
        mime_type: body.mime_type,
        supplementary: body.supplementary_text,
    };
    Ok(stream_identification(
        state,
        input,
        AugmentationContext::default(),
        caller,
        request_id,
    ))
}

/// Shared streaming shell: session + cancel cleanup + background drive.
fn stream_identification(
    state: Arc<AppState>,
    input: IdentifyInput,
    aug: AugmentationContext,
    caller: Caller,
    request_id: Option<String>,
) -> impl IntoResponse {
    let (session, rx) = SseSession::channel();
    tokio::spawn(async move {
        let cleanup = state.cancels.register_cleanup(request_id.as_deref());
        let cancel = state.cancels.token(request_id.as_deref());
        state
            .identification
            .identify_streaming(&input, &aug, &caller, &cancel, &session)
            .await;
        // Session is torn down here whatever happened above.
        session.done();
        drop(cleanup);
    });
    into_sse_response(rx)
}

pub async fn identify_with_opus(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<OpusBody>,
) -> Result<impl IntoResponse, AgentError> {
    let caller = caller_from(&headers);
    let aug = augmentation_from(body.locked_fields, body.escalation_context.as_deref());

    let input = match (body.text, body.image) {
        (Some(text), _) => IdentifyInput::Text(text),
        (None, Some(image)) => IdentifyInput::Image {
            bytes: decode_image(&image, "identifyWithOpus")?,
            mime_type: body.mime_type.unwrap_or_else(|| "image/jpeg".into()),
            supplementary: None,
        },
        (None, None) => {
            return Err(AgentError::new(
                ErrorKind::InvalidRequest,
                "either text or image is required",
            )
            .with_support_ref("identifyWithOpus"));
        }
    };

    let outcome = state
        .identification
        .identify_with_opus(&input, body.prior_result, &aug, &caller, &CancelToken::none())
        .await
        .map_err(|e| e.with_support_ref("identifyWithOpus"))?;
    Ok(Json(json!({ "success": true, "result": outcome })))
}

pub async fn verify_image(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<VerifyImageBody>,
) -> Result<impl IntoResponse, AgentError> {
    let caller = caller_from(&headers);
    let aug = augmentation_from(body.locked_fields, None);
    let input = IdentifyInput::Image {
        bytes: decode_image(&body.image, "verifyImage")?,
        mime_type: body.mime_type,
        supplementary: body.supplementary_text,
    };
    let outcome = state
        .identification
        .verify_image(&input, body.prior_result, &aug, &caller, &CancelToken::none())
        .await
        .map_err(|e| e.with_support_ref("verifyImage"))?;
    Ok(Json(json!({ "success": true, "result": outcome })))
}

// ── Enrichment ────────────────────────────────────────────────

impl From<EnrichBody> for EnrichRequest {
    fn from(b: EnrichBody) -> Self {
        EnrichRequest {
            producer: b.producer,
            wine_name: b.wine_name,
            vintage: b.vintage,
            wine_type: b.wine_type,
            region: b.region,
            confirm_match: b.confirm_match,
            force_refresh: b.force_refresh,
        }
    }
}

fn enrich_outcome_json(outcome: EnrichOutcome) -> Value {
    match outcome {
        EnrichOutcome::Record(record) => json!({ "success": true, "result": record }),
        EnrichOutcome::PendingConfirmation {
            match_type,
            searched_for,
            matched_to,
            confidence,
        } => json!({
            "success": true,
            "pendingConfirmation": {
                "matchType": match_type,
                "searchedFor": searched_for,
                "matchedTo": matched_to,
                "confidence": confidence,
            }
        }),
    }
}

pub async fn enrich(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<EnrichBody>,
) -> Result<impl IntoResponse, AgentError> {
    let caller = caller_from(&headers);
    let outcome = state
        .enrichment
        .enrich(&body.into(), &caller, &CancelToken::none())
        .await
        .map_err(|e| e.with_support_ref("agentEnrich"))?;
    Ok(Json(enrich_outcome_json(outcome)))
}

pub async fn enrich_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<EnrichBody>,
) -> impl IntoResponse {
    let caller = caller_from(&headers);
    let request_id = request_id_from(&headers);
    let req: EnrichRequest = body.into();

    let (session, rx) = SseSession::channel();
    tokio::spawn(async move {
        let cleanup = state.cancels.register_cleanup(request_id.as_deref());
        let cancel = state.cancels.token(request_id.as_deref());
        state
            .enrichment
            .enrich_streaming(&req, &caller, &cancel, &session)
            .await;
        session.done();
        drop(cleanup);
    });
    into_sse_response(rx)
}

// ── Clarification ─────────────────────────────────────────────

pub async fn clarify_match(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ClarifyBody>,
) -> Result<impl IntoResponse, AgentError> {
    let caller = caller_from(&headers);
    let options = validate_clarify_options(&body.kind, body.options)
        .map_err(|e| e.with_support_ref("clarifyMatch"))?;

    let prompt = crate::prompts::clarify_match(&body.kind, &body.identified, &options);
    let resp = state
        .llm
        .complete(
            "clarify_match",
            &prompt,
            CompletionOptions {
                json_response: true,
                temperature: Some(0.0),
                timeout_secs: Some(20),
                ..Default::default()
            },
            &caller,
            &CancelToken::none(),
        )
        .await;

    if !resp.success {
        let kind = resp.error_kind.unwrap_or(ErrorKind::ClarificationError);
        return Err(
            AgentError::new(kind, resp.error.unwrap_or_else(|| "clarification failed".into()))
                .with_support_ref("clarifyMatch"),
        );
    }

    let (matched, reason) = parse_clarify_choice(&resp.content, &options);
    Ok(Json(json!({ "success": true, "match": matched, "reason": reason })))
}

/// Empty list → 400; over-long lists are truncated, never rejected.
fn validate_clarify_options(
    kind: &str,
    options: Vec<String>,
) -> Result<Vec<String>, AgentError> {
    if !matches!(kind, "region" | "producer" | "wine") {
        return Err(AgentError::new(
            ErrorKind::InvalidRequest,
            format!("unknown clarification type '{kind}'"),
        ));
    }
    if options.is_empty() {
        return Err(AgentError::new(
            ErrorKind::InvalidRequest,
            "at least one option required",
        ));
    }
    let mut options = options;
    options.truncate(MAX_CLARIFY_OPTIONS);
    Ok(options)
}

fn parse_clarify_choice(content: &str, options: &[String]) -> (Option<String>, Option<String>) {
    let Ok(v) = serde_json::from_str::<Value>(content.trim()) else {
        return (None, None);
    };
    let reason = v["reason"].as_str().map(str::to_string);
    let matched = v["choice"]
        .as_u64()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| options.get(i as usize))
        .cloned();
    (matched, reason)
}

// ── Cancellation ──────────────────────────────────────────────

pub async fn cancel_request(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Result<impl IntoResponse, AgentError> {
    state.cancels.cancel(&request_id).map_err(|e| {
        AgentError::new(ErrorKind::UnknownError, format!("cancel failed: {e}"))
            .with_support_ref("cancel")
    })?;
    Ok(Json(json!({ "success": true, "cancelled": request_id })))
}

// ── Usage analytics ───────────────────────────────────────────

pub async fn usage_daily(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AgentError> {
    let caller = caller_from(&headers);
    let rows = state.llm.tracker().daily_usage(&caller.user_id).await?;
    Ok(Json(json!({ "success": true, "daily": rows })))
}

pub async fn usage_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<StatsQuery>,
) -> Result<impl IntoResponse, AgentError> {
    let caller = caller_from(&headers);
    let rows = state
        .llm
        .tracker()
        .detailed_stats(&caller.user_id, q.days.clamp(1, 365))
        .await?;
    Ok(Json(json!({ "success": true, "days": q.days, "stats": rows })))
}

pub async fn usage_summary(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<SummaryQuery>,
) -> Result<impl IntoResponse, AgentError> {
    let caller = caller_from(&headers);
    let end = q.end_date.unwrap_or_else(|| Utc::now().date_naive());
    let start = q.start_date.unwrap_or(end - Duration::days(30));
    if start > end {
        return Err(AgentError::new(
            ErrorKind::InvalidRequest,
            "startDate must not be after endDate",
        )
        .with_support_ref("usageSummary"));
    }
    let summary = state
        .llm
        .tracker()
        .cost_summary(&caller.user_id, start, end)
        .await?;
    Ok(Json(json!({ "success": true, "summary": summary })))
}
