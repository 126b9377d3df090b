use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::cancel::CancelRegistry;
use crate::config::Config;
use crate::enrich::EnrichmentService;
use crate::identify::IdentificationService;
use crate::llm::LlmClient;
use crate::store::postgres::PgStore;

pub mod handlers;
pub mod sse;

/// Everything a handler needs, created once at startup and shared.
/// No globals; request-scoped state (cancel tokens, SSE sessions) is
/// created per request from these factories.
pub struct AppState {
    pub config: Arc<Config>,
    pub llm: Arc<LlmClient>,
    pub identification: IdentificationService,
    pub enrichment: EnrichmentService,
    pub cancels: CancelRegistry,
    /// Present when backed by Postgres; readiness probes ping it.
    pub db: Option<PgStore>,
}

pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/identify/text", post(handlers::identify_text))
        .route("/identify/text/stream", post(handlers::identify_text_stream))
        .route("/identify/image", post(handlers::identify_image))
        .route("/identify/image/stream", post(handlers::identify_image_stream))
        .route("/identify/opus", post(handlers::identify_with_opus))
        .route("/verify/image", post(handlers::verify_image))
        .route("/enrich", post(handlers::enrich))
        .route("/enrich/stream", post(handlers::enrich_stream))
        .route("/clarify", post(handlers::clarify_match))
        .route("/cancel/:request_id", post(handlers::cancel_request))
        .route("/usage/daily", get(handlers::usage_daily))
        .route("/usage/stats", get(handlers::usage_stats))
        .route("/usage/summary", get(handlers::usage_summary))
}
