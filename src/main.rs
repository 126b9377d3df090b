use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod cancel;
mod cli;
mod config;
mod enrich;
mod errors;
mod identify;
mod llm;
mod prompts;
mod providers;
mod store;
mod stream;
mod usage;

use api::AppState;
use cancel::CancelRegistry;
use enrich::EnrichmentService;
use identify::IdentificationService;
use llm::LlmClient;
use store::postgres::PgStore;
use store::AgentStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "sommelier=debug,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    match args.command {
        Some(cli::Commands::Health) => print_health(cfg).await,
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    }
}

async fn run_server(cfg: config::Config, port: u16) -> anyhow::Result<()> {
    let config = Arc::new(cfg);

    tracing::info!("connecting to database...");
    let db = PgStore::connect(&config.database_url).await?;

    tracing::info!("running migrations...");
    db.migrate().await?;

    let store: Arc<dyn AgentStore> = Arc::new(db.clone());
    let llm = Arc::new(LlmClient::from_config(config.clone(), store.clone()));
    let cancels = CancelRegistry::new(&config.cancel_dir)?;

    let state = Arc::new(AppState {
        identification: IdentificationService::new(llm.clone(), config.clone()),
        enrichment: EnrichmentService::new(llm.clone(), config.clone(), store.clone()),
        llm,
        cancels,
        db: Some(db),
        config: config.clone(),
    });

    let app = axum::Router::new()
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .route("/readyz", axum::routing::get(readiness_check))
        .nest("/api/v1", api::api_router())
        .with_state(state)
        // Label photos arrive base64-encoded; 15 MB covers phone camera output
        .layer(DefaultBodyLimit::max(15 * 1024 * 1024))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(request_id_middleware));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("sommelier agent listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}

/// Echo a request id into every response so client reports can be
/// correlated with logs. Streaming endpoints additionally read the
/// client-supplied X-Request-Id for the cancellation rendezvous.
async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let req_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut resp = next.run(req).await;
    if let Ok(val) = axum::http::HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

async fn readiness_check(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> axum::Json<serde_json::Value> {
    let db_ok = match &state.db {
        Some(db) => db.ping().await,
        None => true,
    };
    let mut providers = serde_json::Map::new();
    for name in state.llm.provider_names() {
        if let Some(p) = state.llm.provider(&name) {
            providers.insert(name, serde_json::json!(p.is_healthy().await));
        }
    }
    axum::Json(serde_json::json!({
        "ready": db_ok,
        "database": db_ok,
        "providers": providers,
    }))
}

async fn print_health(cfg: config::Config) -> anyhow::Result<()> {
    let config = Arc::new(cfg);
    let store: Arc<dyn AgentStore> = Arc::new(store::memory::MemoryStore::new());
    let llm = LlmClient::from_config(config, store);
    for name in llm.provider_names() {
        if let Some(p) = llm.provider(&name) {
            let healthy = p.is_healthy().await;
            println!("{name:<10} {}", if healthy { "ok" } else { "unreachable" });
        }
    }
    Ok(())
}
