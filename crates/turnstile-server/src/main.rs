mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::get,
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use turnstile_engine::{Entitlements, Registry, SystemClock};
use turnstile_store::Store;
use turnstile_types::Stats;

use config::ServerConfig;

#[derive(Clone)]
struct AppState {
    engine: Arc<Entitlements>,
    store: Arc<dyn Store>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "turnstile=debug,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let store = turnstile_store::open(&config.store).await?;
    info!("store backend: {}", store.backend_name());

    // First-run seed; a restart never reverts administrator edits.
    let registry = Registry::new(store.clone());
    registry
        .seed_defaults(
            &config::default_plans(),
            &config::default_settings(&config.channels),
        )
        .await?;

    let engine = Arc::new(Entitlements::new(
        store.clone(),
        Arc::new(SystemClock),
        config.channels.clone(),
    ));

    let state = AppState { engine, store };

    // Keep-alive surface for the hosting platform; the chat transport is a
    // separate process that consumes the engine crates directly.
    let app = Router::new()
        .route("/", get(home))
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("turnstile listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn home() -> &'static str {
    "turnstile is running"
}

async fn healthz(State(state): State<AppState>) -> StatusCode {
    match state.store.ping().await {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            warn!("health check failed: {err}");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn stats(State(state): State<AppState>) -> Result<Json<Stats>, StatusCode> {
    match state.engine.stats().await {
        Ok(stats) => Ok(Json(stats)),
        Err(err) => {
            warn!("stats query failed: {err}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
