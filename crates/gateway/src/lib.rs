//! HTTP API gateway for Agentry.
//!
//! Exposes the chat-messages API (blocking JSON or SSE streaming), turn
//! stop, message history, conversation rename/delete, suggested questions
//! and a health check.
//!
//! Built on Axum.

pub mod api_v1;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::{Router, response::Json, routing::get};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use agentry_agent::Engine;
use agentry_config::{AppConfig, StoreBackend};
use agentry_core::error::{Error, Result};
use agentry_core::event::{DomainEvent, EventBus};
use agentry_core::store::ChatStore;
use agentry_store::{InMemoryStore, SqliteStore};

/// Open the configured store, build the provider router and register the
/// built-in tools with the chat persona.
pub async fn build_engine(config: AppConfig) -> Result<Engine> {
    let store: Arc<dyn ChatStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(InMemoryStore::new()),
        StoreBackend::Sqlite => {
            let path = config.store.database_path();
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).map_err(|e| Error::Config {
                    message: format!("cannot create {}: {e}", dir.display()),
                })?;
            }
            Arc::new(SqliteStore::new(&path.to_string_lossy()).await?)
        }
    };

    let router = agentry_providers::router::build_from_config(&config);
    let tools = agentry_tools::default_tools(&config.tools);
    let engine = Engine::new(config, router, store, Arc::new(EventBus::default()));
    for tool in tools {
        engine.register_tool("chat", tool)?;
    }
    Ok(engine)
}

/// Build the full router: `/health` plus the v1 API under `/v1`.
pub fn build_router(engine: Engine) -> Router {
    let state = Arc::new(api_v1::ApiV1State::new(engine));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", api_v1::v1_router(state))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the gateway HTTP server.
pub async fn start(config: AppConfig) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let engine = build_engine(config).await?;
    log_turn_failures(&engine);
    let app = build_router(engine);

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Report failed turns. Stopped turns never publish `TurnFailed`.
fn log_turn_failures(engine: &Engine) {
    let mut events = engine.events().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let DomainEvent::TurnFailed {
                        conversation_id,
                        message_id,
                        error_message,
                        ..
                    } = &*event
                    {
                        warn!(%conversation_id, %message_id, error = %error_message, "Turn failed");
                    }
                }
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Failure log lagged behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
