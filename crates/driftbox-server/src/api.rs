use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use driftbox_store::MemoryStore;

use crate::config::ServerConfig;
use crate::dispatcher::ws_handler;
use crate::rooms::RoomRegistry;
use crate::uploads::UploadAssembler;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MemoryStore>,
    pub uploads: Arc<UploadAssembler>,
    pub rooms: Arc<RoomRegistry>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    sessions: usize,
    files: usize,
    total_bytes: u64,
    connections: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.store.session_count().await,
        files: state.store.file_count().await,
        total_bytes: state.store.total_bytes().await,
        connections: state.rooms.connection_count().await,
    })
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
