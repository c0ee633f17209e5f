mod adapters;
mod api;
mod cleanup;
mod config;
mod dispatcher;
mod error;
mod handlers;
mod rooms;
mod uploads;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use driftbox_store::{MemoryStore, StoreLimits, SystemClock};

use crate::api::AppState;
use crate::cleanup::CleanupService;
use crate::config::ServerConfig;
use crate::rooms::RoomRegistry;
use crate::uploads::{UploadAssembler, UploadLimits};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,driftbox_server=debug")),
        )
        .init();

    info!("Starting driftbox server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let clock = Arc::new(SystemClock);

    let store_limits = StoreLimits {
        session_ttl: chrono::Duration::from_std(config.session_ttl)?,
        max_file_size: config.max_file_size,
        max_total_bytes: config.max_total_bytes,
        ..StoreLimits::default()
    };
    let store = Arc::new(MemoryStore::new(clock.clone(), store_limits));

    let upload_limits = UploadLimits {
        max_file_size: config.max_file_size,
        ..UploadLimits::default()
    };
    let uploads = Arc::new(UploadAssembler::new(clock.clone(), upload_limits));

    let rooms = Arc::new(RoomRegistry::new());

    let cleanup = Arc::new(CleanupService::new(
        store.clone(),
        uploads.clone(),
        rooms.clone(),
        config.max_total_bytes,
    ));
    let cleanup_task = cleanup.spawn(config.cleanup_interval);

    let state = AppState {
        store,
        uploads,
        rooms,
        config: Arc::new(config.clone()),
    };

    let addr = config.bind_addr();
    tokio::select! {
        result = api::serve(state, addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    cleanup_task.abort();
    Ok(())
}
