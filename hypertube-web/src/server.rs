//! Axum server for Hypertube streaming
//!
//! Wires the download manager and availability reporter into the JSON API and
//! the range-aware media endpoint.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use hypertube_core::config::StreamingConfig;
use hypertube_core::{AvailabilityReporter, DownloadManager, HypertubeConfig, SwarmEngine};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::handlers::{
    health, list_sessions, start_stream, stream_availability, stream_data, stream_status,
};

/// Shared state of every request handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<DownloadManager>,
    pub reporter: AvailabilityReporter,
    pub streaming: StreamingConfig,
    /// Parent of every request's cancellation token
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(manager: Arc<DownloadManager>, shutdown: CancellationToken) -> Self {
        Self {
            reporter: AvailabilityReporter::new(Arc::clone(manager.store())),
            streaming: manager.config().streaming.clone(),
            manager,
            shutdown,
        }
    }
}

/// Builds the router with all API routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/stream/start", get(start_stream))
        .route("/stream/data/{session_id}", get(stream_data))
        .route("/stream/availability/{session_id}", get(stream_availability))
        .route("/stream/status/{session_id}", get(stream_status))
        .route("/stream/sessions", get(list_sessions))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves the API until `shutdown` fires, then stops every session.
///
/// # Errors
///
/// - `io::Error` - If the listener cannot be bound or the server fails
pub async fn run_server(
    config: HypertubeConfig,
    engine: Arc<dyn SwarmEngine>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let bind_address = config.server.bind_address();
    let retention = config.storage.retention;
    let eviction_interval = config.storage.eviction_interval;
    let manager = Arc::new(DownloadManager::new(engine, config));

    if let Some(max_idle) = retention {
        tokio::spawn(retention_loop(
            Arc::clone(&manager),
            max_idle,
            eviction_interval,
            shutdown.clone(),
        ));
    }

    let app = build_router(AppState::new(Arc::clone(&manager), shutdown.clone()));
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Hypertube streaming server running on http://{bind_address}");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .await?;

    manager.shutdown().await;
    info!("Server stopped");
    Ok(())
}

/// Periodically removes downloads nobody watched for `max_idle`.
async fn retention_loop(
    manager: Arc<DownloadManager>,
    max_idle: Duration,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match manager.evict_stale(max_idle).await {
            Ok(evicted) if !evicted.is_empty() => {
                info!(count = evicted.len(), "Retention sweep removed idle downloads");
            }
            Ok(_) => {}
            Err(e) => warn!("Retention sweep failed: {e}"),
        }
    }
}
