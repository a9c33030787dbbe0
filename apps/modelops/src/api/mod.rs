//! # Serving Shell
//!
//! Minimal HTTP server run by `modelops serve` inside each serving process.
//! It reports which model version the process was launched for; prediction
//! handling lives with the model artifact, not here.
//!
//! ## Endpoints
//!
//! - `GET /health` - Liveness plus the served version
//! - `GET /model` - Stage holder metadata from the registry

mod handlers;
mod types;

pub use handlers::{health_handler, model_handler};
pub use types::{HealthResponse, ModelResponse, ServedModel};

use axum::{Router, routing::get};
use modelops_core::OpsError;
use std::future::Future;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state. Immutable after startup.
#[derive(Clone)]
pub struct AppState {
    pub served: Arc<ServedModel>,
}

impl AppState {
    #[must_use]
    pub fn new(served: ServedModel) -> Self {
        Self {
            served: Arc::new(served),
        }
    }
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the axum router.
///
/// Layers (outer to inner): tracing, then permissive CORS. The endpoints are
/// read-only and carry no secrets.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/model", get(handlers::model_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Serve until `shutdown` resolves, then drain in-flight requests.
pub async fn run_server(
    addr: &str,
    served: ServedModel,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), OpsError> {
    let router = create_router(AppState::new(served));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| OpsError::IoError(format!("Bind failed on {}: {}", addr, e)))?;

    tracing::info!("serving shell listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| OpsError::IoError(format!("Server error: {}", e)))
}

/// Resolves on SIGTERM (sent by the process manager) or Ctrl+C.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("termination signal received, draining");
}
