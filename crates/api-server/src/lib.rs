//! REST API server for dementia-staging predictions
//!
//! - `POST /api/predict`: multipart scan + clinical fields → label, confidence, overlay reference
//! - `GET /results/{reference}`: stored saliency overlay PNG
//! - `GET /api/history?subject=…`: a subject's predictions, newest first
//! - `GET /health`: liveness and whether the model is loaded
//! - `POST /api/admin/reload-model`: retry a failed model load

mod error;
mod handlers;
mod types;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use cogniscan_orchestrator::PredictionService;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use error::{status_for, ApiError};
pub use handlers::*;
pub use types::*;

/// Room for the clinical form fields and multipart framing on top of the image
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

/// API server state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<PredictionService>,
    /// Largest accepted request body
    pub body_limit: usize,
}

impl ApiState {
    /// State accepting images up to `max_image_bytes`
    #[must_use]
    pub fn new(service: Arc<PredictionService>, max_image_bytes: usize) -> Self {
        Self {
            service,
            body_limit: max_image_bytes.saturating_add(FORM_OVERHEAD_BYTES),
        }
    }
}

/// Build the API router with all endpoints
pub fn build_router(state: ApiState) -> Router {
    let body_limit = state.body_limit;
    Router::new()
        .route("/health", get(health_check))
        .route("/api/predict", post(predict))
        .route("/api/history", get(get_history))
        .route("/api/admin/reload-model", post(reload_model))
        .route("/results/{reference}", get(get_result))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on an already bound listener
pub async fn serve(listener: TcpListener, state: ApiState) -> Result<(), std::io::Error> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("API server listening on {}", addr);
    }
    axum::serve(listener, build_router(state)).await
}

/// Start the API server
pub async fn start_server(addr: &str, state: ApiState) -> Result<(), std::io::Error> {
    tracing::info!("Starting API server on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state).await
}
