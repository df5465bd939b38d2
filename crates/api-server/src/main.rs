//! API Server Binary Entry Point

use cogniscan_api_server::{start_server, ApiState};
use cogniscan_orchestrator::{PredictionService, ServiceConfig};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cogniscan_api_server=info,cogniscan_orchestrator=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig::load()?;
    let service = Arc::new(PredictionService::from_config(&config).await?);

    // A failed load is remembered; requests report model_unavailable until
    // POST /api/admin/reload-model succeeds
    if let Err(e) = service.warm_up().await {
        tracing::error!("Model failed to load at startup: {}", e);
    }

    let state = ApiState::new(service, config.preprocessing.max_image_bytes);

    tracing::info!("Starting dementia-staging API server");
    start_server(&config.server.addr, state).await?;

    Ok(())
}
