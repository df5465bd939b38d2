//! Inference orchestration for the dementia-staging service
//!
//! Wires the preprocessing, fusion model, saliency and storage crates into a
//! request pipeline:
//!
//! 1. decode and normalize the scan (rejected before the model runs if unreadable)
//! 2. encode the clinical record
//! 3. one forward pass producing logits and token features
//! 4. softmax and argmax
//! 5. best-effort saliency overlay, stored under a reference derived from the result id
//!
//! The model lives in a [`ModelContext`] that is loaded once and shared by reference.
//! [`PredictionService`] adds prediction history and doctor recommendations on top.
//!
//! # Example
//!
//! ```rust,no_run
//! use cogniscan_common::ClinicalRecord;
//! use cogniscan_orchestrator::{PredictionRequest, PredictionService, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServiceConfig::load()?;
//!     let service = PredictionService::from_config(&config).await?;
//!
//!     let scan = std::fs::read("scan.png")?;
//!     let report = service
//!         .predict(PredictionRequest::new(scan, ClinicalRecord::default()))
//!         .await?;
//!     println!("{} ({:.4})", report.result.label(), report.result.confidence());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod orchestrator;
pub mod service;

pub use config::{
    BackboneConfig, ConfigError, InferenceConfig, ModelConfig, ServerConfig, ServiceConfig,
};
pub use context::{load_classifier, ModelContext};
pub use orchestrator::InferenceOrchestrator;
pub use service::{
    PersistenceStatus, PredictionReport, PredictionRequest, PredictionService, ANONYMOUS_SUBJECT,
};
