//! Prediction service: orchestrator plus persistence and recommendations
use crate::config::ServiceConfig;
use crate::context::ModelContext;
use crate::orchestrator::InferenceOrchestrator;
use chrono::{DateTime, Utc};
use cogniscan_common::{ClassificationResult, ClinicalRecord, ErrorKind, InferenceError};
use cogniscan_preprocessing::ImagePreprocessor;
use cogniscan_saliency::SaliencyGenerator;
use cogniscan_storage::{
    DoctorDirectory, DoctorProfile, NewPrediction, PredictionRecord, PredictionStore,
    StorageBackends, StorageError,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Subject recorded when the caller does not name one
pub const ANONYMOUS_SUBJECT: &str = "anonymous";

/// One prediction request
#[derive(Debug, Clone)]
pub struct PredictionRequest {
    pub image: Vec<u8>,
    pub clinical: ClinicalRecord,
    pub subject_id: String,
}

impl PredictionRequest {
    #[must_use]
    pub fn new(image: Vec<u8>, clinical: ClinicalRecord) -> Self {
        Self {
            image,
            clinical,
            subject_id: ANONYMOUS_SUBJECT.to_string(),
        }
    }

    #[must_use]
    pub fn for_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = subject_id.into();
        self
    }
}

/// What happened when the prediction was recorded
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PersistenceStatus {
    Stored {
        record_id: Uuid,
        created_at: DateTime<Utc>,
    },
    Failed {
        kind: ErrorKind,
        message: &'static str,
    },
}

impl PersistenceStatus {
    #[must_use]
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored { .. })
    }
}

/// A classification with its persistence outcome and suggested doctors
///
/// A persistence failure never changes `result`.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionReport {
    pub result: ClassificationResult,
    pub persistence: PersistenceStatus,
    pub suggested_doctors: Vec<DoctorProfile>,
}

pub struct PredictionService {
    orchestrator: Arc<InferenceOrchestrator>,
    predictions: Arc<dyn PredictionStore>,
    doctors: Arc<dyn DoctorDirectory>,
    top_n_doctors: usize,
}

impl PredictionService {
    pub fn new(
        orchestrator: Arc<InferenceOrchestrator>,
        predictions: Arc<dyn PredictionStore>,
        doctors: Arc<dyn DoctorDirectory>,
        top_n_doctors: usize,
    ) -> Self {
        Self {
            orchestrator,
            predictions,
            doctors,
            top_n_doctors,
        }
    }

    /// Wire everything `config` describes; the model itself loads on first use
    pub async fn from_config(config: &ServiceConfig) -> Result<Self, StorageError> {
        let backends = StorageBackends::connect(&config.storage).await?;
        let model = Arc::new(ModelContext::from_config(config.model.clone()));
        Ok(Self::from_parts(config, model, backends))
    }

    /// Wire a service around an existing model context and storage
    pub fn from_parts(
        config: &ServiceConfig,
        model: Arc<ModelContext>,
        backends: StorageBackends,
    ) -> Self {
        let orchestrator = InferenceOrchestrator::new(
            model,
            ImagePreprocessor::new(config.preprocessing.clone()),
            SaliencyGenerator::new(config.saliency.clone()),
            backends.artifacts,
        )
        .with_timeout(config.inference.request_timeout());

        Self::new(
            Arc::new(orchestrator),
            backends.predictions,
            backends.doctors,
            config.inference.top_n_doctors,
        )
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<InferenceOrchestrator> {
        &self.orchestrator
    }

    #[must_use]
    pub fn model_loaded(&self) -> bool {
        self.orchestrator.model().is_loaded()
    }

    /// Load the model now instead of on the first request
    pub async fn warm_up(&self) -> Result<(), InferenceError> {
        let model = self.orchestrator.model().clone();
        tokio::task::spawn_blocking(move || model.get().map(|_| ()))
            .await
            .map_err(|e| InferenceError::Internal(format!("model load task failed: {e}")))?
    }

    /// Retry a failed model load, e.g. after the checkpoint files were put in place
    ///
    /// A loaded model is left as is.
    pub async fn reload_model(&self) -> Result<(), InferenceError> {
        self.orchestrator.model().reload();
        self.warm_up().await
    }

    /// Classify, record and recommend
    ///
    /// # Errors
    /// Only classification errors; persistence and recommendation failures are
    /// reported inside the [`PredictionReport`].
    pub async fn predict(
        &self,
        request: PredictionRequest,
    ) -> Result<PredictionReport, InferenceError> {
        let PredictionRequest {
            image,
            clinical,
            subject_id,
        } = request;

        let result = self.orchestrator.run(image, &clinical).await?;

        let persistence = match self
            .predictions
            .store_prediction(NewPrediction::from_result(subject_id, &clinical, &result))
            .await
        {
            Ok(record) => {
                info!(
                    "Recorded prediction {} as {}",
                    result.id(),
                    record.record_id
                );
                PersistenceStatus::Stored {
                    record_id: record.record_id,
                    created_at: record.created_at,
                }
            }
            Err(e) => {
                error!("Failed to record prediction {}: {}", result.id(), e);
                let err = InferenceError::from(e);
                PersistenceStatus::Failed {
                    kind: err.kind(),
                    message: err.public_message(),
                }
            }
        };

        let suggested_doctors = match self
            .doctors
            .recommend_for(result.label(), self.top_n_doctors)
            .await
        {
            Ok(doctors) => doctors,
            Err(e) => {
                warn!("Doctor lookup failed for {}: {}", result.label(), e);
                Vec::new()
            }
        };

        Ok(PredictionReport {
            result,
            persistence,
            suggested_doctors,
        })
    }

    /// A subject's predictions, newest first
    pub async fn history(
        &self,
        subject_id: &str,
        limit: usize,
    ) -> Result<Vec<PredictionRecord>, InferenceError> {
        Ok(self.predictions.list_predictions(subject_id, limit).await?)
    }

    /// Stored overlay bytes
    pub async fn overlay(&self, reference: &str) -> Result<Vec<u8>, StorageError> {
        self.orchestrator
            .artifacts()
            .retrieve_artifact(reference)
            .await
    }
}
