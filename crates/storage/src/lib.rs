//! Storage layer for the dementia-staging service
//!
//! Three collaborators sit behind the inference pipeline:
//! - **Artifacts** ([`ArtifactStore`]): saliency overlay PNGs, on the local filesystem or S3/MinIO
//! - **Predictions** ([`PredictionStore`]): one record per classification, listed per subject
//! - **Doctors** ([`DoctorDirectory`]): specialist recommendations ranked by rating
//!
//! Predictions and doctors live in `PostgreSQL` when it is configured and in memory otherwise.
//!
//! # Example
//!
//! ```rust,no_run
//! use cogniscan_storage::{StorageBackends, StorageConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backends = StorageBackends::connect(&StorageConfig::default()).await?;
//!
//!     backends.artifacts.store_artifact("saliency_demo.png", b"png bytes").await?;
//!     let overlay = backends.artifacts.retrieve_artifact("saliency_demo.png").await?;
//!     assert_eq!(overlay, b"png bytes");
//!
//!     Ok(())
//! }
//! ```

use chrono::{DateTime, Utc};
use cogniscan_common::{
    ClassificationResult, ClinicalRecord, DiagnosisLabel, InferenceError, NUM_CLASSES,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub mod metadata_storage;
pub mod object_storage;

pub use metadata_storage::{
    specialization_for, DoctorDirectory, InMemoryDoctorDirectory, InMemoryPredictionStore,
    DEFAULT_MAX_RECORDS,
    PostgresConfig, PostgresStorage, PredictionStore,
};
pub use object_storage::{ArtifactStore, LocalArtifactStore, S3ArtifactStore, S3Config};

/// Storage layer errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("S3 error: {0}")]
    S3Error(String),

    #[error("PostgreSQL error: {0}")]
    PostgresError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid artifact reference: {0:?}")]
    InvalidReference(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<StorageError> for InferenceError {
    fn from(err: StorageError) -> Self {
        InferenceError::DownstreamPersistence(err.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Reject references that could escape the artifact root
///
/// A reference is a single file name: non-empty, no path separators, no `..`.
pub fn validate_reference(reference: &str) -> StorageResult<()> {
    let invalid = reference.is_empty()
        || reference.contains(['/', '\\', '\0'])
        || reference.contains("..");
    if invalid {
        return Err(StorageError::InvalidReference(reference.to_string()));
    }
    Ok(())
}

fn default_results_dir() -> PathBuf {
    std::env::var("COGNISCAN_RESULTS_DIR")
        .map_or_else(|_| PathBuf::from("results/grad_cam"), PathBuf::from)
}

/// Complete storage configuration for all backends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for overlays when S3 is not configured
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    /// S3/MinIO for overlays
    #[serde(default)]
    pub s3: Option<S3Config>,

    /// `PostgreSQL` for predictions and doctors
    #[serde(default)]
    pub postgres: Option<PostgresConfig>,

    /// Doctor profiles to seed the directory with
    #[serde(default)]
    pub doctors: Vec<DoctorProfile>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
            s3: None,
            postgres: None,
            doctors: Vec::new(),
        }
    }
}

/// A classification ready to be recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPrediction {
    /// Id of the [`ClassificationResult`] this records
    pub result_id: Uuid,

    /// Whose scan this was
    pub subject_id: String,

    /// Clinical inputs as submitted
    pub clinical: ClinicalRecord,

    pub label: DiagnosisLabel,

    pub confidence: f32,

    /// `[p_CN, p_MCI, p_AD]`
    pub probabilities: [f32; NUM_CLASSES],

    /// Saliency overlay reference, if one was stored
    pub overlay_ref: Option<String>,
}

impl NewPrediction {
    #[must_use]
    pub fn from_result(
        subject_id: impl Into<String>,
        clinical: &ClinicalRecord,
        result: &ClassificationResult,
    ) -> Self {
        Self {
            result_id: result.id(),
            subject_id: subject_id.into(),
            clinical: clinical.clone(),
            label: result.label(),
            confidence: result.confidence(),
            probabilities: result.probabilities(),
            overlay_ref: result.saliency_overlay_ref().map(str::to_string),
        }
    }
}

/// A stored prediction with the identity and timestamp assigned by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub record_id: Uuid,

    pub created_at: DateTime<Utc>,

    #[serde(flatten)]
    pub prediction: NewPrediction,
}

/// A specialist who can be recommended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoctorProfile {
    pub id: String,

    pub name: String,

    /// e.g. "Neurologist"
    pub specialization: String,

    /// Average review rating (0.0 to 5.0)
    #[serde(default)]
    pub rating: f32,

    #[serde(default)]
    pub location: Option<String>,
}

/// The three collaborators, built from a [`StorageConfig`]
#[derive(Clone)]
pub struct StorageBackends {
    pub artifacts: Arc<dyn ArtifactStore>,
    pub predictions: Arc<dyn PredictionStore>,
    pub doctors: Arc<dyn DoctorDirectory>,
}

impl StorageBackends {
    /// Connect every configured backend, falling back to local and in-memory stores
    pub async fn connect(config: &StorageConfig) -> StorageResult<Self> {
        let artifacts: Arc<dyn ArtifactStore> = match &config.s3 {
            Some(s3) => {
                info!("Storing overlays in S3 bucket {}", s3.bucket);
                Arc::new(S3ArtifactStore::new(s3.clone()).await?)
            }
            None => {
                info!("Storing overlays in {}", config.results_dir.display());
                Arc::new(LocalArtifactStore::new(&config.results_dir)?)
            }
        };

        match &config.postgres {
            Some(pg) => {
                let postgres = Arc::new(PostgresStorage::new(pg.clone()).await?);
                postgres.init_schema().await?;
                for doctor in &config.doctors {
                    postgres.upsert_doctor(doctor).await?;
                }
                Ok(Self {
                    artifacts,
                    predictions: postgres.clone(),
                    doctors: postgres,
                })
            }
            None => Ok(Self {
                artifacts,
                predictions: Arc::new(InMemoryPredictionStore::new()),
                doctors: Arc::new(InMemoryDoctorDirectory::new(config.doctors.clone())),
            }),
        }
    }

    /// Local overlays under `results_dir`, everything else in memory
    pub fn local(
        results_dir: impl Into<PathBuf>,
        doctors: Vec<DoctorProfile>,
    ) -> StorageResult<Self> {
        Ok(Self {
            artifacts: Arc::new(LocalArtifactStore::new(results_dir.into())?),
            predictions: Arc::new(InMemoryPredictionStore::new()),
            doctors: Arc::new(InMemoryDoctorDirectory::new(doctors)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_reference() {
        assert!(validate_reference("saliency_0a1b2c.png").is_ok());
        for bad in ["", "../secret", "a/b.png", "a\\b.png", "..", "x..png"] {
            assert!(
                matches!(validate_reference(bad), Err(StorageError::InvalidReference(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_storage_error_is_downstream_persistence() {
        let err: InferenceError = StorageError::PostgresError("connection refused".into()).into();
        assert_eq!(err.kind(), cogniscan_common::ErrorKind::DownstreamPersistence);
    }

    #[test]
    fn test_storage_config_from_yaml() {
        let config: StorageConfig = serde_yaml::from_str(
            r"
results_dir: /tmp/overlays
doctors:
  - id: d1
    name: Dr. Rao
    specialization: Neurologist
    rating: 4.5
",
        )
        .unwrap();
        assert_eq!(config.results_dir, PathBuf::from("/tmp/overlays"));
        assert!(config.s3.is_none());
        assert!(config.postgres.is_none());
        assert_eq!(config.doctors.len(), 1);
        assert_eq!(config.doctors[0].location, None);
    }

    #[test]
    fn test_new_prediction_from_result() {
        let id = Uuid::new_v4();
        let result = ClassificationResult::from_probabilities(
            id,
            [0.2, 0.7, 0.1],
            Some(ClassificationResult::overlay_reference(&id)),
        );
        let clinical = ClinicalRecord {
            age: Some(70),
            ..Default::default()
        };
        let prediction = NewPrediction::from_result("subject-1", &clinical, &result);
        assert_eq!(prediction.result_id, id);
        assert_eq!(prediction.label, DiagnosisLabel::MildCognitiveImpairment);
        assert_eq!(prediction.confidence, 0.7);
        assert_eq!(
            prediction.overlay_ref.as_deref(),
            result.saliency_overlay_ref()
        );
    }
}
