//! Two-branch fusion classifier for dementia staging
//!
//! A frozen visual backbone turns the scan into a global embedding plus per-patch
//! token features. A small clinical MLP embeds the four covariates. The two
//! embeddings are concatenated and a dense head produces three logits (CN, MCI, AD).
//!
//! Everything runs in inference mode: BatchNorm uses its running statistics and
//! Dropout is the identity, so single-sample batches are supported.
//!
//! Two backbones are provided:
//! - [`OnnxVitBackbone`]: a ViT-B/16 feature extractor exported to ONNX
//! - [`LinearPatchBackbone`]: a pure-ndarray 16x16 patch projection with ViT key names,
//!   used where no ONNX model is available
//!
//! # Example
//! ```no_run
//! use cogniscan_common::{ClinicalVector, ImageTensor};
//! use cogniscan_fusion_model::{FusionClassifier, FusionHead, LinearPatchBackbone};
//! use ndarray::Array3;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backbone = LinearPatchBackbone::seeded(64, 7);
//! let head = FusionHead::seeded(64, 7);
//! let classifier = FusionClassifier::new(Box::new(backbone), head)?;
//!
//! let image = ImageTensor::new(Array3::zeros((3, 224, 224)))?;
//! let clinical = ClinicalVector::new([70.0, 1.0, 22.0, 0.5]);
//! let output = classifier.forward(&image, &clinical)?;
//! println!("probabilities: {:?}", output.logits.softmax());
//! # Ok(())
//! # }
//! ```

pub mod backbone;
pub mod classifier;
pub mod head;
pub mod layers;
pub mod onnx;
pub mod patch;
pub mod weights;

pub use backbone::{BackboneOutput, VisualBackbone};
pub use classifier::{FusionClassifier, FusionOutput};
pub use head::{ClassifierHead, ClinicalMlp, FusionHead};
pub use onnx::{OnnxError, OnnxVitBackbone};
pub use patch::LinearPatchBackbone;
pub use weights::{WeightError, WeightMap};

use cogniscan_common::InferenceError;
use thiserror::Error;

/// Errors raised while loading or running the fusion model
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("ONNX Runtime error: {0}")]
    OrtError(#[from] ort::Error),

    #[error("Failed to create backbone session: {0}")]
    Session(#[from] OnnxError),

    #[error("Weight loading error: {0}")]
    Weights(#[from] WeightError),

    #[error("No checkpoint configured for the {0}")]
    NoCheckpoint(&'static str),

    #[error("Invalid backbone output: {0}")]
    InvalidOutput(String),
}

impl ModelError {
    /// Whether the error happened while loading rather than running the model
    #[must_use]
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self,
            Self::Session(_) | Self::Weights(_) | Self::NoCheckpoint(_)
        )
    }
}

impl From<ModelError> for InferenceError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::ShapeMismatch {
                what,
                expected,
                actual,
            } => InferenceError::ShapeMismatch {
                what,
                expected,
                actual,
            },
            ModelError::Session(_) | ModelError::Weights(_) | ModelError::NoCheckpoint(_) => {
                InferenceError::ModelUnavailable(err.to_string())
            }
            ModelError::OrtError(_) | ModelError::InvalidOutput(_) => {
                InferenceError::Internal(err.to_string())
            }
        }
    }
}
