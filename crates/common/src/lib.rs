/// Common types and utilities for the dementia-staging inference pipeline
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub mod tensor;

pub use tensor::{ClinicalVector, FusionLogits, ImageTensor, TokenFeatures};

/// Side length of the square model input (pixels)
pub const IMAGE_SIZE: u32 = 224;

/// Number of colour channels in the model input
pub const IMAGE_CHANNELS: usize = 3;

/// Length of the encoded clinical feature vector
pub const CLINICAL_FEATURES: usize = 4;

/// Number of diagnostic classes
pub const NUM_CLASSES: usize = 3;

/// Stable error category reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DecodeError,
    ShapeMismatch,
    ModelUnavailable,
    SaliencyGeneration,
    DownstreamPersistence,
    Timeout,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DecodeError => "decode_error",
            Self::ShapeMismatch => "shape_mismatch",
            Self::ModelUnavailable => "model_unavailable",
            Self::SaliencyGeneration => "saliency_generation",
            Self::DownstreamPersistence => "downstream_persistence",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inference errors
///
/// The `Display` text carries internal detail for logs. Callers only ever see
/// [`InferenceError::kind`] and [`InferenceError::public_message`].
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Saliency generation failed: {0}")]
    SaliencyGeneration(String),

    #[error("Failed to persist prediction: {0}")]
    DownstreamPersistence(String),

    #[error("Inference timed out after {0}s")]
    Timeout(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl InferenceError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Decode(_) => ErrorKind::DecodeError,
            Self::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
            Self::ModelUnavailable(_) => ErrorKind::ModelUnavailable,
            Self::SaliencyGeneration(_) => ErrorKind::SaliencyGeneration,
            Self::DownstreamPersistence(_) => ErrorKind::DownstreamPersistence,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Generic, caller-safe description of the failure
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Decode(_) => "The uploaded file could not be read as an image.",
            Self::ShapeMismatch { .. } => "The submitted data does not have the expected shape.",
            Self::ModelUnavailable(_) => "The diagnostic model is currently unavailable.",
            Self::SaliencyGeneration(_) => "The explanation overlay could not be generated.",
            Self::DownstreamPersistence(_) => {
                "The prediction was computed but could not be recorded."
            }
            Self::Timeout(_) => "The request took too long to process.",
            Self::Internal(_) => "An unexpected error occurred.",
        }
    }

    /// Whether the failure was caused by the request payload
    #[must_use]
    pub fn is_client_fault(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::ShapeMismatch { .. })
    }
}

impl From<image::ImageError> for InferenceError {
    fn from(err: image::ImageError) -> Self {
        InferenceError::Decode(err.to_string())
    }
}

/// Result type for inference operations
pub type Result<T> = std::result::Result<T, InferenceError>;

/// Diagnostic class predicted by the fusion classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosisLabel {
    /// Cognitively normal
    #[serde(rename = "CN")]
    CognitivelyNormal,
    /// Mild cognitive impairment
    #[serde(rename = "MCI")]
    MildCognitiveImpairment,
    /// Probable Alzheimer's disease
    #[serde(rename = "AD")]
    AlzheimersDisease,
}

impl DiagnosisLabel {
    /// Labels in model output order
    pub const ALL: [DiagnosisLabel; NUM_CLASSES] = [
        Self::CognitivelyNormal,
        Self::MildCognitiveImpairment,
        Self::AlzheimersDisease,
    ];

    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            Self::CognitivelyNormal => 0,
            Self::MildCognitiveImpairment => 1,
            Self::AlzheimersDisease => 2,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CognitivelyNormal => "CN",
            Self::MildCognitiveImpairment => "MCI",
            Self::AlzheimersDisease => "AD",
        }
    }

    /// Inverse of [`as_str`](Self::as_str)
    #[must_use]
    pub fn parse(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|label| label.as_str() == code)
    }

    /// Stage implied by a Clinical Dementia Rating (0 → CN, 0.5 → MCI, ≥1 → AD)
    ///
    /// This is the labelling rule of the training data. It is never used to
    /// override a model prediction.
    #[must_use]
    pub fn from_cdr(cdr: f32) -> Self {
        if cdr <= 0.0 {
            Self::CognitivelyNormal
        } else if cdr < 1.0 {
            Self::MildCognitiveImpairment
        } else {
            Self::AlzheimersDisease
        }
    }
}

impl fmt::Display for DiagnosisLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorded gender of the subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Gender {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
}

impl Gender {
    /// Lenient parse: `F` in any case is female, everything else is male
    #[must_use]
    pub fn parse_lenient(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("f") {
            Self::Female
        } else {
            Self::Male
        }
    }

    /// Numeric code used by the clinical encoder (M → 0, F → 1)
    #[must_use]
    pub fn code(&self) -> f32 {
        match self {
            Self::Male => 0.0,
            Self::Female => 1.0,
        }
    }
}

fn lenient_gender<'de, D>(deserializer: D) -> std::result::Result<Option<Gender>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().map(Gender::parse_lenient))
}

/// Clinical covariates submitted alongside a scan
///
/// Every field is optional. Defaults are substituted by the clinical encoder,
/// never here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClinicalRecord {
    /// Age in years
    pub age: Option<u32>,
    #[serde(deserialize_with = "lenient_gender")]
    pub gender: Option<Gender>,
    /// Mini-Mental State Examination score (0-30)
    pub mmse: Option<f32>,
    /// Clinical Dementia Rating
    pub cdr: Option<f32>,
}

impl ClinicalRecord {
    /// Build a record from untyped form fields
    ///
    /// Fields that are blank or fail to parse are left absent.
    #[must_use]
    pub fn from_form_fields(
        age: Option<&str>,
        gender: Option<&str>,
        mmse: Option<&str>,
        cdr: Option<&str>,
    ) -> Self {
        Self {
            age: age.and_then(parse_age),
            gender: gender
                .filter(|g| !g.trim().is_empty())
                .map(Gender::parse_lenient),
            mmse: mmse.and_then(parse_finite),
            cdr: cdr.and_then(parse_finite),
        }
    }
}

fn parse_finite(raw: &str) -> Option<f32> {
    raw.trim().parse::<f32>().ok().filter(|v| v.is_finite())
}

fn parse_age(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    raw.parse::<u32>().ok().or_else(|| {
        parse_finite(raw)
            .filter(|v| *v >= 0.0 && *v <= u32::MAX as f32)
            .map(|v| v as u32)
    })
}

/// Final output of one inference request
///
/// Fields are private so a result cannot be altered after it is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    id: Uuid,
    label: DiagnosisLabel,
    confidence: f32,
    probabilities: [f32; NUM_CLASSES],
    saliency_overlay_ref: Option<String>,
}

impl ClassificationResult {
    /// Package class probabilities into a result (argmax label, max confidence)
    #[must_use]
    pub fn from_probabilities(
        id: Uuid,
        probabilities: [f32; NUM_CLASSES],
        saliency_overlay_ref: Option<String>,
    ) -> Self {
        let (index, confidence) = probabilities.iter().copied().enumerate().fold(
            (0, f32::NEG_INFINITY),
            |best, (i, p)| if p > best.1 { (i, p) } else { best },
        );

        Self {
            id,
            label: DiagnosisLabel::ALL[index],
            confidence: confidence.clamp(0.0, 1.0),
            probabilities,
            saliency_overlay_ref,
        }
    }

    /// Overlay reference derived from a result id
    #[must_use]
    pub fn overlay_reference(id: &Uuid) -> String {
        format!("saliency_{}.png", id.simple())
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn label(&self) -> DiagnosisLabel {
        self.label
    }

    #[must_use]
    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    #[must_use]
    pub fn probabilities(&self) -> [f32; NUM_CLASSES] {
        self.probabilities
    }

    /// Reference of the stored saliency overlay, `None` when unavailable
    #[must_use]
    pub fn saliency_overlay_ref(&self) -> Option<&str> {
        self.saliency_overlay_ref.as_deref()
    }

    #[must_use]
    pub fn has_overlay(&self) -> bool {
        self.saliency_overlay_ref.is_some()
    }
}

/// Round a confidence to four decimal places for reporting
#[must_use]
pub fn round_confidence(confidence: f32) -> f64 {
    (f64::from(confidence) * 10_000.0).round() / 10_000.0
}
