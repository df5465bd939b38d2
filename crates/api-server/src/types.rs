//! API request and response types

use cogniscan_common::{round_confidence, DiagnosisLabel, Gender};
use cogniscan_orchestrator::{PersistenceStatus, PredictionReport};
use cogniscan_storage::{DoctorProfile, PredictionRecord};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether the classifier has been loaded
    pub model_loaded: bool,
}

/// Class probabilities keyed by label code
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassProbabilities {
    #[serde(rename = "CN")]
    pub cn: f64,
    #[serde(rename = "MCI")]
    pub mci: f64,
    #[serde(rename = "AD")]
    pub ad: f64,
}

impl From<[f32; 3]> for ClassProbabilities {
    fn from(p: [f32; 3]) -> Self {
        Self {
            cn: round_confidence(p[0]),
            mci: round_confidence(p[1]),
            ad: round_confidence(p[2]),
        }
    }
}

/// `POST /api/predict` response
#[derive(Debug, Clone, Serialize)]
pub struct PredictResponse {
    pub id: Uuid,
    pub prediction: DiagnosisLabel,
    /// Rounded to four decimal places
    pub confidence: f64,
    pub probabilities: ClassProbabilities,
    /// Overlay reference, served at `/results/{reference}`; null when unavailable
    pub grad_cam_image: Option<String>,
    #[serde(rename = "suggestedDoctors")]
    pub suggested_doctors: Vec<DoctorProfile>,
    pub persistence: PersistenceStatus,
}

impl From<PredictionReport> for PredictResponse {
    fn from(report: PredictionReport) -> Self {
        let result = report.result;
        Self {
            id: result.id(),
            prediction: result.label(),
            confidence: round_confidence(result.confidence()),
            probabilities: result.probabilities().into(),
            grad_cam_image: result.saliency_overlay_ref().map(str::to_string),
            suggested_doctors: report.suggested_doctors,
            persistence: report.persistence,
        }
    }
}

/// `GET /api/history` query
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryQuery {
    pub subject: Option<String>,
    pub limit: Option<usize>,
}

/// One entry of a subject's history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub result_id: Uuid,
    pub subject_id: String,
    pub age: Option<u32>,
    pub gender: Option<Gender>,
    pub mmse: Option<f32>,
    pub cdr: Option<f32>,
    pub prediction: DiagnosisLabel,
    pub confidence: f64,
    pub grad_cam_image: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<PredictionRecord> for HistoryEntry {
    fn from(record: PredictionRecord) -> Self {
        let p = record.prediction;
        Self {
            id: record.record_id,
            result_id: p.result_id,
            subject_id: p.subject_id,
            age: p.clinical.age,
            gender: p.clinical.gender,
            mmse: p.clinical.mmse,
            cdr: p.clinical.cdr,
            prediction: p.label,
            confidence: round_confidence(p.confidence),
            grad_cam_image: p.overlay_ref,
            created_at: record.created_at,
        }
    }
}

/// Error body: a stable kind and a generic message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use cogniscan_common::ClassificationResult;
    use cogniscan_orchestrator::PersistenceStatus;

    #[test]
    fn test_predict_response_shape() {
        let id = Uuid::new_v4();
        let report = PredictionReport {
            result: ClassificationResult::from_probabilities(id, [0.123_456, 0.8, 0.076_544], None),
            persistence: PersistenceStatus::Failed {
                kind: cogniscan_common::ErrorKind::DownstreamPersistence,
                message: "The prediction was computed but could not be recorded.",
            },
            suggested_doctors: Vec::new(),
        };

        let json = serde_json::to_value(PredictResponse::from(report)).unwrap();
        assert_eq!(json["prediction"], "MCI");
        assert_eq!(json["confidence"], 0.8);
        assert_eq!(json["probabilities"]["CN"], 0.1235);
        assert!(json["grad_cam_image"].is_null());
        assert_eq!(json["suggestedDoctors"], serde_json::json!([]));
        assert_eq!(json["persistence"]["status"], "failed");
        assert_eq!(json["persistence"]["kind"], "downstream_persistence");
    }
}
