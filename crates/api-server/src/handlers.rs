//! HTTP request handlers for API endpoints

use axum::{
    extract::{Multipart, Path, Query, State},
    http::header,
    response::IntoResponse,
    Json,
};
use cogniscan_common::ClinicalRecord;
use cogniscan_orchestrator::{PredictionRequest, ANONYMOUS_SUBJECT};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::{
    error::ApiError,
    types::{HealthResponse, HistoryEntry, HistoryQuery, PredictResponse},
    ApiState,
};

/// Entries returned by `/api/history` when no limit is given
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

const FORM_FIELDS: [&str; 5] = ["age", "gender", "mmse", "cdr", "subject"];

/// Health check endpoint
pub async fn health_check(State(state): State<ApiState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model_loaded: state.service.model_loaded(),
    })
}

/// Retry loading the model after a failed startup
pub async fn reload_model(
    State(state): State<ApiState>,
) -> Result<Json<HealthResponse>, ApiError> {
    info!("Model reload requested");
    state.service.reload_model().await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model_loaded: state.service.model_loaded(),
    }))
}

/// Classify an uploaded scan
///
/// Multipart fields: `image` (required), `age`, `gender`, `mmse`, `cdr`, `subject`.
/// Clinical fields that are missing or unparsable are treated as absent.
pub async fn predict(
    State(state): State<ApiState>,
    mut multipart: Multipart,
) -> Result<Json<PredictResponse>, ApiError> {
    let mut image: Option<Vec<u8>> = None;
    let mut fields: HashMap<String, String> = HashMap::with_capacity(FORM_FIELDS.len());

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "image" {
            image = Some(field.bytes().await?.to_vec());
        } else if FORM_FIELDS.contains(&name.as_str()) {
            let value = field.text().await?;
            fields.insert(name, value);
        } else {
            debug!("Ignoring form field {:?}", name);
        }
    }

    let image = image.ok_or(ApiError::BadRequest("No image uploaded."))?;
    let field = |name: &str| fields.get(name).map(String::as_str);
    let clinical =
        ClinicalRecord::from_form_fields(field("age"), field("gender"), field("mmse"), field("cdr"));
    let subject = field("subject")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(ANONYMOUS_SUBJECT)
        .to_string();

    info!(
        "Prediction request: subject={}, {} bytes",
        subject,
        image.len()
    );

    let request = PredictionRequest::new(image, clinical).for_subject(subject);
    let report = state.service.predict(request).await?;
    Ok(Json(report.into()))
}

/// Serve a stored saliency overlay
pub async fn get_result(
    State(state): State<ApiState>,
    Path(reference): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let bytes = state.service.overlay(&reference).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], bytes))
}

/// A subject's predictions, newest first
pub async fn get_history(
    State(state): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let subject = query.subject.as_deref().unwrap_or(ANONYMOUS_SUBJECT);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);

    let records = state.service.history(subject, limit).await?;
    Ok(Json(records.into_iter().map(HistoryEntry::from).collect()))
}
