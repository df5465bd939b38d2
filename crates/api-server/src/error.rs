//! HTTP error mapping
//!
//! Responses carry only an error kind and a generic message; internal detail is
//! logged here and never sent to the caller.

use crate::types::ErrorResponse;
use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cogniscan_common::{ErrorKind, InferenceError};
use cogniscan_storage::StorageError;
use tracing::{error, warn};

#[derive(Debug)]
pub enum ApiError {
    Inference(InferenceError),
    Multipart(MultipartError),
    BadRequest(&'static str),
    NotFound,
}

impl From<InferenceError> for ApiError {
    fn from(err: InferenceError) -> Self {
        Self::Inference(err)
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self::Multipart(err)
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(_) => Self::NotFound,
            StorageError::InvalidReference(_) => Self::BadRequest("Invalid result reference."),
            other => Self::Inference(other.into()),
        }
    }
}

/// Status code for each error kind
#[must_use]
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::DecodeError | ErrorKind::ShapeMismatch => StatusCode::BAD_REQUEST,
        ErrorKind::ModelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::DownstreamPersistence => StatusCode::BAD_GATEWAY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::SaliencyGeneration | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(status: StatusCode, error: &str, message: &str) -> Response {
    let body = ErrorResponse {
        error: error.to_string(),
        message: message.to_string(),
    };
    (status, Json(body)).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Inference(err) => {
                let kind = err.kind();
                if err.is_client_fault() {
                    warn!("Rejected request: {}", err);
                } else {
                    error!("Request failed: {}", err);
                }
                api_error(status_for(kind), kind.as_str(), err.public_message())
            }
            Self::Multipart(err) => {
                warn!("Malformed upload: {}", err);
                let status = err.status();
                let message = if status == StatusCode::PAYLOAD_TOO_LARGE {
                    "The upload exceeds the maximum accepted size."
                } else {
                    "The upload could not be read as multipart form data."
                };
                api_error(status, "bad_request", message)
            }
            Self::BadRequest(message) => api_error(StatusCode::BAD_REQUEST, "bad_request", message),
            Self::NotFound => api_error(StatusCode::NOT_FOUND, "not_found", "No such result."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::DecodeError), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::ShapeMismatch), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(ErrorKind::ModelUnavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(ErrorKind::DownstreamPersistence),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(ErrorKind::Internal),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_storage_errors() {
        assert!(matches!(
            ApiError::from(StorageError::NotFound("x.png".into())),
            ApiError::NotFound
        ));
        assert!(matches!(
            ApiError::from(StorageError::InvalidReference("../x".into())),
            ApiError::BadRequest(_)
        ));
        let response = ApiError::from(StorageError::S3Error("timeout".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_internal_detail_not_exposed() {
        let response =
            ApiError::from(InferenceError::ModelUnavailable("/models/vit.onnx missing".into()))
                .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
