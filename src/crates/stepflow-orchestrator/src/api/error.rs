//! API error types and HTTP response conversion.
//!
//! Converts `OrchestratorError` into an HTTP status plus a stable JSON body,
//! the way the teacher's own `api/error.rs` converts its `DatabaseError`.

use crate::error::OrchestratorError;
use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    pub code: String,
}

impl ApiErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            code: code.into(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("validation failed: {0}")]
    ValidationError(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal server error: {0}")]
    InternalError(String),

    #[error("json error: {0}")]
    JsonError(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::JsonError(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::ValidationError(_) => "VALIDATION_ERROR",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::InternalError(_) => "INTERNAL_ERROR",
            ApiError::JsonError(_) => "JSON_ERROR",
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NotFound",
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::ValidationError(_) => "ValidationError",
            ApiError::Conflict(_) => "Conflict",
            ApiError::InternalError(_) => "InternalError",
            ApiError::JsonError(_) => "JsonError",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ApiErrorResponse::new(self.error_type(), self.to_string(), self.code());
        tracing::error!(error = ?body, "api error");
        (status, Json(body)).into_response()
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::JsonError(err.to_string())
    }
}

/// Maps the kernel/runtime error taxonomy (spec §7) onto the four HTTP-facing
/// buckets above. `Core`/`Store` variants that aren't specifically a
/// not-found or conflict default to `InternalError`.
impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match &err {
            OrchestratorError::UnknownFlow(_) => ApiError::NotFound(err.to_string()),
            OrchestratorError::Store(stepflow_store::StoreError::UnknownRun(_)) => ApiError::NotFound(err.to_string()),
            OrchestratorError::Conflict { .. } => ApiError::Conflict(err.to_string()),
            OrchestratorError::InvalidParams(_) | OrchestratorError::InvalidSpec(_) => ApiError::ValidationError(err.to_string()),
            OrchestratorError::StackOverflow(_) => ApiError::ValidationError(err.to_string()),
            OrchestratorError::IllegalTransition { .. } => ApiError::ValidationError(err.to_string()),
            _ => ApiError::InternalError(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let err = ApiError::NotFound("run".to_string());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn validation_maps_to_422() {
        let err = ApiError::ValidationError("bad node_spec".to_string());
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn conflict_maps_to_409() {
        let err = ApiError::Conflict("stale etag".to_string());
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn unknown_flow_becomes_not_found() {
        let err: ApiError = OrchestratorError::UnknownFlow("missing".to_string()).into();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[test]
    fn stack_overflow_becomes_validation_error() {
        let err: ApiError = OrchestratorError::StackOverflow("run-1".to_string()).into();
        assert!(matches!(err, ApiError::ValidationError(_)));
    }
}
