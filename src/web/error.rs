//! API error responses.

use crate::db::DbError;
use crate::registry::RegistryError;
use crate::status_page::StatusPageError;
use crate::telemetry::CorrelateError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

/// JSON error body: `{"error": "...", "field": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    field: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            field: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            field: Some(field.into()),
        }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        tracing::error!("Request failed: {}", err);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.field {
            Some(field) => json!({ "error": self.message, "field": field }),
            None => json!({ "error": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound => Self::new(StatusCode::NOT_FOUND, "not found"),
            DbError::Conflict(what) => Self::new(StatusCode::CONFLICT, format!("{} already exists", what)),
            other => Self::internal(other),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Validation(v) => Self::invalid_field(v.field, v.to_string()),
            RegistryError::NotFound => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            RegistryError::DuplicateName | RegistryError::RetentionLocked => {
                Self::new(StatusCode::CONFLICT, err.to_string())
            }
            RegistryError::Store(e) => Self::internal(e),
        }
    }
}

impl From<StatusPageError> for ApiError {
    fn from(err: StatusPageError) -> Self {
        match err {
            StatusPageError::NotFound => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            StatusPageError::Invalid { field, .. } => Self::invalid_field(field, err.to_string()),
            StatusPageError::UnknownEndpoint(_) => Self::invalid_field("endpoint_ids", err.to_string()),
            StatusPageError::NotLocked => Self::bad_request(err.to_string()),
            StatusPageError::SlugTaken => Self::new(StatusCode::CONFLICT, err.to_string()),
            StatusPageError::InvalidPassword => Self::new(StatusCode::UNAUTHORIZED, err.to_string()),
            StatusPageError::Store(e) => Self::internal(e),
        }
    }
}

impl From<CorrelateError> for ApiError {
    fn from(err: CorrelateError) -> Self {
        match err {
            CorrelateError::InvalidTraceId(_) => Self::invalid_field("trace_id", err.to_string()),
            CorrelateError::Backend(e) => {
                tracing::warn!("Telemetry backend unavailable: {}", e);
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "telemetry backend unavailable")
            }
        }
    }
}
