//! Error translation at the HTTP boundary
//!
//! NIST 800-53: SI-11 (Error Handling)
//! Implementation: The single mapping from error kind to status code. Bodies
//! carry the stable code and the sanitized message only.

use archive_gate::Error;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, warn};

/// Error body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Stable error code
    pub error_code: &'static str,
    /// Client-safe message
    pub message: String,
    /// Structured details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Request path
    pub path: String,
    /// When the error was produced
    pub timestamp: DateTime<Utc>,
}

/// A gateway error bound to the request path it occurred on
#[derive(Debug)]
pub struct ApiError {
    error: Error,
    path: String,
}

impl ApiError {
    /// Bind `error` to `path`
    pub fn new(error: Error, path: impl Into<String>) -> Self {
        Self {
            error,
            path: path.into(),
        }
    }

    /// Status code for the wrapped error
    pub fn status(&self) -> StatusCode {
        status_for(&self.error)
    }
}

/// Map an error kind to its HTTP status
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::SecurityViolation(_) | Error::AccessDenied(_) => StatusCode::FORBIDDEN,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::ArchiveCorrupted(_) | Error::UnsupportedFormat(_) | Error::Io(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::FeatureDisabled(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::AuthFailure(_)
        | Error::LockedOut { .. }
        | Error::TokenInvalid(_)
        | Error::Directory(_) => StatusCode::UNAUTHORIZED,
        Error::ResourceExhaustion(_) => StatusCode::TOO_MANY_REQUESTS,
        Error::Config(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(path = %self.path, error = %self.error, "Request failed");
        } else {
            warn!(
                path = %self.path,
                status = status.as_u16(),
                error = %self.error,
                "Request rejected"
            );
        }

        let details = match &self.error {
            Error::LockedOut { remaining_secs } => {
                Some(json!({ "remainingSeconds": remaining_secs }))
            }
            _ => None,
        };

        let body = ErrorBody {
            error_code: self.error.code().as_str(),
            message: self.error.sanitized_message(),
            details,
            path: self.path,
            timestamp: Utc::now(),
        };
        (status, Json(body)).into_response()
    }
}
