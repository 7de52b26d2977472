//! HTTP-facing error type

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Error surfaced at the HTTP boundary
///
/// Policy rejections and validation failures map to 400, an unreachable
/// coordinator to 503; protocol internals never leak further detail than
/// their outcome message.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed input or a rejected operation
    #[error("{0}")]
    BadRequest(String),

    /// The coordinator could not be reached
    #[error("Leader unavailable; retry shortly")]
    LeaderUnavailable,

    /// The requested resource does not exist yet
    #[error("not found")]
    NotFound,

    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::LeaderUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

impl From<gavel_core::Error> for ApiError {
    fn from(error: gavel_core::Error) -> Self {
        match error {
            gavel_core::Error::Unreachable(_)
            | gavel_core::Error::Timeout(_)
            | gavel_core::Error::CoordinatorUnavailable => ApiError::LeaderUnavailable,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Result type for HTTP handlers
pub type ApiResult<T> = Result<T, ApiError>;
