//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use toxide_core::ToxicError;
use toxide_proxy::ProxyError;

/// API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Proxy or toxic not found.
    #[error("{0}")]
    NotFound(String),

    /// Name or listen address already taken.
    #[error("{0}")]
    Conflict(String),

    /// Malformed request.
    #[error("{0}")]
    BadRequest(String),

    /// Internal server error.
    #[error("{0}")]
    Internal(String),
}

impl From<ToxicError> for ApiError {
    fn from(e: ToxicError) -> Self {
        match e {
            ToxicError::Conflict(_) => ApiError::Conflict(e.to_string()),
            ToxicError::NotFound(_) => ApiError::NotFound(e.to_string()),
            _ => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl From<ProxyError> for ApiError {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::ProxyExists(_) => ApiError::Conflict(e.to_string()),
            ProxyError::NotFound(_) => ApiError::NotFound(e.to_string()),
            ProxyError::Toxic(inner) => inner.into(),
            ProxyError::InvalidConfig(_)
            | ProxyError::InvalidAddress { .. }
            | ProxyError::Pattern(_) => ApiError::BadRequest(e.to_string()),
            ProxyError::Bind { .. } | ProxyError::Io(_) => ApiError::Internal(e.to_string()),
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: u16,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            status: status.as_u16(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Result type for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toxic_errors_map_to_status() {
        let conflict: ApiError = ToxicError::Conflict("lag".into()).into();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let missing: ApiError = ToxicError::NotFound("lag".into()).into();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let invalid: ApiError = ToxicError::UnknownType("bogus".into()).into();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn proxy_errors_map_to_status() {
        let exists: ApiError = ProxyError::ProxyExists("redis".into()).into();
        assert_eq!(exists.status(), StatusCode::CONFLICT);

        let nested: ApiError = ProxyError::Toxic(ToxicError::InvalidToxicity(2.0)).into();
        assert_eq!(nested.status(), StatusCode::BAD_REQUEST);

        let io: ApiError = ProxyError::Io(std::io::Error::other("boom")).into();
        assert_eq!(io.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
