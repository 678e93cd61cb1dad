//! Centralized error types for the Lumina Relay core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type for the Lumina Relay server.
#[derive(Debug, Error)]
pub enum LuminaError {
    /// Client presented a session code that does not exist. The display
    /// string is the exact in-band error message clients match on.
    #[error("Invalid session code")]
    InvalidSession,

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The identify pool's queue is full.
    #[error("Server overloaded, try again shortly")]
    Overloaded,

    /// The daily outbound API quota is exhausted.
    #[error("Daily quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The shared substrate is unreachable. Callers degrade to the local
    /// path rather than surfacing this to clients.
    #[error("Substrate error: {0}")]
    Substrate(String),

    /// An outbound lookup (search, video) failed.
    #[error("Lookup failed: {0}")]
    Lookup(String),

    /// Server configuration error (missing required settings).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LuminaError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSession => "invalid_session",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Overloaded => "overloaded",
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::Substrate(_) => "substrate_error",
            Self::Lookup(_) => "lookup_failed",
            Self::Configuration(_) => "configuration_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidSession => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Overloaded | Self::QuotaExceeded(_) | Self::Configuration(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Lookup(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type LuminaResult<T> = Result<T, LuminaError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for LuminaError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<reqwest::Error> for LuminaError {
    fn from(err: reqwest::Error) -> Self {
        Self::Lookup(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_session_maps_to_not_found() {
        let err = LuminaError::InvalidSession;
        assert_eq!(err.code(), "invalid_session");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn overloaded_maps_to_service_unavailable() {
        let err = LuminaError::Overloaded;
        assert_eq!(err.code(), "overloaded");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.to_string(), "Server overloaded, try again shortly");
    }

    #[test]
    fn substrate_errors_stay_internal() {
        let err = LuminaError::Substrate("connection refused".into());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
