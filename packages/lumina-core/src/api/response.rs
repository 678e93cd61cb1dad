//! Shared JSON response helpers for HTTP handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// 200 with an arbitrary JSON payload.
pub fn api_success(payload: serde_json::Value) -> Response {
    (StatusCode::OK, Json(payload)).into_response()
}

/// Error response with the flat `{"error": ...}` shape clients expect.
pub fn api_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
