use axum::http::StatusCode;
use axum::Json;

use crate::gateway::GatewayError;

/// Handler error shape: status plus an `{"error": ...}` body.
pub type ApiError = (StatusCode, Json<serde_json::Value>);

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(serde_json::json!({"error": message.into()})))
}

pub fn not_found(what: &str) -> ApiError {
    api_error(StatusCode::NOT_FOUND, format!("{} not found", what))
}

/// Map a gateway failure on a named operation to 502.
pub fn bad_gateway(op: &str, err: &GatewayError) -> ApiError {
    api_error(
        StatusCode::BAD_GATEWAY,
        format!("Gateway {} failed: {}", op, err),
    )
}
