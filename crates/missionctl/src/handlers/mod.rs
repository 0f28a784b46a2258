pub mod activity;
pub mod agents;
pub mod boards;
pub mod coordination;
pub mod events;
pub mod gateways;

use axum::http::StatusCode;
use axum::Json;

use crate::error::{api_error, ApiError};
use missionctl_models::Identity;

/// Mutating admin endpoints are reserved for the configured operator token.
pub fn require_user(identity: &Identity) -> Result<(), ApiError> {
    match identity {
        Identity::User { .. } => Ok(()),
        Identity::AgentIdentity { .. } => Err(api_error(
            StatusCode::FORBIDDEN,
            "This endpoint requires operator credentials",
        )),
        Identity::Anonymous => Err(api_error(
            StatusCode::UNAUTHORIZED,
            "Authentication required",
        )),
    }
}

/// Lifecycle endpoints accept either the operator or an authenticated agent.
pub fn require_authenticated(identity: &Identity) -> Result<(), ApiError> {
    match identity {
        Identity::Anonymous => Err(api_error(
            StatusCode::UNAUTHORIZED,
            "Authentication required",
        )),
        _ => Ok(()),
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;
