use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};

use crate::app::AppState;
use crate::db_ops;
use missionctl_models::Identity;

// Axum extractor for Identity — always succeeds.
// Resolves an agent from its bearer token, a human operator from the admin
// token, and falls back to Anonymous otherwise.
#[async_trait]
impl FromRequestParts<AppState> for Identity {
    type Rejection = (StatusCode, String);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(identity) = parts.extensions.get::<Identity>() {
            return Ok(identity.clone());
        }

        let token = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer ").map(|s| s.to_string()));

        if let Some(token) = token {
            if !state.admin_token.is_empty() && token == state.admin_token {
                return Ok(Identity::User {
                    id: "admin".to_string(),
                    organization_id: state.organization_id.clone(),
                });
            }

            let conn = state.db.lock().unwrap();
            if let Some(agent) = db_ops::find_agent_by_token(&conn, &token) {
                // A presented token is a liveness signal in its own right.
                db_ops::touch_agent_last_seen(&conn, &agent.id);
                return Ok(Identity::AgentIdentity { agent });
            }
        }

        Ok(Identity::Anonymous)
    }
}
