//! Read-through access to gateway sessions: status, listings, history,
//! and direct message injection.

use axum::http::StatusCode;

use crate::app::AppState;
use crate::db_ops;
use crate::error::{api_error, bad_gateway, ApiError};
use crate::gateway::{compat, normalize_list, retry::with_retry, GatewayTarget};
use crate::identity;
use crate::services::provisioning;
use missionctl_models::*;

/// Resolve which gateway a session request is aimed at: an explicit url
/// override wins, then the board's gateway, then the default gateway.
pub fn resolve_target(
    state: &AppState,
    query: &GatewayResolveQuery,
) -> Result<GatewayTarget, ApiError> {
    if let Some(url) = query.gateway_url.as_deref().filter(|u| !u.is_empty()) {
        return Ok(GatewayTarget::new(url, query.gateway_token.clone()));
    }

    let conn = state.db.lock().unwrap();
    let gateway = match query.board_id.as_deref() {
        Some(board_id) => {
            let board = db_ops::get_board(&conn, board_id)
                .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Board not found"))?;
            db_ops::get_gateway_for_board(&conn, &board.id)
        }
        None => db_ops::default_gateway(&conn),
    };
    let gateway =
        gateway.ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Gateway not found"))?;
    provisioning::gateway_target(&gateway)
}

fn session_key(session: &serde_json::Value) -> Option<&str> {
    session
        .get("key")
        .or_else(|| session.get("sessionKey"))
        .and_then(|v| v.as_str())
}

fn find_main_session(sessions: &[serde_json::Value]) -> Option<serde_json::Value> {
    sessions
        .iter()
        .find(|s| session_key(s) == Some(identity::MAIN_SESSION_KEY))
        .cloned()
}

/// Connection status for a gateway. The version gate runs first so an
/// incompatible runtime reports as disconnected with an explanation
/// instead of half-working.
pub async fn get_status(state: &AppState, target: &GatewayTarget) -> GatewayStatusResponse {
    let disconnected = |error: String| GatewayStatusResponse {
        connected: false,
        gateway_url: Some(target.url.clone()),
        sessions_count: None,
        main_session: None,
        main_session_error: None,
        error: Some(error),
    };

    match compat::check_gateway_version(
        state.gateway.as_ref(),
        target,
        compat::MINIMUM_GATEWAY_VERSION,
    )
    .await
    {
        Err(err) => return disconnected(err.to_string()),
        Ok(check) if !check.compatible => {
            return disconnected(
                check
                    .message
                    .unwrap_or_else(|| "Gateway version is not supported.".to_string()),
            );
        }
        Ok(_) => {}
    }

    let listed = with_retry("sessions.list", || {
        state
            .gateway
            .call(target, "sessions.list", serde_json::json!({}))
    })
    .await;
    match listed {
        Ok(payload) => {
            let mut sessions = normalize_list(&payload, "sessions");
            let mut main_session = find_main_session(&sessions);
            // A missing main session is first ensured, then re-listed; only
            // a session that stays missing is reported as an error.
            if main_session.is_none() {
                let ensured = state
                    .gateway
                    .call(
                        target,
                        "sessions.ensure",
                        serde_json::json!({
                            "key": identity::MAIN_SESSION_KEY,
                            "label": "Gateway Agent",
                        }),
                    )
                    .await;
                if ensured.is_ok() {
                    if let Ok(payload) = state
                        .gateway
                        .call(target, "sessions.list", serde_json::json!({}))
                        .await
                    {
                        sessions = normalize_list(&payload, "sessions");
                        main_session = find_main_session(&sessions);
                    }
                }
            }
            let main_session_error = if main_session.is_none() {
                Some("Main session not found".to_string())
            } else {
                None
            };
            GatewayStatusResponse {
                connected: true,
                gateway_url: Some(target.url.clone()),
                sessions_count: Some(sessions.len()),
                main_session,
                main_session_error,
                error: None,
            }
        }
        Err(err) => disconnected(err.to_string()),
    }
}

pub async fn list_sessions(
    state: &AppState,
    target: &GatewayTarget,
) -> Result<GatewaySessionsResponse, ApiError> {
    let payload = with_retry("sessions.list", || {
        state
            .gateway
            .call(target, "sessions.list", serde_json::json!({}))
    })
    .await
    .map_err(|err| bad_gateway("sessions list", &err))?;
    let sessions = normalize_list(&payload, "sessions");
    let main_session = find_main_session(&sessions);
    Ok(GatewaySessionsResponse {
        sessions,
        main_session,
    })
}

/// Fetch one session by key. The main session is lazily created when the
/// gateway does not know it yet; any other missing key is a plain 404.
pub async fn get_session(
    state: &AppState,
    target: &GatewayTarget,
    key: &str,
) -> Result<GatewaySessionResponse, ApiError> {
    let find = |sessions: &[serde_json::Value]| {
        sessions
            .iter()
            .find(|s| session_key(s) == Some(key))
            .cloned()
    };

    let listed = list_sessions(state, target).await?;
    if let Some(session) = find(&listed.sessions) {
        return Ok(GatewaySessionResponse { session });
    }
    if key == identity::MAIN_SESSION_KEY {
        with_retry("sessions.ensure", || {
            state.gateway.call(
                target,
                "sessions.ensure",
                serde_json::json!({"key": key, "label": "Gateway Agent"}),
            )
        })
        .await
        .map_err(|err| bad_gateway("session ensure", &err))?;
        let listed = list_sessions(state, target).await?;
        if let Some(session) = find(&listed.sessions) {
            return Ok(GatewaySessionResponse { session });
        }
    }
    Err(api_error(StatusCode::NOT_FOUND, "Session not found"))
}

pub async fn session_history(
    state: &AppState,
    target: &GatewayTarget,
    key: &str,
) -> Result<GatewaySessionHistoryResponse, ApiError> {
    let payload = with_retry("sessions.history", || {
        state.gateway.call(
            target,
            "sessions.history",
            serde_json::json!({"sessionKey": key}),
        )
    })
    .await
    .map_err(|err| bad_gateway("session history", &err))?;
    Ok(GatewaySessionHistoryResponse {
        history: normalize_list(&payload, "history"),
    })
}

/// Inject a message into a session, creating the session first when the
/// gateway does not know it yet.
pub async fn send_session_message(
    state: &AppState,
    target: &GatewayTarget,
    key: &str,
    content: &str,
) -> Result<OkResponse, ApiError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(api_error(StatusCode::UNPROCESSABLE_ENTITY, "content is required"));
    }
    with_retry("sessions.ensure", || {
        state.gateway.call(
            target,
            "sessions.ensure",
            serde_json::json!({"key": key, "label": key}),
        )
    })
    .await
    .map_err(|err| bad_gateway("session ensure", &err))?;
    with_retry("sessions.send", || {
        state.gateway.call(
            target,
            "sessions.send",
            serde_json::json!({
                "sessionKey": key,
                "message": content,
                "deliver": true,
            }),
        )
    })
    .await
    .map_err(|err| bad_gateway("session message", &err))?;
    Ok(OkResponse::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn main_session_is_found_by_either_key_field() {
        let sessions = vec![
            json!({"key": "agent:scout:main"}),
            json!({"sessionKey": "agent:main", "label": "Gateway Agent"}),
        ];
        let main = find_main_session(&sessions).unwrap();
        assert_eq!(main["label"], "Gateway Agent");
    }

    #[test]
    fn missing_main_session_yields_none() {
        let sessions = vec![json!({"key": "agent:scout:main"})];
        assert!(find_main_session(&sessions).is_none());
    }
}
