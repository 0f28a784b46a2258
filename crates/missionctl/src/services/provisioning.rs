//! Remote provisioning side-effects: gateway sessions, workspace pushes,
//! wakeup messages, and the reconcile loop that retries stuck ones.

use axum::http::StatusCode;

use crate::activity;
use crate::app::AppState;
use crate::db_ops;
use crate::error::{api_error, bad_gateway, ApiError};
use crate::gateway::{retry::with_retry, GatewayError, GatewayTarget};
use crate::identity;
use missionctl_models::{Agent, Gateway};

/// Resolve connection coordinates for a gateway, requiring a configured url.
pub fn gateway_target(gateway: &Gateway) -> Result<GatewayTarget, ApiError> {
    let url = gateway
        .url
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| {
            api_error(
                StatusCode::UNPROCESSABLE_ENTITY,
                "Gateway url is required",
            )
        })?;
    Ok(GatewayTarget::new(url, gateway.token.clone()))
}

/// Make sure the remote session for an agent exists. Failures are reported,
/// not raised: a missing session never blocks local persistence.
pub async fn ensure_gateway_session(
    state: &AppState,
    target: &GatewayTarget,
    session_key: &str,
    label: &str,
) -> Option<String> {
    let result = with_retry("sessions.ensure", || {
        state.gateway.call(
            target,
            "sessions.ensure",
            serde_json::json!({"key": session_key, "label": label}),
        )
    })
    .await;
    match result {
        Ok(_) => None,
        Err(err) => {
            tracing::warn!(agent = label, error = %err, "session ensure failed");
            Some(err.to_string())
        }
    }
}

/// Record the outcome of session creation in the activity log.
pub fn record_session_creation(
    conn: &rusqlite::Connection,
    agent: &Agent,
    session_error: Option<&str>,
) {
    match session_error {
        Some(error) => {
            db_ops::record_activity(
                conn,
                activity::AGENT_SESSION_FAILED,
                &format!("Session sync failed for {}: {}", agent.name, error),
                Some(&agent.id),
                agent.board_id.as_deref(),
            );
        }
        None => {
            db_ops::record_activity(
                conn,
                activity::AGENT_SESSION_CREATED,
                &format!("Session created for {}.", agent.name),
                Some(&agent.id),
                agent.board_id.as_deref(),
            );
        }
    }
}

pub fn record_instruction_failure(
    conn: &rusqlite::Connection,
    agent: &Agent,
    error: &str,
    action: &str,
) {
    let action_label = {
        let mut label = action.replace('_', " ");
        if let Some(first) = label.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        label
    };
    db_ops::record_activity(
        conn,
        &activity::instruction_failed(action),
        &format!("{} message failed: {}", action_label, error),
        Some(&agent.id),
        agent.board_id.as_deref(),
    );
}

fn wakeup_message(agent_name: &str, verb: &str) -> String {
    format!(
        "Hello {}. Your workspace has been {}.\n\n\
         Start the agent, run BOOT.md, and if BOOTSTRAP.md exists run it once \
         then delete it. Begin heartbeats after startup.",
        agent_name, verb
    )
}

async fn push_workspace(
    state: &AppState,
    target: &GatewayTarget,
    gateway: &Gateway,
    agent: &Agent,
    raw_token: Option<&str>,
    force_bootstrap: bool,
) -> Result<(), GatewayError> {
    let remote_id = identity::gateway_agent_id(agent.session_key.as_deref(), &agent.name);
    let workspace = gateway
        .workspace_root
        .as_deref()
        .map(|root| identity::workspace_path(root, &agent.name));
    let params = serde_json::json!({
        "agentId": remote_id,
        "name": agent.name,
        "sessionKey": agent.session_key,
        "boardId": agent.board_id,
        "workspace": workspace,
        "soulTemplate": agent.soul_template,
        "heartbeatConfig": agent.heartbeat_config,
        "identityProfile": agent.identity_profile,
        "authToken": raw_token,
        "forceBootstrap": force_bootstrap,
    });
    with_retry("agents.create", || {
        state.gateway.call(target, "agents.create", params.clone())
    })
    .await?;
    Ok(())
}

/// Run the full provision instruction for an agent: push the workspace,
/// wake the agent up, and settle the local row. With
/// `raise_gateway_errors`, a gateway failure becomes a 502; otherwise it is
/// recorded and the provision markers stay set for the reconcile loop.
pub async fn execute_provision(
    state: &AppState,
    gateway: &Gateway,
    agent_id: &str,
    action: &str,
    raw_token: Option<&str>,
    force_bootstrap: bool,
    raise_gateway_errors: bool,
) -> Result<(), ApiError> {
    let agent = {
        let conn = state.db.lock().unwrap();
        db_ops::get_agent(&conn, agent_id)
    };
    let Some(agent) = agent else {
        return Ok(());
    };

    let target = match gateway_target(gateway) {
        Ok(target) => target,
        Err(err) => {
            if raise_gateway_errors {
                return Err(err);
            }
            return Ok(());
        }
    };

    let wakeup_verb = if action == "update" {
        "updated"
    } else {
        "provisioned"
    };

    let outcome: Result<(), GatewayError> = async {
        push_workspace(state, &target, gateway, &agent, raw_token, force_bootstrap).await?;
        if let Some(session_key) = agent.session_key.as_deref() {
            with_retry("sessions.ensure", || {
                state.gateway.call(
                    &target,
                    "sessions.ensure",
                    serde_json::json!({"key": session_key, "label": agent.name}),
                )
            })
            .await?;
            with_retry("sessions.send", || {
                state.gateway.call(
                    &target,
                    "sessions.send",
                    serde_json::json!({
                        "sessionKey": session_key,
                        "message": wakeup_message(&agent.name, wakeup_verb),
                        "deliver": true,
                    }),
                )
            })
            .await?;
        }
        Ok(())
    }
    .await;

    match outcome {
        Ok(()) => {
            let conn = state.db.lock().unwrap();
            if let Some(mut current) = db_ops::get_agent(&conn, agent_id) {
                current.provision_requested_at = None;
                current.provision_action = None;
                current.status = "online".to_string();
                db_ops::update_agent_row(&conn, &current);
                db_ops::record_activity(
                    &conn,
                    &activity::instruction_completed(action),
                    &format!("{} completed for {}.", capitalize(action), current.name),
                    Some(&current.id),
                    current.board_id.as_deref(),
                );
                db_ops::record_activity(
                    &conn,
                    activity::AGENT_WAKEUP_SENT,
                    &format!("Wakeup message sent to {}.", current.name),
                    Some(&current.id),
                    current.board_id.as_deref(),
                );
            }
            tracing::info!(action, agent_id, "provision completed");
            Ok(())
        }
        Err(err) => {
            {
                let conn = state.db.lock().unwrap();
                record_instruction_failure(&conn, &agent, &err.to_string(), action);
            }
            tracing::error!(action, agent_id, error = %err, "provision failed");
            if raise_gateway_errors {
                Err(bad_gateway(action, &err))
            } else {
                Ok(())
            }
        }
    }
}

fn capitalize(word: &str) -> String {
    let mut out = word.replace('_', " ");
    if let Some(first) = out.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    out
}

/// Drain parked outbound messages. Each task is retried in place and only
/// marked done once the gateway accepted both legs.
pub async fn drain_queued_messages(state: &AppState) -> usize {
    let tasks = {
        let conn = state.db.lock().unwrap();
        crate::queue::pending(&conn, 32)
    };
    let mut delivered = 0usize;
    for task in tasks {
        if task.kind != "session.message" {
            let conn = state.db.lock().unwrap();
            crate::queue::mark_attempt_failed(&conn, &task.id, "unknown task kind");
            continue;
        }
        let gateway_id = task.payload["gateway_id"].as_str().unwrap_or_default();
        let session_key = task.payload["session_key"].as_str().unwrap_or_default();
        let message = task.payload["message"].as_str().unwrap_or_default();
        let deliver = task.payload["deliver"].as_bool().unwrap_or(false);

        let gateway = {
            let conn = state.db.lock().unwrap();
            db_ops::get_gateway(&conn, gateway_id)
        };
        let target = gateway.as_ref().and_then(|gw| gateway_target(gw).ok());
        let Some(target) = target else {
            let conn = state.db.lock().unwrap();
            crate::queue::mark_attempt_failed(&conn, &task.id, "gateway not configured");
            continue;
        };

        let send = async {
            state
                .gateway
                .call(
                    &target,
                    "sessions.ensure",
                    serde_json::json!({"key": session_key, "label": session_key}),
                )
                .await?;
            state
                .gateway
                .call(
                    &target,
                    "sessions.send",
                    serde_json::json!({
                        "sessionKey": session_key,
                        "message": message,
                        "deliver": deliver,
                    }),
                )
                .await
        };
        let conn_result = send.await;
        let conn = state.db.lock().unwrap();
        match conn_result {
            Ok(_) => {
                crate::queue::mark_done(&conn, &task.id);
                delivered += 1;
            }
            Err(err) => crate::queue::mark_attempt_failed(&conn, &task.id, &err.to_string()),
        }
    }
    delivered
}

/// One pass of the reconcile loop: retry every agent that still carries a
/// provision marker. Returns how many were attempted.
pub async fn reconcile_pending(state: &AppState) -> usize {
    let pending = {
        let conn = state.db.lock().unwrap();
        db_ops::agents_pending_provision(&conn)
    };
    let count = pending.len();
    for agent in pending {
        let gateway = {
            let conn = state.db.lock().unwrap();
            db_ops::get_gateway(&conn, &agent.gateway_id)
        };
        let Some(gateway) = gateway else { continue };
        let action = agent
            .provision_action
            .clone()
            .unwrap_or_else(|| "provision".to_string());
        let _ = execute_provision(state, &gateway, &agent.id, &action, None, false, false).await;
    }
    count
}
