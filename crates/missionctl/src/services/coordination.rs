//! Mediated messaging between the gateway-main agent, board leads, and
//! board agents. All remote sends go through the bounded retry wrapper.

use axum::http::StatusCode;
use rusqlite::Connection;

use crate::activity;
use crate::app::AppState;
use crate::db_ops;
use crate::error::{api_error, bad_gateway, ApiError};
use crate::gateway::{retry::with_retry, GatewayError, GatewayTarget};
use crate::identity;
use crate::services::admin;
use crate::services::provisioning;
use missionctl_models::*;

const GATEWAY_MAIN_ONLY: &str = "Only the dedicated gateway agent may call this endpoint.";

/// Gate for gateway-main-only endpoints: the actor must be the boardless
/// agent whose session key matches the gateway's dedicated main key.
pub fn require_gateway_main_actor(
    conn: &Connection,
    identity_ctx: &Identity,
) -> Result<(Agent, Gateway), ApiError> {
    let forbidden = || api_error(StatusCode::FORBIDDEN, GATEWAY_MAIN_ONLY);

    let actor = identity_ctx.agent().cloned().ok_or_else(forbidden)?;
    if actor.board_id.is_some() {
        return Err(forbidden());
    }
    let gateway = db_ops::get_gateway(conn, &actor.gateway_id).ok_or_else(forbidden)?;
    if actor.session_key.as_deref() != Some(identity::MAIN_SESSION_KEY) {
        return Err(forbidden());
    }
    Ok((actor, gateway))
}

fn require_gateway_board(
    conn: &Connection,
    gateway: &Gateway,
    board_id: &str,
) -> Result<Board, ApiError> {
    let board = db_ops::get_board(conn, board_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Board not found"))?;
    if board.gateway_id.as_deref() != Some(gateway.id.as_str()) {
        return Err(api_error(StatusCode::FORBIDDEN, "Board belongs to another gateway"));
    }
    Ok(board)
}

fn board_agent_or_404(conn: &Connection, board: &Board, agent_id: &str) -> Result<Agent, ApiError> {
    match db_ops::get_agent(conn, agent_id) {
        Some(agent) if agent.board_id.as_deref() == Some(board.id.as_str()) => Ok(agent),
        _ => Err(api_error(StatusCode::NOT_FOUND, "Agent not found")),
    }
}

/// Actors allowed to drive board-scoped coordination: an admin user, or an
/// agent that lives on the board.
fn require_board_actor(
    conn: &Connection,
    identity_ctx: &Identity,
    board_id: &str,
) -> Result<(Board, Option<Agent>), ApiError> {
    let board = db_ops::get_board(conn, board_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Board not found"))?;
    match identity_ctx {
        Identity::User { .. } => Ok((board, None)),
        Identity::AgentIdentity { agent } => {
            if agent.board_id.as_deref() == Some(board.id.as_str()) || agent.board_id.is_none() {
                Ok((board, Some(agent.clone())))
            } else {
                Err(api_error(StatusCode::FORBIDDEN, "Agent is not on this board"))
            }
        }
        Identity::Anonymous => Err(api_error(StatusCode::UNAUTHORIZED, "Authentication required")),
    }
}

fn board_target(conn: &Connection, board: &Board) -> Result<(Gateway, GatewayTarget), ApiError> {
    let gateway_id = board.gateway_id.as_deref().ok_or_else(|| {
        api_error(StatusCode::UNPROCESSABLE_ENTITY, "Board gateway_id is required")
    })?;
    let gateway = db_ops::get_gateway(conn, gateway_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Gateway not found"))?;
    let target = provisioning::gateway_target(&gateway)?;
    Ok((gateway, target))
}

/// Ensure the session exists, then send. Both legs retried.
async fn dispatch_gateway_message(
    state: &AppState,
    target: &GatewayTarget,
    session_key: &str,
    label: &str,
    message: &str,
    deliver: bool,
) -> Result<(), GatewayError> {
    with_retry("sessions.ensure", || {
        state.gateway.call(
            target,
            "sessions.ensure",
            serde_json::json!({"key": session_key, "label": label}),
        )
    })
    .await?;
    with_retry("sessions.send", || {
        state.gateway.call(
            target,
            "sessions.send",
            serde_json::json!({
                "sessionKey": session_key,
                "message": message,
                "deliver": deliver,
            }),
        )
    })
    .await?;
    Ok(())
}

/// Gateways answer file reads as a bare string, `{content}`, or
/// `{file: {content}}`.
pub fn gateway_file_content(payload: &serde_json::Value) -> Option<String> {
    if let Some(text) = payload.as_str() {
        return Some(text.to_string());
    }
    if let Some(content) = payload.get("content").and_then(|v| v.as_str()) {
        return Some(content.to_string());
    }
    payload
        .pointer("/file/content")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn build_gateway_lead_message(
    base_url: &str,
    board: &Board,
    actor_agent_name: &str,
    payload: &LeadMessageRequest,
) -> String {
    let header = if payload.kind == "question" {
        "GATEWAY MAIN QUESTION"
    } else {
        "GATEWAY MAIN HANDOFF"
    };
    let correlation = payload
        .correlation_id
        .as_deref()
        .map(str::trim)
        .unwrap_or("");
    let correlation_line = if correlation.is_empty() {
        String::new()
    } else {
        format!("Correlation ID: {}\n", correlation)
    };
    let default_tags = vec!["gateway_main".to_string(), "lead_reply".to_string()];
    let tags_json =
        serde_json::to_string(payload.reply_tags.as_ref().unwrap_or(&default_tags))
            .unwrap_or_else(|_| "[]".to_string());
    let source = payload
        .reply_source
        .as_deref()
        .unwrap_or("lead_to_gateway_main");
    format!(
        "{header}\n\
         Board: {board_name}\n\
         Board ID: {board_id}\n\
         From agent: {actor}\n\
         {correlation_line}\n\
         {content}\n\n\
         Reply to the gateway agent by writing a NON-chat memory item on this board:\n\
         POST {base_url}/api/boards/{board_id}/memory\n\
         Body: {{\"content\":\"...\",\"tags\":{tags_json},\"source\":\"{source}\"}}\n\
         Do NOT reply in gateway chat.",
        header = header,
        board_name = board.name,
        board_id = board.id,
        actor = actor_agent_name,
        correlation_line = correlation_line,
        content = payload.content.trim(),
        base_url = base_url,
        tags_json = tags_json,
        source = source,
    )
}

/// Wake a specific board agent with an operator- or peer-supplied message.
pub async fn nudge_board_agent(
    state: &AppState,
    identity_ctx: &Identity,
    board_id: &str,
    target_agent_id: &str,
    payload: &NudgeAgentRequest,
) -> Result<OkResponse, ApiError> {
    let (board, actor, target, gateway_target) = {
        let conn = state.db.lock().unwrap();
        let (board, actor) = require_board_actor(&conn, identity_ctx, board_id)?;
        let target = board_agent_or_404(&conn, &board, target_agent_id)?;
        let (_gateway, gateway_target) = board_target(&conn, &board)?;
        (board, actor, target, gateway_target)
    };

    let session_key = target.session_key.clone().ok_or_else(|| {
        api_error(StatusCode::UNPROCESSABLE_ENTITY, "Target agent has no session key")
    })?;

    let actor_id = actor.as_ref().map(|a| a.id.clone());
    match dispatch_gateway_message(
        state,
        &gateway_target,
        &session_key,
        &target.name,
        &payload.message,
        true,
    )
    .await
    {
        Ok(()) => {
            let conn = state.db.lock().unwrap();
            db_ops::record_activity(
                &conn,
                activity::AGENT_NUDGE_SENT,
                &format!("Nudge sent to {}.", target.name),
                actor_id.as_deref(),
                Some(&board.id),
            );
            Ok(OkResponse::default())
        }
        Err(err) => {
            let conn = state.db.lock().unwrap();
            db_ops::record_activity(
                &conn,
                activity::AGENT_NUDGE_FAILED,
                &format!("Nudge failed for {}: {}", target.name, err),
                actor_id.as_deref(),
                Some(&board.id),
            );
            Err(bad_gateway("nudge", &err))
        }
    }
}

/// Read an agent's SOUL.md from the gateway workspace.
pub async fn get_agent_soul(
    state: &AppState,
    identity_ctx: &Identity,
    board_id: &str,
    target_agent_id: &str,
) -> Result<AgentSoulResponse, ApiError> {
    let (target, gateway_target) = {
        let conn = state.db.lock().unwrap();
        let (board, _actor) = require_board_actor(&conn, identity_ctx, board_id)?;
        let target = board_agent_or_404(&conn, &board, target_agent_id)?;
        let (_gateway, gateway_target) = board_target(&conn, &board)?;
        (target, gateway_target)
    };

    let remote_id = identity::gateway_agent_id(target.session_key.as_deref(), &target.name);
    let payload = with_retry("agents.files.get", || {
        state.gateway.call(
            &gateway_target,
            "agents.files.get",
            serde_json::json!({"agentId": remote_id, "name": "SOUL.md"}),
        )
    })
    .await
    .map_err(|err| bad_gateway("soul read", &err))?;

    let content = gateway_file_content(&payload).ok_or_else(|| {
        api_error(StatusCode::BAD_GATEWAY, "Invalid gateway response")
    })?;
    Ok(AgentSoulResponse { content })
}

/// Write an agent's SOUL.md: the local copy is persisted first so the
/// stored template stays the source of truth even when the push fails.
pub async fn update_agent_soul(
    state: &AppState,
    identity_ctx: &Identity,
    board_id: &str,
    target_agent_id: &str,
    payload: &UpdateAgentSoulRequest,
) -> Result<OkResponse, ApiError> {
    let content = payload.content.trim().to_string();
    if content.is_empty() {
        return Err(api_error(StatusCode::UNPROCESSABLE_ENTITY, "content is required"));
    }

    let (actor, mut target, gateway_target, board) = {
        let conn = state.db.lock().unwrap();
        let (board, actor) = require_board_actor(&conn, identity_ctx, board_id)?;
        let target = board_agent_or_404(&conn, &board, target_agent_id)?;
        let (_gateway, gateway_target) = board_target(&conn, &board)?;
        (actor, target, gateway_target, board)
    };

    {
        let conn = state.db.lock().unwrap();
        target.soul_template = Some(content.clone());
        db_ops::update_agent_row(&conn, &target);
    }

    let remote_id = identity::gateway_agent_id(target.session_key.as_deref(), &target.name);
    with_retry("agents.files.set", || {
        state.gateway.call(
            &gateway_target,
            "agents.files.set",
            serde_json::json!({
                "agentId": remote_id,
                "name": "SOUL.md",
                "content": content,
            }),
        )
    })
    .await
    .map_err(|err| bad_gateway("soul write", &err))?;

    let mut note = format!("SOUL.md updated for {}.", target.name);
    if let Some(reason) = payload.reason.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        note = format!("{} Reason: {}", note, reason);
    }
    if let Some(source) = payload
        .source_url
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        note = format!("{} Source: {}", note, source);
    }
    let conn = state.db.lock().unwrap();
    db_ops::record_activity(
        &conn,
        activity::AGENT_SOUL_UPDATED,
        &note,
        actor.as_ref().map(|a| a.id.as_str()),
        Some(&board.id),
    );
    Ok(OkResponse::default())
}

/// Relay a board lead's question to the human user through the
/// gateway-main session.
pub async fn ask_user_via_gateway_main(
    state: &AppState,
    identity_ctx: &Identity,
    board_id: &str,
    payload: &AskUserRequest,
) -> Result<AskUserResponse, ApiError> {
    let (board, actor, gateway, gateway_target) = {
        let conn = state.db.lock().unwrap();
        let actor = identity_ctx
            .agent()
            .cloned()
            .ok_or_else(|| api_error(StatusCode::FORBIDDEN, "Only board leads may ask the user"))?;
        let board = db_ops::get_board(&conn, board_id)
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Board not found"))?;
        if !actor.is_board_lead || actor.board_id.as_deref() != Some(board.id.as_str()) {
            return Err(api_error(
                StatusCode::FORBIDDEN,
                "Only the board lead may ask the user",
            ));
        }
        let (gateway, gateway_target) = board_target(&conn, &board)?;
        (board, actor, gateway, gateway_target)
    };

    let correlation = payload
        .correlation_id
        .as_deref()
        .map(str::trim)
        .unwrap_or("");
    let correlation_line = if correlation.is_empty() {
        String::new()
    } else {
        format!("Correlation ID: {}\n", correlation)
    };
    let channel = payload
        .preferred_channel
        .as_deref()
        .map(str::trim)
        .unwrap_or("");
    let channel_line = if channel.is_empty() {
        String::new()
    } else {
        format!("Preferred channel: {}\n", channel)
    };
    let default_tags = vec!["gateway_main".to_string(), "user_reply".to_string()];
    let tags_json = serde_json::to_string(payload.reply_tags.as_ref().unwrap_or(&default_tags))
        .unwrap_or_else(|_| "[]".to_string());
    let reply_source = payload
        .reply_source
        .as_deref()
        .unwrap_or("user_via_gateway_main");
    let message = format!(
        "LEAD REQUEST: ASK USER\n\
         Board: {board_name}\n\
         Board ID: {board_id}\n\
         From lead: {lead}\n\
         {correlation_line}{channel_line}\n\
         {content}\n\n\
         Please reach the user via your configured channel(s) (Slack/SMS/etc).\n\
         If you cannot reach them there, post the question in board chat as a fallback.\n\n\
         When you receive the answer, reply by writing a NON-chat memory item on this board:\n\
         POST {base_url}/api/boards/{board_id}/memory\n\
         Body: {{\"content\":\"<answer>\",\"tags\":{tags_json},\"source\":\"{reply_source}\"}}\n\
         Do NOT reply in gateway chat.",
        board_name = board.name,
        board_id = board.id,
        lead = actor.name,
        correlation_line = correlation_line,
        channel_line = channel_line,
        content = payload.content.trim(),
        base_url = state.base_url,
        tags_json = tags_json,
        reply_source = reply_source,
    );

    match dispatch_gateway_message(
        state,
        &gateway_target,
        identity::MAIN_SESSION_KEY,
        "Gateway Agent",
        &message,
        true,
    )
    .await
    {
        Ok(()) => {
            let conn = state.db.lock().unwrap();
            let main_agent = db_ops::gateway_main_agent(&conn, &gateway.id);
            db_ops::record_activity(
                &conn,
                activity::LEAD_ASK_USER_SENT,
                &format!("Lead user question relayed for {}.", board.name),
                Some(&actor.id),
                Some(&board.id),
            );
            Ok(AskUserResponse {
                board_id: board.id,
                main_agent_id: main_agent.as_ref().map(|a| a.id.clone()),
                main_agent_name: main_agent.map(|a| a.name),
            })
        }
        Err(err) => {
            let conn = state.db.lock().unwrap();
            db_ops::record_activity(
                &conn,
                activity::LEAD_ASK_USER_FAILED,
                &format!("Lead user question failed for {}: {}", board.name, err),
                Some(&actor.id),
                Some(&board.id),
            );
            Err(bad_gateway("ask user", &err))
        }
    }
}

/// Make sure a board has a lead agent (creating and provisioning one when
/// absent), then deliver the message to its session.
async fn ensure_and_message_board_lead(
    state: &AppState,
    gateway_target: &GatewayTarget,
    board: &Board,
    message: &str,
) -> Result<(Agent, bool), ApiError> {
    let existing = {
        let conn = state.db.lock().unwrap();
        db_ops::board_lead_agent(&conn, &board.id)
    };
    let (lead, lead_created) = match existing {
        Some(lead) => (lead, false),
        None => {
            let input = CreateAgent {
                name: format!("{} Lead", board.name),
                board_id: Some(board.id.clone()),
                is_board_lead: Some(true),
                heartbeat_config: None,
                identity_profile: None,
                soul_template: None,
            };
            let (lead, _token) = admin::create_agent(state, &input).await?;
            (lead, true)
        }
    };

    let session_key = lead.session_key.clone().ok_or_else(|| {
        api_error(StatusCode::UNPROCESSABLE_ENTITY, "Lead agent has no session key")
    })?;
    dispatch_gateway_message(state, gateway_target, &session_key, &lead.name, message, false)
        .await
        .map_err(|err| bad_gateway("lead message", &err))?;
    Ok((lead, lead_created))
}

/// Gateway-main relays a question or handoff to one board's lead.
pub async fn message_gateway_board_lead(
    state: &AppState,
    identity_ctx: &Identity,
    board_id: &str,
    payload: &LeadMessageRequest,
) -> Result<LeadMessageResponse, ApiError> {
    let (actor, board, gateway_target) = {
        let conn = state.db.lock().unwrap();
        let (actor, gateway) = require_gateway_main_actor(&conn, identity_ctx)?;
        let board = require_gateway_board(&conn, &gateway, board_id)?;
        let target = provisioning::gateway_target(&gateway)?;
        (actor, board, target)
    };

    let message = build_gateway_lead_message(&state.base_url, &board, &actor.name, payload);
    let result = ensure_and_message_board_lead(state, &gateway_target, &board, &message).await;

    match result {
        Ok((lead, lead_created)) => {
            let conn = state.db.lock().unwrap();
            db_ops::record_activity(
                &conn,
                activity::MAIN_LEAD_MESSAGE_SENT,
                &format!("Sent {} to lead for board: {}.", payload.kind, board.name),
                Some(&actor.id),
                Some(&board.id),
            );
            Ok(LeadMessageResponse {
                board_id: board.id,
                lead_agent_id: lead.id,
                lead_agent_name: lead.name,
                lead_created,
            })
        }
        Err(err) => {
            let conn = state.db.lock().unwrap();
            let detail = err
                .1
                 .0
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("gateway error")
                .to_string();
            db_ops::record_activity(
                &conn,
                activity::MAIN_LEAD_MESSAGE_FAILED,
                &format!("Lead message failed for {}: {}", board.name, detail),
                Some(&actor.id),
                Some(&board.id),
            );
            Err(err)
        }
    }
}

/// Gateway-main fans a message out to every board lead, with per-board
/// isolation: one failing board never blocks the others.
pub async fn broadcast_gateway_lead_message(
    state: &AppState,
    identity_ctx: &Identity,
    payload: &LeadBroadcastRequest,
) -> Result<LeadBroadcastResponse, ApiError> {
    let (actor, boards, gateway_target) = {
        let conn = state.db.lock().unwrap();
        let (actor, gateway) = require_gateway_main_actor(&conn, identity_ctx)?;
        let mut boards = db_ops::list_boards_for_gateway(&conn, &gateway.id);
        if let Some(board_ids) = &payload.board_ids {
            boards.retain(|b| board_ids.contains(&b.id));
        }
        let target = provisioning::gateway_target(&gateway)?;
        (actor, boards, target)
    };

    let mut results = Vec::with_capacity(boards.len());
    let mut sent = 0usize;
    let mut failed = 0usize;

    for board in &boards {
        let request = LeadMessageRequest {
            kind: payload.kind.clone(),
            content: payload.content.clone(),
            correlation_id: payload.correlation_id.clone(),
            reply_tags: payload.reply_tags.clone(),
            reply_source: payload.reply_source.clone(),
        };
        let message = build_gateway_lead_message(&state.base_url, board, &actor.name, &request);
        match ensure_and_message_board_lead(state, &gateway_target, board, &message).await {
            Ok((lead, _created)) => {
                sent += 1;
                results.push(LeadBroadcastBoardResult {
                    board_id: board.id.clone(),
                    lead_agent_id: Some(lead.id),
                    lead_agent_name: Some(lead.name),
                    ok: true,
                    error: None,
                });
            }
            Err(err) => {
                failed += 1;
                let detail = err
                    .1
                     .0
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("gateway error")
                    .to_string();
                results.push(LeadBroadcastBoardResult {
                    board_id: board.id.clone(),
                    lead_agent_id: None,
                    lead_agent_name: None,
                    ok: false,
                    error: Some(detail),
                });
            }
        }
    }

    {
        let conn = state.db.lock().unwrap();
        db_ops::record_activity(
            &conn,
            activity::MAIN_LEAD_BROADCAST_SENT,
            &format!(
                "Broadcast {} to {} board leads (failed: {}).",
                payload.kind, sent, failed
            ),
            Some(&actor.id),
            None,
        );
    }

    Ok(LeadBroadcastResponse {
        ok: failed == 0,
        sent,
        failed,
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_content_accepts_all_reply_shapes() {
        assert_eq!(
            gateway_file_content(&json!("raw text")).as_deref(),
            Some("raw text")
        );
        assert_eq!(
            gateway_file_content(&json!({"content": "inner"})).as_deref(),
            Some("inner")
        );
        assert_eq!(
            gateway_file_content(&json!({"file": {"content": "nested"}})).as_deref(),
            Some("nested")
        );
        assert_eq!(gateway_file_content(&json!({"other": 1})), None);
    }

    #[test]
    fn lead_message_carries_reply_contract() {
        let board = Board {
            id: "b1".into(),
            organization_id: "o1".into(),
            gateway_id: Some("g1".into()),
            name: "Ops".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
            updated_at: "2026-01-01T00:00:00Z".into(),
        };
        let request = LeadMessageRequest {
            kind: "question".into(),
            content: "  Who owns the deploy?  ".into(),
            correlation_id: Some("corr-1".into()),
            reply_tags: None,
            reply_source: None,
        };
        let message =
            build_gateway_lead_message("http://localhost:8080", &board, "Gateway Agent", &request);
        assert!(message.starts_with("GATEWAY MAIN QUESTION\n"));
        assert!(message.contains("Board: Ops"));
        assert!(message.contains("Correlation ID: corr-1"));
        assert!(message.contains("Who owns the deploy?"));
        assert!(message.contains("POST http://localhost:8080/api/boards/b1/memory"));
        assert!(message.contains("\"tags\":[\"gateway_main\",\"lead_reply\"]"));
        assert!(message.contains("\"source\":\"lead_to_gateway_main\""));

        let handoff = LeadMessageRequest {
            kind: "handoff".into(),
            ..request
        };
        let message =
            build_gateway_lead_message("http://localhost:8080", &board, "Gateway Agent", &handoff);
        assert!(message.starts_with("GATEWAY MAIN HANDOFF\n"));
    }
}
