//! Admin lifecycle flows: create, update, delete, and the idempotent
//! heartbeat-or-create upsert used by self-registering agents.

use axum::http::StatusCode;
use rusqlite::Connection;
use uuid::Uuid;

use crate::activity;
use crate::app::AppState;
use crate::db_ops;
use crate::error::{api_error, ApiError};
use crate::gateway::compat::{check_gateway_version, MINIMUM_GATEWAY_VERSION};
use crate::gateway::retry::with_retry;
use crate::identity;
use crate::queue;
use crate::services::lifecycle;
use crate::services::provisioning;
use crate::tokens;
use missionctl_models::*;

/// Refuse to run admin mutations against a gateway runtime below the
/// supported floor. Unreachable gateways surface as 502.
pub async fn assert_gateway_compatible(
    state: &AppState,
    gateway: &Gateway,
) -> Result<(), ApiError> {
    let target = provisioning::gateway_target(gateway)?;
    match check_gateway_version(state.gateway.as_ref(), &target, MINIMUM_GATEWAY_VERSION).await {
        Ok(check) if !check.compatible => Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            check
                .message
                .unwrap_or_else(|| "Gateway version is not supported.".to_string()),
        )),
        Ok(_) => Ok(()),
        Err(err) => Err(api_error(
            StatusCode::BAD_GATEWAY,
            format!("Gateway compatibility check failed: {}", err),
        )),
    }
}

fn require_board(conn: &Connection, board_id: &str) -> Result<Board, ApiError> {
    db_ops::get_board(conn, board_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Board not found"))
}

fn require_board_gateway(conn: &Connection, board: &Board) -> Result<Gateway, ApiError> {
    let gateway_id = board.gateway_id.as_deref().ok_or_else(|| {
        api_error(StatusCode::UNPROCESSABLE_ENTITY, "Board gateway_id is required")
    })?;
    db_ops::get_gateway(conn, gateway_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Gateway not found"))
}

/// Three-step name guard: per-board collision, gateway-wide collision, and
/// derived session-key collision. `exclude_id` skips the agent itself on
/// renames.
fn ensure_unique_agent_name(
    conn: &Connection,
    board: &Board,
    gateway: &Gateway,
    requested_name: &str,
    exclude_id: Option<&str>,
) -> Result<(), ApiError> {
    if requested_name.is_empty() {
        return Ok(());
    }
    let not_self = |agent: &Agent| exclude_id.map_or(true, |id| agent.id != id);

    if db_ops::find_agent_on_board_by_name(conn, &board.id, requested_name)
        .filter(not_self)
        .is_some()
    {
        return Err(api_error(
            StatusCode::CONFLICT,
            "An agent with this name already exists on this board.",
        ));
    }

    ensure_unique_gateway_name(conn, gateway, requested_name, exclude_id)
}

/// Gateway-wide legs of the name guard, also used for boardless agents.
fn ensure_unique_gateway_name(
    conn: &Connection,
    gateway: &Gateway,
    requested_name: &str,
    exclude_id: Option<&str>,
) -> Result<(), ApiError> {
    if requested_name.is_empty() {
        return Ok(());
    }
    let not_self = |agent: &Agent| exclude_id.map_or(true, |id| agent.id != id);

    if db_ops::find_agents_by_name(conn, &gateway.id, requested_name)
        .iter()
        .any(|a| not_self(a))
    {
        return Err(api_error(
            StatusCode::CONFLICT,
            "An agent with this name already exists in this gateway workspace.",
        ));
    }

    let desired_key = identity::agent_session_key(requested_name);
    if db_ops::get_agent_by_session_key(conn, &gateway.id, &desired_key)
        .filter(not_self)
        .is_some()
    {
        return Err(api_error(
            StatusCode::CONFLICT,
            "This agent name would collide with an existing workspace session key. Pick a different name.",
        ));
    }
    Ok(())
}

struct PersistedAgent {
    agent: Agent,
    raw_token: String,
    session_error: Option<String>,
}

/// Persist a new provisioning agent row with a fresh token and its remote
/// session ensured. Session failures are recorded, never fatal.
async fn persist_new_agent(
    state: &AppState,
    gateway: &Gateway,
    board_id: Option<&str>,
    input: &CreateAgent,
) -> Result<PersistedAgent, ApiError> {
    let raw_token = tokens::generate_token();
    let session_key = identity::agent_session_key(&input.name);
    let ts = db_ops::now();
    let agent = Agent {
        id: Uuid::new_v4().to_string(),
        name: input.name.clone(),
        status: AgentStatus::Provisioning.as_str().to_string(),
        board_id: board_id.map(|s| s.to_string()),
        gateway_id: gateway.id.clone(),
        is_board_lead: input.is_board_lead.unwrap_or(false),
        session_key: Some(session_key.clone()),
        token_hash: Some(tokens::hash_token(&raw_token)),
        heartbeat_config: Some(
            input
                .heartbeat_config
                .clone()
                .unwrap_or_else(default_heartbeat_config),
        ),
        identity_profile: input.identity_profile.clone(),
        soul_template: input.soul_template.clone(),
        provision_requested_at: Some(ts.clone()),
        provision_action: Some("provision".to_string()),
        last_seen_at: None,
        created_at: ts.clone(),
        updated_at: ts,
        is_gateway_main: board_id.is_none(),
    };

    let session_error = match provisioning::gateway_target(gateway) {
        Ok(target) => {
            provisioning::ensure_gateway_session(state, &target, &session_key, &agent.name).await
        }
        Err(_) => Some("Gateway url is required".to_string()),
    };

    {
        let conn = state.db.lock().unwrap();
        db_ops::insert_agent(&conn, &agent);
        provisioning::record_session_creation(&conn, &agent, session_error.as_deref());
    }

    Ok(PersistedAgent {
        agent,
        raw_token,
        session_error,
    })
}

pub async fn create_agent(
    state: &AppState,
    input: &CreateAgent,
) -> Result<(Agent, String), ApiError> {
    if input.name.trim().is_empty() {
        return Err(api_error(StatusCode::UNPROCESSABLE_ENTITY, "name is required"));
    }
    let board_id = input.board_id.as_deref().ok_or_else(|| {
        api_error(StatusCode::UNPROCESSABLE_ENTITY, "board_id is required")
    })?;

    let (board, gateway) = {
        let conn = state.db.lock().unwrap();
        let board = require_board(&conn, board_id)?;
        let gateway = require_board_gateway(&conn, &board)?;
        ensure_unique_agent_name(&conn, &board, &gateway, &input.name, None)?;
        (board, gateway)
    };

    assert_gateway_compatible(state, &gateway).await?;

    // Re-check under the lock in case a concurrent create won the race.
    {
        let conn = state.db.lock().unwrap();
        ensure_unique_agent_name(&conn, &board, &gateway, &input.name, None)?;
    }

    let persisted = persist_new_agent(state, &gateway, Some(&board.id), input).await?;

    // Provision failures on create are not fatal: the reconcile loop
    // picks the agent up from its provision markers.
    provisioning::execute_provision(
        state,
        &gateway,
        &persisted.agent.id,
        "provision",
        Some(&persisted.raw_token),
        false,
        false,
    )
    .await?;

    let agent = {
        let conn = state.db.lock().unwrap();
        db_ops::get_agent(&conn, &persisted.agent.id)
    }
    .map(lifecycle::with_computed_status)
    .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Agent not found"))?;

    Ok((agent, persisted.raw_token))
}

pub async fn update_agent(
    state: &AppState,
    agent_id: &str,
    input: &UpdateAgent,
    force: bool,
) -> Result<Agent, ApiError> {
    if input.status.is_some() {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "status is controlled by agent heartbeat",
        ));
    }

    let mut agent = {
        let conn = state.db.lock().unwrap();
        db_ops::get_agent(&conn, agent_id)
    }
    .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Agent not found"))?;

    let make_main = input.is_gateway_main;
    let was_main = agent.board_id.is_none();
    let mut changed = force;

    // Resolve the gateway the mutation targets before touching the row.
    let gateway = {
        let conn = state.db.lock().unwrap();
        if make_main == Some(true) || (make_main.is_none() && was_main) {
            db_ops::get_gateway(&conn, &agent.gateway_id)
                .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Gateway not found"))?
        } else {
            let board_id = input
                .board_id
                .clone()
                .or_else(|| agent.board_id.clone())
                .ok_or_else(|| {
                    api_error(
                        StatusCode::UNPROCESSABLE_ENTITY,
                        "board_id is required when converting a gateway-main agent to board scope",
                    )
                })?;
            let board = require_board(&conn, &board_id)?;
            require_board_gateway(&conn, &board)?
        }
    };

    assert_gateway_compatible(state, &gateway).await?;

    let mut raw_token: Option<String> = None;
    {
        let conn = state.db.lock().unwrap();

        if let Some(name) = &input.name {
            if !name.trim().is_empty() && *name != agent.name {
                match agent.board_id.as_deref() {
                    Some(board_id) => {
                        let board = require_board(&conn, board_id)?;
                        ensure_unique_agent_name(&conn, &board, &gateway, name, Some(&agent.id))?;
                    }
                    // Boardless rows still collide gateway-wide.
                    None => {
                        ensure_unique_gateway_name(&conn, &gateway, name, Some(&agent.id))?;
                    }
                }
                agent.name = name.clone();
                changed = true;
            }
        }

        match make_main {
            Some(true) => {
                if let Some(existing) = db_ops::gateway_main_agent(&conn, &gateway.id) {
                    if existing.id != agent.id {
                        return Err(api_error(
                            StatusCode::CONFLICT,
                            "This gateway already has a dedicated gateway agent.",
                        ));
                    }
                }
                agent.board_id = None;
                agent.gateway_id = gateway.id.clone();
                agent.is_board_lead = false;
                agent.session_key = Some(identity::MAIN_SESSION_KEY.to_string());
                changed = true;
            }
            Some(false) => {
                let board_id = input.board_id.clone().ok_or_else(|| {
                    api_error(
                        StatusCode::UNPROCESSABLE_ENTITY,
                        "board_id is required when converting a gateway-main agent to board scope",
                    )
                })?;
                let board = require_board(&conn, &board_id)?;
                let board_gateway = require_board_gateway(&conn, &board)?;
                agent.board_id = Some(board.id);
                agent.gateway_id = board_gateway.id;
                agent.session_key = Some(identity::agent_session_key(&agent.name));
                changed = true;
            }
            None => {
                if let Some(board_id) = &input.board_id {
                    if was_main {
                        // A gateway-main agent keeps its role; board moves
                        // are ignored for it.
                    } else {
                        let board = require_board(&conn, board_id)?;
                        let board_gateway = require_board_gateway(&conn, &board)?;
                        if agent.board_id.as_deref() != Some(board.id.as_str()) {
                            agent.board_id = Some(board.id);
                            agent.gateway_id = board_gateway.id;
                            changed = true;
                        }
                    }
                }
            }
        }

        if let Some(is_board_lead) = input.is_board_lead {
            if agent.board_id.is_some() && agent.is_board_lead != is_board_lead {
                agent.is_board_lead = is_board_lead;
                changed = true;
            }
        }
        if let Some(heartbeat_config) = &input.heartbeat_config {
            agent.heartbeat_config = Some(heartbeat_config.clone());
            changed = true;
        }
        if let Some(identity_profile) = &input.identity_profile {
            agent.identity_profile = Some(identity_profile.clone());
            changed = true;
        }
        if let Some(soul_template) = &input.soul_template {
            agent.soul_template = Some(soul_template.clone());
            changed = true;
        }
        if agent.heartbeat_config.is_none() {
            agent.heartbeat_config = Some(default_heartbeat_config());
        }

        if changed {
            // Every accepted update rotates the credential; the new token
            // rides out to the workspace on the provision push.
            let raw = tokens::generate_token();
            agent.token_hash = Some(tokens::hash_token(&raw));
            raw_token = Some(raw);
            agent.status = AgentStatus::Updating.as_str().to_string();
            agent.provision_requested_at = Some(db_ops::now());
            agent.provision_action = Some("update".to_string());
        }
        db_ops::update_agent_row(&conn, &agent);
    }

    if changed {
        // Gateway failures on update are fatal; markers stay set so the
        // reconcile loop can finish the job after the 502.
        provisioning::execute_provision(
            state,
            &gateway,
            &agent.id,
            "update",
            raw_token.as_deref(),
            false,
            true,
        )
        .await?;
    }

    let agent = {
        let conn = state.db.lock().unwrap();
        db_ops::get_agent(&conn, &agent.id)
    }
    .map(lifecycle::with_computed_status)
    .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Agent not found"))?;
    Ok(agent)
}

fn cleanup_message(agent: &Agent, workspace_path: &str) -> String {
    format!(
        "Cleanup request for deleted agent.\n\n\
         Agent name: {}\n\
         Agent id: {}\n\
         Workspace path: {}\n\n\
         Actions:\n\
         1) Remove the workspace directory.\n\
         2) Reply NO_REPLY.\n",
        agent.name, agent.id, workspace_path
    )
}

/// Delete an agent. Remote teardown is best effort: a failed RPC lands on
/// the activity log and the local row goes away regardless. A missing
/// local row is a no-op.
pub async fn delete_agent(state: &AppState, agent_id: &str) -> Result<OkResponse, ApiError> {
    let (agent, gateway) = {
        let conn = state.db.lock().unwrap();
        let Some(agent) = db_ops::get_agent(&conn, agent_id) else {
            return Ok(OkResponse::default());
        };
        let gateway = db_ops::get_gateway(&conn, &agent.gateway_id);
        (agent, gateway)
    };

    {
        let conn = state.db.lock().unwrap();
        db_ops::set_agent_status(&conn, &agent.id, AgentStatus::Deleting.as_str());
        db_ops::set_provision_markers(&conn, &agent.id, Some("delete"));
    }

    let target = gateway
        .as_ref()
        .and_then(|gw| provisioning::gateway_target(gw).ok());

    if let Some(target) = &target {
        let remote_id = identity::gateway_agent_id(agent.session_key.as_deref(), &agent.name);
        if let Err(err) = with_retry("agents.delete", || {
            state.gateway.call(
                target,
                "agents.delete",
                serde_json::json!({"agentId": remote_id}),
            )
        })
        .await
        {
            tracing::warn!(agent = %agent.name, error = %err, "remote teardown failed");
            let conn = state.db.lock().unwrap();
            db_ops::record_activity(
                &conn,
                &activity::instruction_failed("delete"),
                &format!("Gateway cleanup failed for {}: {}", agent.name, err),
                None,
                agent.board_id.as_deref(),
            );
        }
    }

    {
        let conn = state.db.lock().unwrap();
        db_ops::detach_agent_references(&conn, &agent.id);
        db_ops::delete_agent_row(&conn, &agent.id);
        db_ops::record_activity(
            &conn,
            &activity::instruction_completed("delete"),
            &format!("Agent {} deleted.", agent.name),
            None,
            agent.board_id.as_deref(),
        );
    }

    // Ask the gateway-main agent to sweep the workspace directory. Best
    // effort: on failure the request is parked on the durable queue.
    if let (Some(gateway), Some(target)) = (gateway.as_ref(), target.as_ref()) {
        if let Some(workspace_root) = gateway.workspace_root.as_deref() {
            let workspace = identity::workspace_path(workspace_root, &agent.name);
            let message = cleanup_message(&agent, &workspace);
            let send = async {
                state
                    .gateway
                    .call(
                        target,
                        "sessions.ensure",
                        serde_json::json!({"key": identity::MAIN_SESSION_KEY, "label": "Gateway Agent"}),
                    )
                    .await?;
                state
                    .gateway
                    .call(
                        target,
                        "sessions.send",
                        serde_json::json!({
                            "sessionKey": identity::MAIN_SESSION_KEY,
                            "message": message,
                            "deliver": false,
                        }),
                    )
                    .await
            };
            if let Err(err) = send.await {
                tracing::warn!(agent = %agent.name, error = %err, "cleanup message deferred to queue");
                let conn = state.db.lock().unwrap();
                queue::enqueue(
                    &conn,
                    "session.message",
                    &serde_json::json!({
                        "gateway_id": gateway.id,
                        "session_key": identity::MAIN_SESSION_KEY,
                        "message": message,
                        "deliver": false,
                    }),
                );
            }
        }
    }

    tracing::info!(agent_id, "agent deleted");
    Ok(OkResponse::default())
}

/// Idempotent heartbeat upsert keyed on (name, board). Existing rows get a
/// heartbeat; unknown names become fresh provisioning agents; rows without
/// a token get one backfilled and a reprovision.
pub async fn heartbeat_or_create(
    state: &AppState,
    identity_ctx: &Identity,
    payload: &HeartbeatOrCreate,
) -> Result<Agent, ApiError> {
    // Agents can only beat for themselves.
    if let Identity::AgentIdentity { agent } = identity_ctx {
        let conn = state.db.lock().unwrap();
        return lifecycle::commit_heartbeat(&conn, &agent.id, payload.status.as_deref())
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Agent not found"));
    }

    let existing = {
        let conn = state.db.lock().unwrap();
        match payload.board_id.as_deref() {
            Some(board_id) => db_ops::find_agent_on_board_by_name(&conn, board_id, &payload.name),
            None => {
                let gateway = db_ops::default_gateway(&conn);
                gateway.and_then(|gw| {
                    db_ops::find_agents_by_name(&conn, &gw.id, &payload.name)
                        .into_iter()
                        .next()
                })
            }
        }
    };

    let agent = match existing {
        Some(agent) if agent.token_hash.is_some() => agent,
        Some(mut agent) => {
            // Known row without credentials: backfill a token and push it
            // out through a fresh provision.
            let raw_token = tokens::generate_token();
            let gateway = {
                let conn = state.db.lock().unwrap();
                agent.token_hash = Some(tokens::hash_token(&raw_token));
                if agent.heartbeat_config.is_none() {
                    agent.heartbeat_config = Some(default_heartbeat_config());
                }
                agent.provision_requested_at = Some(db_ops::now());
                agent.provision_action = Some("provision".to_string());
                db_ops::update_agent_row(&conn, &agent);
                db_ops::get_gateway(&conn, &agent.gateway_id)
            };
            if let Some(gateway) = gateway {
                provisioning::execute_provision(
                    state,
                    &gateway,
                    &agent.id,
                    "provision",
                    Some(&raw_token),
                    false,
                    false,
                )
                .await?;
            }
            agent
        }
        None => {
            let input = CreateAgent {
                name: payload.name.clone(),
                board_id: payload.board_id.clone(),
                is_board_lead: None,
                heartbeat_config: None,
                identity_profile: None,
                soul_template: None,
            };
            let (agent, _token) = create_agent(state, &input).await?;
            agent
        }
    };

    let conn = state.db.lock().unwrap();
    lifecycle::commit_heartbeat(&conn, &agent.id, payload.status.as_deref())
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Agent not found"))
}

// --- Gateway-main agent self-heal ---

/// Normalize the single gateway-main row, creating it on first contact.
/// Returns the row, whether anything changed, and a raw token when one
/// was freshly issued (so callers can push it out through a provision).
pub fn upsert_main_agent_record(
    conn: &Connection,
    gateway: &Gateway,
) -> (Agent, bool, Option<String>) {
    if let Some(mut agent) = db_ops::gateway_main_agent(conn, &gateway.id) {
        let mut changed = false;
        let mut raw_token = None;
        if agent.session_key.as_deref() != Some(identity::MAIN_SESSION_KEY) {
            agent.session_key = Some(identity::MAIN_SESSION_KEY.to_string());
            changed = true;
        }
        if agent.is_board_lead {
            agent.is_board_lead = false;
            changed = true;
        }
        if agent.heartbeat_config.is_none() {
            agent.heartbeat_config = Some(default_heartbeat_config());
            changed = true;
        }
        if agent.identity_profile.is_none() {
            agent.identity_profile = Some(default_main_identity_profile());
            changed = true;
        }
        if agent.token_hash.is_none() {
            let raw = tokens::generate_token();
            agent.token_hash = Some(tokens::hash_token(&raw));
            raw_token = Some(raw);
            changed = true;
        }
        if changed {
            db_ops::update_agent_row(conn, &agent);
        }
        return (agent, changed, raw_token);
    }

    let raw_token = tokens::generate_token();
    let ts = db_ops::now();
    let agent = Agent {
        id: Uuid::new_v4().to_string(),
        name: "Gateway Agent".to_string(),
        status: AgentStatus::Provisioning.as_str().to_string(),
        board_id: None,
        gateway_id: gateway.id.clone(),
        is_board_lead: false,
        session_key: Some(identity::MAIN_SESSION_KEY.to_string()),
        token_hash: Some(tokens::hash_token(&raw_token)),
        heartbeat_config: Some(default_heartbeat_config()),
        identity_profile: Some(default_main_identity_profile()),
        soul_template: None,
        provision_requested_at: Some(ts.clone()),
        provision_action: Some("provision".to_string()),
        last_seen_at: None,
        created_at: ts.clone(),
        updated_at: ts,
        is_gateway_main: true,
    };
    db_ops::insert_agent(conn, &agent);
    (agent, true, Some(raw_token))
}

/// Does the remote runtime already know a main agent? Probe errors count
/// as yes so an unreachable gateway never triggers a reprovision storm.
pub async fn gateway_has_main_agent_entry(state: &AppState, gateway: &Gateway) -> bool {
    let Ok(target) = provisioning::gateway_target(gateway) else {
        return true;
    };
    let payload = match state
        .gateway
        .call(&target, "agents.list", serde_json::json!({}))
        .await
    {
        Ok(payload) => payload,
        Err(_) => return true,
    };
    if payload.get("defaultId").and_then(|v| v.as_str()).is_some() {
        return true;
    }
    let entries = crate::gateway::normalize_list(&payload, "agents");
    entries.iter().any(|entry| {
        entry.get("id").and_then(|v| v.as_str()) == Some(identity::MAIN_AGENT_ID)
            || entry.get("sessionKey").and_then(|v| v.as_str())
                == Some(identity::MAIN_SESSION_KEY)
    })
}

/// Push the main agent's workspace out. Local state is already committed;
/// the remote leg is best effort and lands on the reconcile loop on failure.
pub async fn provision_main_agent_record(
    state: &AppState,
    gateway: &Gateway,
    agent_id: &str,
    raw_token: Option<&str>,
) {
    {
        let conn = state.db.lock().unwrap();
        db_ops::set_provision_markers(&conn, agent_id, Some("provision"));
    }
    let _ = provisioning::execute_provision(
        state,
        gateway,
        agent_id,
        "provision",
        raw_token,
        false,
        false,
    )
    .await;
}

/// Make sure a gateway has a healthy main-agent row, reprovisioning when
/// the row was repaired, carries no token, or the runtime lost its entry.
pub async fn ensure_main_agent(state: &AppState, gateway_id: &str) -> Result<Agent, ApiError> {
    let gateway = {
        let conn = state.db.lock().unwrap();
        db_ops::get_gateway(&conn, gateway_id)
    }
    .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Gateway not found"))?;

    let (agent, changed, raw_token) = {
        let conn = state.db.lock().unwrap();
        upsert_main_agent_record(&conn, &gateway)
    };
    let needs_provision =
        changed || agent.token_hash.is_none() || !gateway_has_main_agent_entry(state, &gateway).await;
    if needs_provision {
        provision_main_agent_record(state, &gateway, &agent.id, raw_token.as_deref()).await;
    }

    let conn = state.db.lock().unwrap();
    db_ops::get_agent(&conn, &agent.id)
        .map(lifecycle::with_computed_status)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Agent not found"))
}

/// One pass of the gateway-main reconciliation loop. Returns how many
/// gateways were repaired.
pub async fn ensure_gateway_agents_exist(state: &AppState) -> usize {
    let gateways = {
        let conn = state.db.lock().unwrap();
        db_ops::list_gateways(&conn)
    };
    let mut repaired = 0usize;
    for gateway in gateways {
        let (agent, changed, raw_token) = {
            let conn = state.db.lock().unwrap();
            upsert_main_agent_record(&conn, &gateway)
        };
        let needs_provision = changed
            || agent.token_hash.is_none()
            || !gateway_has_main_agent_entry(state, &gateway).await;
        if needs_provision {
            provision_main_agent_record(state, &gateway, &agent.id, raw_token.as_deref()).await;
            repaired += 1;
        }
    }
    repaired
}
