//! Bulk re-push of workspace templates to every agent on a gateway, with
//! optional credential rotation and a token drift audit against the
//! TOOLS.md each workspace carries.

use axum::http::StatusCode;

use crate::activity;
use crate::app::AppState;
use crate::db_ops;
use crate::error::{api_error, ApiError};
use crate::gateway::{retry::with_retry, GatewayTarget};
use crate::identity;
use crate::services::admin;
use crate::services::coordination::gateway_file_content;
use crate::services::provisioning;
use crate::tokens;
use missionctl_models::*;

/// Pull the AUTH_TOKEN value out of a workspace TOOLS.md. The file is a
/// KEY=value sheet with surrounding prose; unknown lines are ignored.
pub fn parse_auth_token(tools_md: &str) -> Option<String> {
    for line in tools_md.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("AUTH_TOKEN=") {
            let value = value.trim().trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

async fn remote_auth_token(
    state: &AppState,
    target: &GatewayTarget,
    agent: &Agent,
) -> Option<String> {
    let remote_id = identity::gateway_agent_id(agent.session_key.as_deref(), &agent.name);
    let payload = with_retry("agents.files.get", || {
        state.gateway.call(
            target,
            "agents.files.get",
            serde_json::json!({"agentId": remote_id, "name": "TOOLS.md"}),
        )
    })
    .await
    .ok()?;
    gateway_file_content(&payload).and_then(|text| parse_auth_token(&text))
}

fn mark_for_provision(state: &AppState, agent_id: &str) {
    let conn = state.db.lock().unwrap();
    if let Some(mut agent) = db_ops::get_agent(&conn, agent_id) {
        agent.status = AgentStatus::Updating.as_str().to_string();
        agent.provision_requested_at = Some(db_ops::now());
        agent.provision_action = Some("update".to_string());
        db_ops::update_agent_row(&conn, &agent);
    }
}

/// Did the last provision settle? Success clears the markers.
fn provision_settled(state: &AppState, agent_id: &str) -> bool {
    let conn = state.db.lock().unwrap();
    db_ops::get_agent(&conn, agent_id)
        .map(|a| a.provision_requested_at.is_none())
        .unwrap_or(false)
}

async fn sync_one_agent(
    state: &AppState,
    gateway: &Gateway,
    target: &GatewayTarget,
    agent: &Agent,
    options: &TemplateSyncQuery,
) -> Result<(), String> {
    let raw_token = if options.rotate_tokens {
        let raw = tokens::generate_token();
        let conn = state.db.lock().unwrap();
        if let Some(mut current) = db_ops::get_agent(&conn, &agent.id) {
            current.token_hash = Some(tokens::hash_token(&raw));
            db_ops::update_agent_row(&conn, &current);
        }
        Some(raw)
    } else {
        // Audit only: compare the credential the workspace carries against
        // the stored hash and log drift instead of silently overwriting.
        match (remote_auth_token(state, target, agent).await, &agent.token_hash) {
            (Some(remote), Some(stored)) if !tokens::token_matches(&remote, stored) => {
                tracing::warn!(
                    agent = %agent.name,
                    "workspace auth token does not match the stored credential"
                );
                None
            }
            _ => None,
        }
    };

    if options.reset_sessions {
        if let Some(session_key) = agent.session_key.as_deref() {
            provisioning::ensure_gateway_session(state, target, session_key, &agent.name).await;
        }
    }

    mark_for_provision(state, &agent.id);
    provisioning::execute_provision(
        state,
        gateway,
        &agent.id,
        "update",
        raw_token.as_deref(),
        options.force_bootstrap,
        false,
    )
    .await
    .map_err(|_| "provision failed".to_string())?;

    if provision_settled(state, &agent.id) {
        Ok(())
    } else {
        Err("Workspace push failed; queued for reconcile.".to_string())
    }
}

pub async fn sync_templates(
    state: &AppState,
    gateway_id: Option<&str>,
    options: &TemplateSyncQuery,
) -> Result<TemplatesSyncResult, ApiError> {
    let gateway = {
        let conn = state.db.lock().unwrap();
        match gateway_id {
            Some(id) => db_ops::get_gateway(&conn, id),
            None => db_ops::default_gateway(&conn),
        }
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Gateway not found"))?
    };
    admin::assert_gateway_compatible(state, &gateway).await?;
    let target = provisioning::gateway_target(&gateway)?;

    let agents: Vec<Agent> = {
        let conn = state.db.lock().unwrap();
        db_ops::list_agents_for_gateway(&conn, &gateway.id)
            .into_iter()
            .filter(|a| a.board_id.is_some())
            .filter(|a| match options.board_id.as_deref() {
                Some(board_id) => a.board_id.as_deref() == Some(board_id),
                None => true,
            })
            .collect()
    };

    let mut agents_updated = 0usize;
    let mut agents_skipped = 0usize;
    let mut errors: Vec<TemplatesSyncError> = Vec::new();

    for agent in &agents {
        if agent.session_key.is_none() {
            agents_skipped += 1;
            errors.push(TemplatesSyncError {
                agent_id: Some(agent.id.clone()),
                agent_name: Some(agent.name.clone()),
                board_id: agent.board_id.clone(),
                message: "Agent has no session key".to_string(),
            });
            continue;
        }
        match sync_one_agent(state, &gateway, &target, agent, options).await {
            Ok(()) => agents_updated += 1,
            Err(message) => {
                errors.push(TemplatesSyncError {
                    agent_id: Some(agent.id.clone()),
                    agent_name: Some(agent.name.clone()),
                    board_id: agent.board_id.clone(),
                    message,
                });
            }
        }
    }

    // Main-agent pass: self-heal the row first, then re-push its workspace
    // like any other agent.
    let mut main_updated = false;
    if options.include_main {
        let (main_agent, _changed, raw_token) = {
            let conn = state.db.lock().unwrap();
            admin::upsert_main_agent_record(&conn, &gateway)
        };
        if let Some(raw) = raw_token.as_deref() {
            admin::provision_main_agent_record(state, &gateway, &main_agent.id, Some(raw)).await;
        }
        match sync_one_agent(state, &gateway, &target, &main_agent, options).await {
            Ok(()) => main_updated = true,
            Err(message) => errors.push(TemplatesSyncError {
                agent_id: Some(main_agent.id.clone()),
                agent_name: Some(main_agent.name.clone()),
                board_id: None,
                message,
            }),
        }
    }

    {
        let conn = state.db.lock().unwrap();
        db_ops::record_activity(
            &conn,
            activity::TEMPLATES_SYNCED,
            &format!(
                "Templates synced for {} agents (skipped: {}, failed: {}).",
                agents_updated,
                agents_skipped,
                errors.len().saturating_sub(agents_skipped)
            ),
            None,
            options.board_id.as_deref(),
        );
    }

    Ok(TemplatesSyncResult {
        gateway_id: gateway.id,
        include_main: options.include_main,
        reset_sessions: options.reset_sessions,
        agents_updated,
        agents_skipped,
        main_updated,
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_token_parses_from_key_value_sheet() {
        let tools = "# Tools\n\nSERVER_URL=http://localhost:8080\nAUTH_TOKEN=mct_abc123\n";
        assert_eq!(parse_auth_token(tools).as_deref(), Some("mct_abc123"));
    }

    #[test]
    fn auth_token_tolerates_quotes_and_whitespace() {
        let tools = "  AUTH_TOKEN=\"mct_quoted\"  \n";
        assert_eq!(parse_auth_token(tools).as_deref(), Some("mct_quoted"));
    }

    #[test]
    fn missing_or_empty_auth_token_is_none() {
        assert_eq!(parse_auth_token("SERVER_URL=x\n"), None);
        assert_eq!(parse_auth_token("AUTH_TOKEN=\n"), None);
    }
}
