use chrono::Utc;
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use missionctl_models::*;

// --- Helpers ---

pub fn now() -> String {
    Utc::now().to_rfc3339()
}

fn json_text(value: &Option<serde_json::Value>) -> Option<String> {
    value.as_ref().map(|v| v.to_string())
}

fn parse_json(text: Option<String>) -> Option<serde_json::Value> {
    text.and_then(|t| serde_json::from_str(&t).ok())
}

fn agent_from_row(row: &Row) -> rusqlite::Result<Agent> {
    let board_id: Option<String> = row.get("board_id")?;
    let heartbeat_config: Option<String> = row.get("heartbeat_config")?;
    let identity_profile: Option<String> = row.get("identity_profile")?;
    Ok(Agent {
        id: row.get("id")?,
        name: row.get("name")?,
        status: row.get("status")?,
        is_gateway_main: board_id.is_none(),
        board_id,
        gateway_id: row.get("gateway_id")?,
        is_board_lead: row.get::<_, i64>("is_board_lead")? != 0,
        session_key: row.get("session_key")?,
        token_hash: row.get("token_hash")?,
        heartbeat_config: parse_json(heartbeat_config),
        identity_profile: parse_json(identity_profile),
        soul_template: row.get("soul_template")?,
        provision_requested_at: row.get("provision_requested_at")?,
        provision_action: row.get("provision_action")?,
        last_seen_at: row.get("last_seen_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn gateway_from_row(row: &Row) -> rusqlite::Result<Gateway> {
    Ok(Gateway {
        id: row.get("id")?,
        organization_id: row.get("organization_id")?,
        name: row.get("name")?,
        url: row.get("url")?,
        token: row.get("token")?,
        workspace_root: row.get("workspace_root")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn board_from_row(row: &Row) -> rusqlite::Result<Board> {
    Ok(Board {
        id: row.get("id")?,
        organization_id: row.get("organization_id")?,
        gateway_id: row.get("gateway_id")?,
        name: row.get("name")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get("id")?,
        board_id: row.get("board_id")?,
        title: row.get("title")?,
        status: row.get("status")?,
        assigned_agent_id: row.get("assigned_agent_id")?,
        in_progress_at: row.get("in_progress_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn activity_from_row(row: &Row) -> rusqlite::Result<ActivityEvent> {
    Ok(ActivityEvent {
        id: row.get("id")?,
        event_type: row.get("event_type")?,
        message: row.get("message")?,
        agent_id: row.get("agent_id")?,
        board_id: row.get("board_id")?,
        created_at: row.get("created_at")?,
    })
}

// --- Organizations & gateways ---

pub fn ensure_default_org(conn: &Connection, name: &str) -> Organization {
    if let Ok(org) = conn.query_row(
        "SELECT id, name, created_at FROM organizations WHERE name = ?1",
        params![name],
        |row| {
            Ok(Organization {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: row.get(2)?,
            })
        },
    ) {
        return org;
    }
    let org = Organization {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        created_at: now(),
    };
    conn.execute(
        "INSERT INTO organizations (id, name, created_at) VALUES (?1, ?2, ?3)",
        params![org.id, org.name, org.created_at],
    )
    .unwrap();
    org
}

/// Upsert the gateway row for an organization. Connection settings come
/// from process config, so restarts refresh url/token in place.
pub fn ensure_gateway(
    conn: &Connection,
    organization_id: &str,
    name: &str,
    url: Option<&str>,
    token: Option<&str>,
    workspace_root: Option<&str>,
) -> Gateway {
    let existing = conn
        .query_row(
            "SELECT * FROM gateways WHERE organization_id = ?1 AND name = ?2",
            params![organization_id, name],
            gateway_from_row,
        )
        .ok();
    if let Some(gw) = existing {
        conn.execute(
            "UPDATE gateways SET url = ?1, token = ?2, workspace_root = ?3, updated_at = ?4 WHERE id = ?5",
            params![url, token, workspace_root, now(), gw.id],
        )
        .unwrap();
        return get_gateway(conn, &gw.id).unwrap();
    }
    let ts = now();
    let gw = Gateway {
        id: Uuid::new_v4().to_string(),
        organization_id: organization_id.to_string(),
        name: name.to_string(),
        url: url.map(|s| s.to_string()),
        token: token.map(|s| s.to_string()),
        workspace_root: workspace_root.map(|s| s.to_string()),
        created_at: ts.clone(),
        updated_at: ts,
    };
    conn.execute(
        "INSERT INTO gateways (id, organization_id, name, url, token, workspace_root, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            gw.id,
            gw.organization_id,
            gw.name,
            gw.url,
            gw.token,
            gw.workspace_root,
            gw.created_at,
            gw.updated_at
        ],
    )
    .unwrap();
    gw
}

pub fn get_gateway(conn: &Connection, id: &str) -> Option<Gateway> {
    conn.query_row(
        "SELECT * FROM gateways WHERE id = ?1",
        params![id],
        gateway_from_row,
    )
    .ok()
}

pub fn get_gateway_for_board(conn: &Connection, board_id: &str) -> Option<Gateway> {
    conn.query_row(
        "SELECT g.* FROM gateways g JOIN boards b ON b.gateway_id = g.id WHERE b.id = ?1",
        params![board_id],
        gateway_from_row,
    )
    .ok()
}

pub fn default_gateway(conn: &Connection) -> Option<Gateway> {
    conn.query_row(
        "SELECT * FROM gateways ORDER BY created_at LIMIT 1",
        [],
        gateway_from_row,
    )
    .ok()
}

pub fn list_gateways(conn: &Connection) -> Vec<Gateway> {
    let mut stmt = conn
        .prepare("SELECT * FROM gateways ORDER BY created_at")
        .unwrap();
    stmt.query_map([], gateway_from_row)
        .unwrap()
        .filter_map(|r| r.ok())
        .collect()
}

// --- Boards ---

pub fn create_board(
    conn: &Connection,
    organization_id: &str,
    gateway_id: Option<&str>,
    name: &str,
) -> Board {
    let ts = now();
    let board = Board {
        id: Uuid::new_v4().to_string(),
        organization_id: organization_id.to_string(),
        gateway_id: gateway_id.map(|s| s.to_string()),
        name: name.to_string(),
        created_at: ts.clone(),
        updated_at: ts,
    };
    conn.execute(
        "INSERT INTO boards (id, organization_id, gateway_id, name, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            board.id,
            board.organization_id,
            board.gateway_id,
            board.name,
            board.created_at,
            board.updated_at
        ],
    )
    .unwrap();
    board
}

pub fn get_board(conn: &Connection, id: &str) -> Option<Board> {
    conn.query_row(
        "SELECT * FROM boards WHERE id = ?1",
        params![id],
        board_from_row,
    )
    .ok()
}

pub fn list_boards(conn: &Connection) -> Vec<Board> {
    let mut stmt = conn
        .prepare("SELECT * FROM boards ORDER BY created_at")
        .unwrap();
    stmt.query_map([], board_from_row)
        .unwrap()
        .filter_map(|r| r.ok())
        .collect()
}

pub fn list_boards_for_gateway(conn: &Connection, gateway_id: &str) -> Vec<Board> {
    let mut stmt = conn
        .prepare("SELECT * FROM boards WHERE gateway_id = ?1 ORDER BY created_at")
        .unwrap();
    stmt.query_map(params![gateway_id], board_from_row)
        .unwrap()
        .filter_map(|r| r.ok())
        .collect()
}

// --- Agents ---

pub fn insert_agent(conn: &Connection, agent: &Agent) {
    conn.execute(
        "INSERT INTO agents (id, name, status, board_id, gateway_id, is_board_lead, session_key,
                             token_hash, heartbeat_config, identity_profile, soul_template,
                             provision_requested_at, provision_action, last_seen_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            agent.id,
            agent.name,
            agent.status,
            agent.board_id,
            agent.gateway_id,
            agent.is_board_lead as i64,
            agent.session_key,
            agent.token_hash,
            json_text(&agent.heartbeat_config),
            json_text(&agent.identity_profile),
            agent.soul_template,
            agent.provision_requested_at,
            agent.provision_action,
            agent.last_seen_at,
            agent.created_at,
            agent.updated_at
        ],
    )
    .unwrap();
}

pub fn update_agent_row(conn: &Connection, agent: &Agent) {
    conn.execute(
        "UPDATE agents SET name = ?1, status = ?2, board_id = ?3, is_board_lead = ?4,
                           session_key = ?5, token_hash = ?6, heartbeat_config = ?7,
                           identity_profile = ?8, soul_template = ?9, provision_requested_at = ?10,
                           provision_action = ?11, last_seen_at = ?12, updated_at = ?13
         WHERE id = ?14",
        params![
            agent.name,
            agent.status,
            agent.board_id,
            agent.is_board_lead as i64,
            agent.session_key,
            agent.token_hash,
            json_text(&agent.heartbeat_config),
            json_text(&agent.identity_profile),
            agent.soul_template,
            agent.provision_requested_at,
            agent.provision_action,
            agent.last_seen_at,
            now(),
            agent.id
        ],
    )
    .unwrap();
}

pub fn get_agent(conn: &Connection, id: &str) -> Option<Agent> {
    conn.query_row(
        "SELECT * FROM agents WHERE id = ?1",
        params![id],
        agent_from_row,
    )
    .ok()
}

/// Salted hashes rule out an equality lookup; scan the credentialed rows
/// and verify each candidate against the presented token.
pub fn find_agent_by_token(conn: &Connection, token: &str) -> Option<Agent> {
    let mut stmt = conn
        .prepare("SELECT * FROM agents WHERE token_hash IS NOT NULL")
        .unwrap();
    let agents: Vec<Agent> = stmt
        .query_map([], agent_from_row)
        .unwrap()
        .filter_map(|r| r.ok())
        .collect();
    agents.into_iter().find(|agent| {
        agent
            .token_hash
            .as_deref()
            .map_or(false, |stored| crate::tokens::token_matches(token, stored))
    })
}

pub fn get_agent_by_session_key(
    conn: &Connection,
    gateway_id: &str,
    session_key: &str,
) -> Option<Agent> {
    conn.query_row(
        "SELECT * FROM agents WHERE gateway_id = ?1 AND session_key = ?2",
        params![gateway_id, session_key],
        agent_from_row,
    )
    .ok()
}

/// Case-insensitive name matches across the whole gateway.
pub fn find_agents_by_name(conn: &Connection, gateway_id: &str, name: &str) -> Vec<Agent> {
    let mut stmt = conn
        .prepare("SELECT * FROM agents WHERE gateway_id = ?1 AND name = ?2 COLLATE NOCASE")
        .unwrap();
    stmt.query_map(params![gateway_id, name], agent_from_row)
        .unwrap()
        .filter_map(|r| r.ok())
        .collect()
}

pub fn find_agent_on_board_by_name(
    conn: &Connection,
    board_id: &str,
    name: &str,
) -> Option<Agent> {
    conn.query_row(
        "SELECT * FROM agents WHERE board_id = ?1 AND name = ?2 COLLATE NOCASE",
        params![board_id, name],
        agent_from_row,
    )
    .ok()
}

/// The dedicated gateway-main agent: the one row with no board.
pub fn gateway_main_agent(conn: &Connection, gateway_id: &str) -> Option<Agent> {
    conn.query_row(
        "SELECT * FROM agents WHERE gateway_id = ?1 AND board_id IS NULL",
        params![gateway_id],
        agent_from_row,
    )
    .ok()
}

pub fn board_lead_agent(conn: &Connection, board_id: &str) -> Option<Agent> {
    conn.query_row(
        "SELECT * FROM agents WHERE board_id = ?1 AND is_board_lead = 1 ORDER BY created_at LIMIT 1",
        params![board_id],
        agent_from_row,
    )
    .ok()
}

pub fn list_agents(conn: &Connection, query: &AgentQuery) -> Vec<Agent> {
    let mut sql = String::from("SELECT * FROM agents WHERE 1=1");
    let mut binds: Vec<String> = Vec::new();
    if let Some(board_id) = &query.board_id {
        binds.push(board_id.clone());
        sql.push_str(&format!(" AND board_id = ?{}", binds.len()));
    }
    if let Some(gateway_id) = &query.gateway_id {
        binds.push(gateway_id.clone());
        sql.push_str(&format!(" AND gateway_id = ?{}", binds.len()));
    }
    sql.push_str(" ORDER BY created_at");
    let mut stmt = conn.prepare(&sql).unwrap();
    stmt.query_map(rusqlite::params_from_iter(binds.iter()), agent_from_row)
        .unwrap()
        .filter_map(|r| r.ok())
        .collect()
}

pub fn list_agents_for_gateway(conn: &Connection, gateway_id: &str) -> Vec<Agent> {
    list_agents(
        conn,
        &AgentQuery {
            board_id: None,
            gateway_id: Some(gateway_id.to_string()),
        },
    )
}

pub fn touch_agent_last_seen(conn: &Connection, id: &str) {
    let ts = now();
    conn.execute(
        "UPDATE agents SET last_seen_at = ?1, updated_at = ?1 WHERE id = ?2",
        params![ts, id],
    )
    .unwrap();
}

pub fn set_agent_status(conn: &Connection, id: &str, status: &str) {
    conn.execute(
        "UPDATE agents SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status, now(), id],
    )
    .unwrap();
}

/// Mark (or clear, with None) the pending provision request on an agent.
pub fn set_provision_markers(conn: &Connection, id: &str, action: Option<&str>) {
    match action {
        Some(action) => {
            let ts = now();
            conn.execute(
                "UPDATE agents SET provision_requested_at = ?1, provision_action = ?2, updated_at = ?1 WHERE id = ?3",
                params![ts, action, id],
            )
            .unwrap();
        }
        None => {
            conn.execute(
                "UPDATE agents SET provision_requested_at = NULL, provision_action = NULL, updated_at = ?1 WHERE id = ?2",
                params![now(), id],
            )
            .unwrap();
        }
    }
}

/// Agents stuck with a pending provision marker, for the reconcile loop.
pub fn agents_pending_provision(conn: &Connection) -> Vec<Agent> {
    let mut stmt = conn
        .prepare(
            "SELECT * FROM agents WHERE provision_requested_at IS NOT NULL ORDER BY provision_requested_at",
        )
        .unwrap();
    stmt.query_map([], agent_from_row)
        .unwrap()
        .filter_map(|r| r.ok())
        .collect()
}

/// Agents touched at or after the watermark, for the events stream.
pub fn agents_updated_since(
    conn: &Connection,
    board_id: Option<&str>,
    since: &str,
) -> Vec<Agent> {
    let mut sql =
        String::from("SELECT * FROM agents WHERE (updated_at >= ?1 OR last_seen_at >= ?1)");
    let mut binds: Vec<String> = vec![since.to_string()];
    if let Some(board_id) = board_id {
        binds.push(board_id.to_string());
        sql.push_str(" AND board_id = ?2");
    }
    sql.push_str(" ORDER BY updated_at");
    let mut stmt = conn.prepare(&sql).unwrap();
    stmt.query_map(rusqlite::params_from_iter(binds.iter()), agent_from_row)
        .unwrap()
        .filter_map(|r| r.ok())
        .collect()
}

/// Clear every foreign-key reference to an agent ahead of its deletion.
/// In-progress tasks go back to the inbox; other assignments are dropped
/// in place; history rows keep their content with the agent nulled out.
pub fn detach_agent_references(conn: &Connection, agent_id: &str) {
    let ts = now();
    conn.execute(
        "UPDATE tasks SET status = 'inbox', assigned_agent_id = NULL, in_progress_at = NULL, updated_at = ?1
         WHERE assigned_agent_id = ?2 AND status = 'in_progress'",
        params![ts, agent_id],
    )
    .unwrap();
    conn.execute(
        "UPDATE tasks SET assigned_agent_id = NULL, updated_at = ?1 WHERE assigned_agent_id = ?2",
        params![ts, agent_id],
    )
    .unwrap();
    conn.execute(
        "UPDATE approvals SET agent_id = NULL WHERE agent_id = ?1",
        params![agent_id],
    )
    .unwrap();
    conn.execute(
        "UPDATE activity_events SET agent_id = NULL WHERE agent_id = ?1",
        params![agent_id],
    )
    .unwrap();
}

pub fn delete_agent_row(conn: &Connection, agent_id: &str) -> bool {
    conn.execute("DELETE FROM agents WHERE id = ?1", params![agent_id])
        .unwrap()
        > 0
}

// --- Tasks ---

pub fn create_task(
    conn: &Connection,
    board_id: &str,
    title: &str,
    status: &str,
    assigned_agent_id: Option<&str>,
) -> Task {
    let ts = now();
    let task = Task {
        id: Uuid::new_v4().to_string(),
        board_id: board_id.to_string(),
        title: title.to_string(),
        status: status.to_string(),
        assigned_agent_id: assigned_agent_id.map(|s| s.to_string()),
        in_progress_at: if status == "in_progress" {
            Some(ts.clone())
        } else {
            None
        },
        created_at: ts.clone(),
        updated_at: ts,
    };
    conn.execute(
        "INSERT INTO tasks (id, board_id, title, status, assigned_agent_id, in_progress_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            task.id,
            task.board_id,
            task.title,
            task.status,
            task.assigned_agent_id,
            task.in_progress_at,
            task.created_at,
            task.updated_at
        ],
    )
    .unwrap();
    task
}

pub fn get_task(conn: &Connection, id: &str) -> Option<Task> {
    conn.query_row(
        "SELECT * FROM tasks WHERE id = ?1",
        params![id],
        task_from_row,
    )
    .ok()
}

// --- Approvals ---

pub fn create_approval(conn: &Connection, agent_id: Option<&str>, summary: &str) -> Approval {
    let approval = Approval {
        id: Uuid::new_v4().to_string(),
        agent_id: agent_id.map(|s| s.to_string()),
        status: "pending".to_string(),
        summary: Some(summary.to_string()),
        created_at: now(),
    };
    conn.execute(
        "INSERT INTO approvals (id, agent_id, status, summary, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            approval.id,
            approval.agent_id,
            approval.status,
            approval.summary,
            approval.created_at
        ],
    )
    .unwrap();
    approval
}

pub fn get_approval(conn: &Connection, id: &str) -> Option<Approval> {
    conn.query_row(
        "SELECT id, agent_id, status, summary, created_at FROM approvals WHERE id = ?1",
        params![id],
        |row| {
            Ok(Approval {
                id: row.get(0)?,
                agent_id: row.get(1)?,
                status: row.get(2)?,
                summary: row.get(3)?,
                created_at: row.get(4)?,
            })
        },
    )
    .ok()
}

// --- Activity log ---

/// Audit writes never take down the flow that produced them: a storage
/// failure is logged and swallowed.
pub fn record_activity(
    conn: &Connection,
    event_type: &str,
    message: &str,
    agent_id: Option<&str>,
    board_id: Option<&str>,
) {
    let ts = now();
    if let Err(err) = conn.execute(
        "INSERT INTO activity_events (event_type, message, agent_id, board_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![event_type, message, agent_id, board_id, ts],
    ) {
        tracing::warn!(event_type, error = %err, "failed to record activity event");
    }
}

pub fn list_activity(
    conn: &Connection,
    since: Option<&str>,
    board_id: Option<&str>,
    limit: usize,
) -> Vec<ActivityEvent> {
    let mut sql = String::from("SELECT * FROM activity_events WHERE 1=1");
    let mut binds: Vec<String> = Vec::new();
    if let Some(since) = since {
        binds.push(since.to_string());
        sql.push_str(&format!(" AND created_at > ?{}", binds.len()));
    }
    if let Some(board_id) = board_id {
        binds.push(board_id.to_string());
        sql.push_str(&format!(" AND board_id = ?{}", binds.len()));
    }
    sql.push_str(&format!(" ORDER BY id LIMIT {}", limit));
    let mut stmt = conn.prepare(&sql).unwrap();
    stmt.query_map(rusqlite::params_from_iter(binds.iter()), activity_from_row)
        .unwrap()
        .filter_map(|r| r.ok())
        .collect()
}
