//! Derived agent status and heartbeat bookkeeping.
//!
//! The stored status column only carries explicit transitions (updating,
//! deleting, operator-set values). What clients see is computed on every
//! read from the heartbeat trail, so a crashed agent shows offline without
//! any sweeper touching its row.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;

use crate::activity;
use crate::db_ops;
use missionctl_models::{Agent, AgentStatus};

/// How long after the last heartbeat an agent still counts as online.
pub const OFFLINE_AFTER_SECONDS: i64 = 900;

fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Overlay the derived status on a stored agent row.
///
/// Transitional statuses pass through untouched; otherwise no heartbeat
/// means provisioning and a stale heartbeat means offline.
pub fn with_computed_status(agent: Agent) -> Agent {
    with_computed_status_at(agent, Utc::now())
}

pub fn with_computed_status_at(mut agent: Agent, now: DateTime<Utc>) -> Agent {
    if let Some(status) = AgentStatus::from_str(&agent.status) {
        if status.is_transitional() {
            return agent;
        }
    }
    match agent.last_seen_at.as_deref().and_then(parse_ts) {
        None => agent.status = AgentStatus::Provisioning.as_str().to_string(),
        Some(seen) => {
            if now - seen > Duration::seconds(OFFLINE_AFTER_SECONDS) {
                agent.status = AgentStatus::Offline.as_str().to_string();
            }
        }
    }
    agent
}

/// Record a heartbeat: bump `last_seen_at`, optionally take the reported
/// status, and flip provisioning agents online on their first beat.
pub fn commit_heartbeat(
    conn: &Connection,
    agent_id: &str,
    status_value: Option<&str>,
) -> Option<Agent> {
    let mut agent = db_ops::get_agent(conn, agent_id)?;
    match status_value.and_then(AgentStatus::from_str) {
        Some(status) => agent.status = status.as_str().to_string(),
        None => {
            if agent.status == AgentStatus::Provisioning.as_str() {
                agent.status = AgentStatus::Online.as_str().to_string();
            }
        }
    }
    agent.last_seen_at = Some(db_ops::now());
    db_ops::update_agent_row(conn, &agent);
    db_ops::record_activity(
        conn,
        activity::AGENT_HEARTBEAT,
        &format!("Heartbeat received from {}.", agent.name),
        Some(&agent.id),
        agent.board_id.as_deref(),
    );
    db_ops::get_agent(conn, agent_id).map(with_computed_status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_with(status: &str, last_seen_at: Option<String>) -> Agent {
        Agent {
            id: "a1".into(),
            name: "Scout".into(),
            status: status.into(),
            board_id: Some("b1".into()),
            gateway_id: "g1".into(),
            is_board_lead: false,
            session_key: Some("agent:scout:main".into()),
            token_hash: None,
            heartbeat_config: None,
            identity_profile: None,
            soul_template: None,
            provision_requested_at: None,
            provision_action: None,
            last_seen_at,
            created_at: "2026-01-01T00:00:00Z".into(),
            updated_at: "2026-01-01T00:00:00Z".into(),
            is_gateway_main: false,
        }
    }

    #[test]
    fn no_heartbeat_means_provisioning() {
        let agent = with_computed_status(agent_with("online", None));
        assert_eq!(agent.status, "provisioning");
    }

    #[test]
    fn stale_heartbeat_means_offline() {
        let now = Utc::now();
        let stale = (now - Duration::seconds(OFFLINE_AFTER_SECONDS + 60)).to_rfc3339();
        let agent = with_computed_status_at(agent_with("online", Some(stale)), now);
        assert_eq!(agent.status, "offline");
    }

    #[test]
    fn recent_heartbeat_keeps_stored_status() {
        let now = Utc::now();
        let fresh = (now - Duration::seconds(30)).to_rfc3339();
        let agent = with_computed_status_at(agent_with("online", Some(fresh)), now);
        assert_eq!(agent.status, "online");
    }

    #[test]
    fn transitional_statuses_pass_through() {
        let now = Utc::now();
        for status in ["updating", "deleting"] {
            let agent = with_computed_status_at(agent_with(status, None), now);
            assert_eq!(agent.status, status);
            let stale = (now - Duration::seconds(OFFLINE_AFTER_SECONDS * 4)).to_rfc3339();
            let agent = with_computed_status_at(agent_with(status, Some(stale)), now);
            assert_eq!(agent.status, status);
        }
    }
}
