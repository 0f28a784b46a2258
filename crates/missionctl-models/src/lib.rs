use serde::{Deserialize, Serialize};

// --- Enums ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Provisioning,
    Online,
    Offline,
    Updating,
    Deleting,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Provisioning => "provisioning",
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
            AgentStatus::Updating => "updating",
            AgentStatus::Deleting => "deleting",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "provisioning" => Some(AgentStatus::Provisioning),
            "online" => Some(AgentStatus::Online),
            "offline" => Some(AgentStatus::Offline),
            "updating" => Some(AgentStatus::Updating),
            "deleting" => Some(AgentStatus::Deleting),
            _ => None,
        }
    }

    /// True for statuses that pass through the derived-status read unchanged.
    pub fn is_transitional(&self) -> bool {
        matches!(self, AgentStatus::Updating | AgentStatus::Deleting)
    }
}

// --- Domain models ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub url: Option<String>,
    /// Bearer credential presented to the remote gateway. Never rendered to clients.
    #[serde(skip_serializing, default)]
    pub token: Option<String>,
    pub workspace_root: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Board {
    pub id: String,
    pub organization_id: String,
    pub gateway_id: Option<String>,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    /// Stored status. Reads go through the derived-status computation in the
    /// lifecycle service.
    pub status: String,
    /// None marks the gateway-main agent.
    pub board_id: Option<String>,
    pub gateway_id: String,
    pub is_board_lead: bool,
    /// Deterministic remote session key, assigned on creation.
    pub session_key: Option<String>,
    /// Salted hash of the agent bearer token. The raw token is never stored.
    #[serde(skip_serializing, default)]
    pub token_hash: Option<String>,
    pub heartbeat_config: Option<serde_json::Value>,
    pub identity_profile: Option<serde_json::Value>,
    /// Local copy of the agent's SOUL.md; source of truth when remote writes race.
    pub soul_template: Option<String>,
    pub provision_requested_at: Option<String>,
    pub provision_action: Option<String>,
    pub last_seen_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    /// Derived on read: true when board_id is None.
    #[serde(default)]
    pub is_gateway_main: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub board_id: String,
    pub title: String,
    pub status: String,
    pub assigned_agent_id: Option<String>,
    pub in_progress_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: i64,
    pub event_type: String,
    pub message: String,
    pub agent_id: Option<String>,
    pub board_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub agent_id: Option<String>,
    pub status: String,
    pub summary: Option<String>,
    pub created_at: String,
}

/// Default heartbeat tunables applied to any agent record missing them.
pub fn default_heartbeat_config() -> serde_json::Value {
    serde_json::json!({
        "interval_seconds": 600,
        "expected_actions": ["check_tasks", "post_status"],
    })
}

/// Default descriptive profile for gateway-main agents.
pub fn default_main_identity_profile() -> serde_json::Value {
    serde_json::json!({
        "role": "Gateway Agent",
        "communication_style": "direct, concise, practical",
        "emoji": ":compass:",
    })
}

// --- Agent DTOs ---

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBoard {
    pub name: String,
    /// Defaults to the server's configured gateway when omitted.
    pub gateway_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAgent {
    pub name: String,
    pub board_id: Option<String>,
    pub is_board_lead: Option<bool>,
    pub heartbeat_config: Option<serde_json::Value>,
    pub identity_profile: Option<serde_json::Value>,
    pub soul_template: Option<String>,
}

impl CreateAgent {
    /// Builder for tests — single update point when the payload changes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            board_id: None,
            is_board_lead: None,
            heartbeat_config: None,
            identity_profile: None,
            soul_template: None,
        }
    }

    pub fn with_board(mut self, board_id: impl Into<String>) -> Self {
        self.board_id = Some(board_id.into());
        self
    }

    pub fn as_board_lead(mut self) -> Self {
        self.is_board_lead = Some(true);
        self
    }
}

/// Create response: the raw token is shown exactly once.
#[derive(Debug, Serialize)]
pub struct AgentCreated {
    pub agent: Agent,
    pub token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAgent {
    pub name: Option<String>,
    pub board_id: Option<String>,
    pub is_board_lead: Option<bool>,
    pub heartbeat_config: Option<serde_json::Value>,
    pub identity_profile: Option<serde_json::Value>,
    pub soul_template: Option<String>,
    /// Convert to/from the gateway-main role.
    pub is_gateway_main: Option<bool>,
    /// Always rejected — status is derived from heartbeats, never client-set.
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateAgentQuery {
    /// Reprovision even when the payload carries no material changes.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatOrCreate {
    pub name: String,
    pub board_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AgentQuery {
    pub board_id: Option<String>,
    pub gateway_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AgentEventsQuery {
    /// RFC 3339 watermark; events strictly after this instant are replayed.
    pub since: Option<String>,
    pub board_id: Option<String>,
}

// --- Gateway session DTOs ---

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayResolveQuery {
    pub board_id: Option<String>,
    pub gateway_url: Option<String>,
    pub gateway_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GatewayStatusResponse {
    pub connected: bool,
    pub gateway_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_session: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_session_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GatewaySessionsResponse {
    pub sessions: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_session: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct GatewaySessionResponse {
    pub session: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct GatewaySessionHistoryResponse {
    pub history: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct GatewaySessionMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayVersionCheck {
    pub compatible: bool,
    pub current_version: Option<String>,
    pub minimum_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// --- Coordination DTOs ---

#[derive(Debug, Deserialize)]
pub struct NudgeAgentRequest {
    pub message: String,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AgentSoulResponse {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAgentSoulRequest {
    pub content: String,
    pub reason: Option<String>,
    pub source_url: Option<String>,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AskUserRequest {
    pub content: String,
    pub correlation_id: Option<String>,
    pub preferred_channel: Option<String>,
    pub reply_tags: Option<Vec<String>>,
    pub reply_source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AskUserResponse {
    pub board_id: String,
    pub main_agent_id: Option<String>,
    pub main_agent_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeadMessageRequest {
    /// "question" or "handoff"; controls the message header.
    pub kind: String,
    pub content: String,
    pub correlation_id: Option<String>,
    pub reply_tags: Option<Vec<String>>,
    pub reply_source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LeadMessageResponse {
    pub board_id: String,
    pub lead_agent_id: String,
    pub lead_agent_name: String,
    pub lead_created: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeadBroadcastRequest {
    pub kind: String,
    pub content: String,
    pub correlation_id: Option<String>,
    pub reply_tags: Option<Vec<String>>,
    pub reply_source: Option<String>,
    /// Restrict the broadcast to these boards; all gateway boards when omitted.
    pub board_ids: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct LeadBroadcastBoardResult {
    pub board_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lead_agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lead_agent_name: Option<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LeadBroadcastResponse {
    pub ok: bool,
    pub sent: usize,
    pub failed: usize,
    pub results: Vec<LeadBroadcastBoardResult>,
}

// --- Template sync DTOs ---

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateSyncQuery {
    #[serde(default = "default_true")]
    pub include_main: bool,
    #[serde(default)]
    pub reset_sessions: bool,
    #[serde(default)]
    pub rotate_tokens: bool,
    #[serde(default)]
    pub force_bootstrap: bool,
    pub board_id: Option<String>,
}

impl Default for TemplateSyncQuery {
    fn default() -> Self {
        Self {
            include_main: true,
            reset_sessions: false,
            rotate_tokens: false,
            force_bootstrap: false,
            board_id: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct TemplatesSyncResult {
    pub gateway_id: String,
    pub include_main: bool,
    pub reset_sessions: bool,
    pub agents_updated: usize,
    pub agents_skipped: usize,
    pub main_updated: bool,
    pub errors: Vec<TemplatesSyncError>,
}

#[derive(Debug, Serialize)]
pub struct TemplatesSyncError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub board_id: Option<String>,
    pub message: String,
}

// --- Shared ---

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

impl Default for OkResponse {
    fn default() -> Self {
        Self { ok: true }
    }
}

// --- Identity (from auth) ---

#[derive(Debug, Clone)]
pub enum Identity {
    /// An agent resolved from a presented bearer token.
    AgentIdentity { agent: Agent },
    /// A human operator authenticated against the configured admin token.
    User { id: String, organization_id: String },
    Anonymous,
}

impl Identity {
    pub fn actor_type(&self) -> &'static str {
        match self {
            Identity::AgentIdentity { .. } => "agent",
            Identity::User { .. } => "user",
            Identity::Anonymous => "anonymous",
        }
    }

    pub fn agent(&self) -> Option<&Agent> {
        match self {
            Identity::AgentIdentity { agent } => Some(agent),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_status_round_trips_through_str() {
        for status in [
            AgentStatus::Provisioning,
            AgentStatus::Online,
            AgentStatus::Offline,
            AgentStatus::Updating,
            AgentStatus::Deleting,
        ] {
            assert_eq!(AgentStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(AgentStatus::from_str("retired"), None);
    }

    #[test]
    fn transitional_statuses() {
        assert!(AgentStatus::Updating.is_transitional());
        assert!(AgentStatus::Deleting.is_transitional());
        assert!(!AgentStatus::Online.is_transitional());
        assert!(!AgentStatus::Provisioning.is_transitional());
    }

    #[test]
    fn agent_serialization_omits_token_hash() {
        let agent = Agent {
            id: "a1".into(),
            name: "Scout".into(),
            status: "online".into(),
            board_id: Some("b1".into()),
            gateway_id: "g1".into(),
            is_board_lead: false,
            session_key: Some("agent:scout:main".into()),
            token_hash: Some("deadbeef".into()),
            heartbeat_config: None,
            identity_profile: None,
            soul_template: None,
            provision_requested_at: None,
            provision_action: None,
            last_seen_at: None,
            created_at: "2026-01-01T00:00:00Z".into(),
            updated_at: "2026-01-01T00:00:00Z".into(),
            is_gateway_main: false,
        };
        let json = serde_json::to_value(&agent).unwrap();
        assert!(json.get("token_hash").is_none());
        assert_eq!(json["session_key"], "agent:scout:main");
    }
}
