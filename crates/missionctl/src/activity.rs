//! Audit log event types. Every lifecycle transition and coordination
//! side-effect lands here so operators can reconstruct what happened.

pub const AGENT_HEARTBEAT: &str = "agent.heartbeat";
pub const AGENT_SESSION_CREATED: &str = "agent.session.created";
pub const AGENT_SESSION_FAILED: &str = "agent.session.failed";
pub const AGENT_WAKEUP_SENT: &str = "agent.wakeup.sent";
pub const AGENT_NUDGE_SENT: &str = "agent.nudge.sent";
pub const AGENT_NUDGE_FAILED: &str = "agent.nudge.failed";
pub const AGENT_SOUL_UPDATED: &str = "agent.soul.updated";
pub const LEAD_ASK_USER_SENT: &str = "gateway.lead.ask_user.sent";
pub const LEAD_ASK_USER_FAILED: &str = "gateway.lead.ask_user.failed";
pub const MAIN_LEAD_MESSAGE_SENT: &str = "gateway.main.lead_message.sent";
pub const MAIN_LEAD_MESSAGE_FAILED: &str = "gateway.main.lead_message.failed";
pub const MAIN_LEAD_BROADCAST_SENT: &str = "gateway.main.lead_broadcast.sent";
pub const TEMPLATES_SYNCED: &str = "gateway.templates.synced";

/// Completion event for a named instruction, e.g. `agent.provision.direct`.
pub fn instruction_completed(action: &str) -> String {
    format!("agent.{}.direct", action)
}

/// Failure event for a named instruction, e.g. `agent.provision.failed`.
pub fn instruction_failed(action: &str) -> String {
    format!("agent.{}.failed", action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_events_are_namespaced_by_action() {
        assert_eq!(instruction_completed("provision"), "agent.provision.direct");
        assert_eq!(instruction_failed("provision"), "agent.provision.failed");
        assert_eq!(instruction_failed("delete"), "agent.delete.failed");
    }
}
