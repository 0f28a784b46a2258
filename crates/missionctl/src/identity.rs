//! Deterministic naming for agents: slugs, session keys, workspace paths.
//!
//! Session keys are the join point between local agent rows and remote
//! gateway sessions, so every derivation here must stay stable across
//! restarts and renames.

/// Session key of the dedicated gateway-main agent.
pub const MAIN_SESSION_KEY: &str = "agent:main";
/// Remote agent id of the gateway-main agent.
pub const MAIN_AGENT_ID: &str = "main";

/// Lowercase a display name into a slug: alphanumerics kept, runs of
/// anything else collapsed to single hyphens.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Deterministic session key for a board agent.
pub fn agent_session_key(name: &str) -> String {
    format!("agent:{}:main", slugify(name))
}

/// Remote gateway agent id derived from a session key of the form
/// `agent:<id>:...`, falling back to the slug of the display name.
pub fn gateway_agent_id(session_key: Option<&str>, name: &str) -> String {
    if let Some(key) = session_key {
        let parts: Vec<&str> = key.split(':').collect();
        if parts.len() >= 2 && parts[0] == "agent" && !parts[1].is_empty() {
            return parts[1].to_string();
        }
    }
    slugify(name)
}

/// Workspace directory for an agent under the gateway's workspace root.
pub fn workspace_path(workspace_root: &str, name: &str) -> String {
    format!(
        "{}/workspace-{}",
        workspace_root.trim_end_matches('/'),
        slugify(name)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_and_lowercases() {
        assert_eq!(slugify("Scout"), "scout");
        assert_eq!(slugify("Data  Cruncher!"), "data-cruncher");
        assert_eq!(slugify("--Edge__Case--"), "edge-case");
        assert_eq!(slugify(""), "");
    }

    #[test]
    fn session_keys_are_deterministic() {
        assert_eq!(agent_session_key("Scout"), "agent:scout:main");
        assert_eq!(agent_session_key("Data Cruncher"), "agent:data-cruncher:main");
    }

    #[test]
    fn gateway_agent_id_prefers_session_key() {
        assert_eq!(
            gateway_agent_id(Some("agent:scout:main"), "Renamed"),
            "scout"
        );
        assert_eq!(gateway_agent_id(Some("agent:main"), "Whatever"), "main");
        assert_eq!(gateway_agent_id(None, "Data Cruncher"), "data-cruncher");
        assert_eq!(gateway_agent_id(Some("weird"), "Fallback Name"), "fallback-name");
    }

    #[test]
    fn workspace_paths_are_rooted() {
        assert_eq!(
            workspace_path("/srv/agents/", "Scout"),
            "/srv/agents/workspace-scout"
        );
    }
}
