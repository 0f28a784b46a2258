//! RPC surface towards the remote gateway runtime.
//!
//! Everything goes through the [`GatewayRpc`] trait so tests can swap in a
//! recording fake; the production implementation lives in [`client`].

use async_trait::async_trait;
use thiserror::Error;

pub mod client;
pub mod compat;
pub mod retry;

pub use client::HttpGatewayClient;

/// Connection coordinates for one gateway, resolved from the gateways table
/// (or from explicit query overrides on admin endpoints).
#[derive(Debug, Clone)]
pub struct GatewayTarget {
    pub url: String,
    pub token: Option<String>,
}

impl GatewayTarget {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token,
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network-level failure: connect refused, DNS, TLS, 5xx.
    #[error("gateway transport error: {0}")]
    Transport(String),
    #[error("gateway request timed out")]
    Timeout,
    /// The gateway answered but the reply was an error or unparseable.
    #[error("gateway protocol error: {0}")]
    Protocol(String),
}

impl GatewayError {
    /// Transport and timeout failures are worth retrying; protocol errors
    /// are deterministic and are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transport(_) | GatewayError::Timeout)
    }
}

#[async_trait]
pub trait GatewayRpc: Send + Sync {
    /// Invoke one RPC method against the target gateway.
    async fn call(
        &self,
        target: &GatewayTarget,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError>;
}

/// Gateways answer list methods either as a bare array or wrapped in an
/// object under a well-known key. Normalize both shapes.
pub fn normalize_list(value: &serde_json::Value, key: &str) -> Vec<serde_json::Value> {
    if let Some(items) = value.as_array() {
        return items.clone();
    }
    if let Some(items) = value.get(key).and_then(|v| v.as_array()) {
        return items.clone();
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_list_accepts_both_shapes() {
        let bare = json!([{"key": "a"}, {"key": "b"}]);
        assert_eq!(normalize_list(&bare, "sessions").len(), 2);

        let wrapped = json!({"sessions": [{"key": "a"}]});
        assert_eq!(normalize_list(&wrapped, "sessions").len(), 1);

        let other = json!({"agents": []});
        assert!(normalize_list(&other, "sessions").is_empty());
        assert!(normalize_list(&json!("nope"), "sessions").is_empty());
    }

    #[test]
    fn retryable_classification() {
        assert!(GatewayError::Timeout.is_retryable());
        assert!(GatewayError::Transport("refused".into()).is_retryable());
        assert!(!GatewayError::Protocol("bad method".into()).is_retryable());
    }
}
