use async_trait::async_trait;
use std::time::Duration;

use super::{GatewayError, GatewayRpc, GatewayTarget};

const RPC_TIMEOUT: Duration = Duration::from_secs(15);

/// Production gateway client: JSON RPC-style POSTs to `<url>/rpc`.
pub struct HttpGatewayClient {
    http: reqwest::Client,
}

impl HttpGatewayClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http }
    }
}

impl Default for HttpGatewayClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GatewayRpc for HttpGatewayClient {
    async fn call(
        &self,
        target: &GatewayTarget,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let url = format!("{}/rpc", target.url.trim_end_matches('/'));
        let body = serde_json::json!({ "method": method, "params": params });

        let mut request = self.http.post(&url).json(&body);
        if let Some(token) = &target.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout
            } else {
                GatewayError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(GatewayError::Transport(format!(
                "gateway returned {}",
                status
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(format!("invalid gateway reply: {}", e)))?;

        if !status.is_success() {
            let detail = payload
                .get("error")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("gateway returned {}", status));
            return Err(GatewayError::Protocol(detail));
        }

        if let Some(err) = payload.get("error") {
            if !err.is_null() {
                let detail = err
                    .as_str()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| err.to_string());
                return Err(GatewayError::Protocol(detail));
            }
        }

        Ok(payload
            .get("result")
            .cloned()
            .unwrap_or(payload))
    }
}
