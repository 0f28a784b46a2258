//! Gateway runtime version negotiation.
//!
//! Old runtimes miss methods the coordination layer depends on, so admin
//! mutations refuse to proceed against anything below the floor.

use missionctl_models::GatewayVersionCheck;

use super::{GatewayError, GatewayRpc, GatewayTarget};

/// Oldest gateway runtime the coordination layer supports.
pub const MINIMUM_GATEWAY_VERSION: &str = "2026.1.30";

/// Probe methods, in preference order. Older runtimes only expose `health`.
const VERSION_PROBES: [&str; 3] = ["config.schema", "status", "health"];

/// Parse `YYYY.M.D` style versions, tolerating zero padding and build
/// suffixes like `2026.02.21-2`. Missing components count as zero.
pub fn parse_version_parts(version: &str) -> Option<(u64, u64, u64)> {
    let base = version.split('-').next()?.trim();
    if base.is_empty() {
        return None;
    }
    let mut parts = [0u64; 3];
    for (i, piece) in base.split('.').enumerate() {
        if i >= 3 {
            break;
        }
        parts[i] = piece.trim().parse().ok()?;
    }
    Some((parts[0], parts[1], parts[2]))
}

/// Pull a version string out of a probe reply. Prefers `gateway.version`,
/// then top-level `version`, then `meta.version`.
pub fn extract_gateway_version(payload: &serde_json::Value) -> Option<String> {
    let candidates = [
        payload.pointer("/gateway/version"),
        payload.get("version"),
        payload.pointer("/meta/version"),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn evaluate_gateway_version(
    current_version: Option<&str>,
    minimum_version: &str,
) -> GatewayVersionCheck {
    let Some(current) = current_version else {
        // No probe reported a version. Let the call proceed rather than
        // brick gateways that predate the version endpoints.
        return GatewayVersionCheck {
            compatible: true,
            current_version: None,
            minimum_version: Some(minimum_version.to_string()),
            message: Some("Unable to determine gateway version.".to_string()),
        };
    };

    let parsed_current = parse_version_parts(current);
    let parsed_minimum = parse_version_parts(minimum_version);
    let compatible = match (parsed_current, parsed_minimum) {
        (Some(cur), Some(min)) => cur >= min,
        _ => false,
    };

    GatewayVersionCheck {
        compatible,
        current_version: Some(current.to_string()),
        minimum_version: Some(minimum_version.to_string()),
        message: if compatible {
            None
        } else {
            Some(format!(
                "Gateway version {} is not supported. Minimum supported version is {}.",
                current, minimum_version
            ))
        },
    }
}

/// Probe the gateway for its runtime version and evaluate it against the
/// floor. Probes fall through on errors or version-less replies; a gateway
/// that cannot be reached at all surfaces the last transport error.
pub async fn check_gateway_version(
    rpc: &dyn GatewayRpc,
    target: &GatewayTarget,
    minimum_version: &str,
) -> Result<GatewayVersionCheck, GatewayError> {
    let mut version: Option<String> = None;
    let mut last_err: Option<GatewayError> = None;

    for method in VERSION_PROBES {
        match rpc.call(target, method, serde_json::json!({})).await {
            Ok(payload) => {
                if let Some(found) = extract_gateway_version(&payload) {
                    version = Some(found);
                    break;
                }
            }
            Err(err) => {
                last_err = Some(err);
            }
        }
    }

    if version.is_none() {
        if let Some(err) = last_err {
            if err.is_retryable() {
                return Err(err);
            }
        }
    }

    Ok(evaluate_gateway_version(version.as_deref(), minimum_version))
}
