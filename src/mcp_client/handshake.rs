//! The `initialize` → `tools/list` exchange.

use std::time::Duration;

use super::errors::McpError;
use super::transport::{extract_result, StdioTransport};
use super::types::{initialize_params, InitializeResult, ToolsListResult};
use crate::servers::validator::check_protocol_compatibility;
use crate::servers::ToolDefinition;

const CLIENT_NAME: &str = env!("CARGO_PKG_NAME");
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Send `initialize` and check the protocol version in the reply.
///
/// Returns the server's protocol version.
pub async fn initialize(transport: &StdioTransport, server: &str) -> Result<String, McpError> {
    tracing::debug!(server, "sending initialize");
    let response = transport
        .request(
            "initialize",
            Some(initialize_params(CLIENT_NAME, CLIENT_VERSION)),
        )
        .await?;
    let result = extract_result(response)?;

    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::HandshakeFailed {
            server: server.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    let version = init.protocol_version.unwrap_or_default();
    if !check_protocol_compatibility(Some(&version)) {
        return Err(McpError::HandshakeFailed {
            server: server.to_string(),
            reason: "initialize response did not include a protocol version".into(),
        });
    }

    // Best-effort; older servers ignore unknown notifications.
    let _ = transport.notify("notifications/initialized", None).await;

    let server_name = init.server_info.and_then(|info| info.name);
    tracing::info!(server, protocol = %version, server_name = ?server_name, "server initialized");
    Ok(version)
}

/// Request `tools/list`.
///
/// A reply that does not arrive within `ceiling`, or an error reply, yields
/// an empty list. Only a broken transport is an error.
pub async fn fetch_tools(
    transport: &StdioTransport,
    server: &str,
    ceiling: Duration,
) -> Result<Vec<ToolDefinition>, McpError> {
    let response = match tokio::time::timeout(ceiling, transport.request("tools/list", None)).await
    {
        Ok(response) => response?,
        Err(_) => {
            tracing::warn!(server, timeout_ms = ceiling.as_millis() as u64, "tools/list timed out, using empty tool list");
            return Ok(Vec::new());
        }
    };

    let result = match extract_result(response) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(server, error = %e, "tools/list failed, using empty tool list");
            return Ok(Vec::new());
        }
    };

    match serde_json::from_value::<ToolsListResult>(result) {
        Ok(list) => {
            tracing::info!(server, count = list.tools.len(), "discovered tools");
            Ok(list.tools)
        }
        Err(e) => {
            tracing::warn!(server, error = %e, "tools/list result had no tools array");
            Ok(Vec::new())
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
