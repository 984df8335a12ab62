//! Shared MCP handshake sequence (component E), composed on top of any
//! `Transporter`: `initialize` -> `notifications/initialized` -> `tools/list`.
//!
//! Grounded in `Spittal-mcp-manager`'s `McpClient::initialize`/`discover_tools`
//! (`mcp/client.rs`), generalized so it drives any transport rather than
//! being specific to stdio/http.

use serde::Deserialize;

use crate::error::GatewayError;
use crate::protocol::{ServerCapabilities, ServerInfo, Tool, PROTOCOL_VERSION, SERVER_NAME};
use crate::upstream::{Transporter, UpstreamClient};

#[derive(Debug, Deserialize)]
struct InitializeResult {
    #[serde(rename = "serverInfo", default)]
    server_info: Option<ServerInfo>,
    #[serde(default)]
    capabilities: Option<ServerCapabilities>,
}

#[derive(Debug, Deserialize)]
struct ToolsListResult {
    #[serde(default)]
    tools: Vec<Tool>,
}

/// Runs the full MCP handshake against `transporter` and populates `client`
/// with the result. Callers are expected to call this once on connect and
/// again whenever a health check decides to refresh the tool catalog.
/// Returns whether the upstream advertised a `prompts` capability, so the
/// gateway façade can decide whether to register a `PromptProvider` for it.
pub async fn run_handshake(
    client: &UpstreamClient,
    transporter: &dyn Transporter,
) -> Result<bool, GatewayError> {
    let init_params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    });

    let raw = transporter.call("initialize", Some(init_params)).await?;
    let init_result: InitializeResult = serde_json::from_value(raw)
        .map_err(|e| GatewayError::Protocol(format!("malformed initialize result: {e}")))?;

    transporter
        .send("notifications/initialized", None)
        .await?;

    let prompts_capable = init_result
        .capabilities
        .as_ref()
        .is_some_and(|c| c.prompts.is_some());

    let server_info = init_result.server_info.unwrap_or_else(|| ServerInfo {
        name: client.id.clone(),
        version: "unknown".to_string(),
    });
    client.set_initialized(server_info, prompts_capable).await;

    refresh_tools(client, transporter).await?;
    Ok(prompts_capable)
}

/// Re-issues `tools/list` and replaces the cached tool set. Used both by the
/// initial handshake and by the health monitor's periodic refresh.
pub async fn refresh_tools(
    client: &UpstreamClient,
    transporter: &dyn Transporter,
) -> Result<(), GatewayError> {
    let raw = transporter.call("tools/list", None).await?;
    let result: ToolsListResult = serde_json::from_value(raw)
        .map_err(|e| GatewayError::Protocol(format!("malformed tools/list result: {e}")))?;
    client.set_tools(result.tools).await;
    Ok(())
}
