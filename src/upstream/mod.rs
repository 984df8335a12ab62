//! Upstream client abstraction (component D) and the four transport
//! implementations that back it.
//!
//! Every upstream, regardless of transport, shares the same cached state:
//! its discovered tool list, whether the MCP handshake has completed, and
//! its advertised server info. `UpstreamClient` holds that state; transports
//! are free to mutate it once they finish a handshake or refresh.

pub mod handshake;
pub mod http;
pub mod openapi;
pub mod stdio_container;
pub mod subprocess;

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::GatewayError;
use crate::protocol::{ServerInfo, Tool};

/// Optional allow-list restricting which upstream tools are exposed through
/// aggregation. Changing the whitelist does not retroactively re-filter an
/// already-cached tool list; it only takes effect on the next `set_tools`
/// call (i.e. the next successful `tools/list` refresh).
#[derive(Debug, Clone, Default)]
pub struct ToolWhitelist(Option<Vec<String>>);

impl ToolWhitelist {
    pub fn all() -> Self {
        Self(None)
    }

    pub fn only(names: Vec<String>) -> Self {
        Self(Some(names))
    }

    fn allows(&self, name: &str) -> bool {
        match &self.0 {
            None => true,
            Some(allowed) => allowed.iter().any(|n| n == name),
        }
    }
}

#[derive(Debug, Default)]
struct CachedState {
    tools: Vec<Tool>,
    initialized: bool,
    server_info: Option<ServerInfo>,
    prompts_capable: bool,
}

/// Shared, transport-agnostic cached state for one upstream MCP server.
/// Transports hold an `Arc<UpstreamClient>` alongside whatever
/// connection-specific state they need (pending maps, child processes, etc).
pub struct UpstreamClient {
    pub id: String,
    whitelist: ToolWhitelist,
    state: RwLock<CachedState>,
}

impl UpstreamClient {
    pub fn new(id: impl Into<String>, whitelist: ToolWhitelist) -> Self {
        Self {
            id: id.into(),
            whitelist,
            state: RwLock::new(CachedState::default()),
        }
    }

    pub async fn set_tools(&self, tools: Vec<Tool>) {
        let filtered = tools
            .into_iter()
            .filter(|t| self.whitelist.allows(&t.name))
            .collect();
        self.state.write().await.tools = filtered;
    }

    pub async fn tools(&self) -> Vec<Tool> {
        self.state.read().await.tools.clone()
    }

    pub async fn set_initialized(&self, server_info: ServerInfo, prompts_capable: bool) {
        let mut state = self.state.write().await;
        state.initialized = true;
        state.server_info = Some(server_info);
        state.prompts_capable = prompts_capable;
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.read().await.initialized
    }

    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.state.read().await.server_info.clone()
    }

    /// Whether this upstream's `initialize` response advertised a `prompts`
    /// capability — the gateway uses this to decide whether to register a
    /// `PromptProvider` for it (see `prompts.rs`).
    pub async fn prompts_capable(&self) -> bool {
        self.state.read().await.prompts_capable
    }
}

/// Behavior every upstream transport implements. `connect` performs the
/// initial handshake, `call` issues a request and awaits its reply, and
/// `send` fires a notification with no reply expected. Not every transport
/// needs a persistent connection (the OpenAPI transport is stateless HTTP
/// per-call), so `connect` is a no-op default.
#[async_trait::async_trait]
pub trait Transporter: Send + Sync {
    async fn connect(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, GatewayError>;

    async fn send(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), GatewayError>;

    async fn shutdown(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}

pub type DynTransporter = Arc<dyn Transporter>;

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> Tool {
        Tool {
            name: name.to_string(),
            title: None,
            description: None,
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    #[tokio::test]
    async fn whitelist_filters_on_set_but_not_retroactively() {
        let client = UpstreamClient::new("svc", ToolWhitelist::only(vec!["keep".into()]));
        client.set_tools(vec![tool("keep"), tool("drop")]).await;
        let names: Vec<_> = client.tools().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["keep"]);
    }

    #[tokio::test]
    async fn no_whitelist_allows_everything() {
        let client = UpstreamClient::new("svc", ToolWhitelist::all());
        client.set_tools(vec![tool("a"), tool("b")]).await;
        assert_eq!(client.tools().await.len(), 2);
    }

    #[tokio::test]
    async fn initialized_flips_once_set() {
        let client = UpstreamClient::new("svc", ToolWhitelist::all());
        assert!(!client.is_initialized().await);
        client
            .set_initialized(
                ServerInfo {
                    name: "svc".into(),
                    version: "1.0".into(),
                },
                false,
            )
            .await;
        assert!(client.is_initialized().await);
    }
}
