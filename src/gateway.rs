//! Gateway façade (component K): the single object a front-end talks to.
//! Houses the router, session manager, ACL table, health monitor, server
//! metadata and the prompts-as-resources adapter, and implements every
//! `handle_*`/`register_*` operation the front-ends call into.
//!
//! Generalizes `mcp/proxy.rs`'s per-request dispatch (`handle_mcp_post`,
//! `handle_tools_call`) from a single-server proxy into the full
//! aggregate-router + ACL + health façade.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::warn;

use crate::acl::AclTable;
use crate::error::GatewayError;
use crate::health::HealthMonitor;
use crate::prompts::PromptProvider;
use crate::protocol::{ServerCapabilities, ServerInfo, ToolCallResult, PROTOCOL_VERSION, SERVER_NAME};
use crate::router::{AggregatedTool, Router};
use crate::session::SessionManager;
use crate::upstream::handshake::run_handshake;
use crate::upstream::openapi::OpenApiTransport;
use crate::upstream::{Transporter, UpstreamClient};

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

struct ServerEntry {
    client: Arc<UpstreamClient>,
    transporter: Arc<dyn Transporter>,
}

pub struct Gateway {
    pub router: Router,
    pub sessions: SessionManager,
    pub health: HealthMonitor,
    acl: RwLock<AclTable>,
    known_agents: RwLock<HashSet<String>>,
    /// Servers registered through `register_mcp_server`, distinct from
    /// clients added to the router directly — only these are health-checked
    /// and appear in `status()`.
    servers: RwLock<HashMap<String, ServerEntry>>,
    prompt_providers: RwLock<HashMap<String, PromptProvider>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerStatusEntry {
    pub id: String,
    pub initialized: bool,
    pub healthy: Option<bool>,
}

impl Gateway {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            sessions: SessionManager::new(),
            health: HealthMonitor::new(),
            acl: RwLock::new(AclTable::new()),
            known_agents: RwLock::new(HashSet::new()),
            servers: RwLock::new(HashMap::new()),
            prompt_providers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_agent(&self, name: impl Into<String>) {
        self.known_agents.write().await.insert(name.into());
    }

    pub async fn unregister_agent(&self, name: &str) {
        self.known_agents.write().await.remove(name);
        self.acl.write().await.remove(name);
    }

    pub async fn set_acl(&self, agent_name: impl Into<String>, selectors: Vec<crate::acl::ToolSelector>) {
        let name = agent_name.into();
        self.known_agents.write().await.insert(name.clone());
        self.acl.write().await.insert(name, selectors);
    }

    async fn capabilities(&self) -> ServerCapabilities {
        let has_prompts = !self.prompt_providers.read().await.is_empty();
        ServerCapabilities {
            tools: Some(serde_json::json!({"listChanged": true})),
            prompts: has_prompts.then(|| serde_json::json!({"listChanged": true})),
            resources: has_prompts.then(|| serde_json::json!({"listChanged": true})),
        }
    }

    pub async fn handle_initialize(&self, client_info: Option<serde_json::Value>) -> Result<serde_json::Value, GatewayError> {
        let session_id = self.sessions.create(client_info, None).await;
        Ok(serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": ServerInfo { name: SERVER_NAME.to_string(), version: SERVER_VERSION.to_string() },
            "capabilities": self.capabilities().await,
            "sessionId": session_id,
        }))
    }

    pub async fn handle_tools_list(&self) -> Vec<AggregatedTool> {
        self.router.aggregate_tools().await
    }

    pub async fn handle_tools_list_for_agent(&self, agent_name: &str) -> Result<Vec<AggregatedTool>, GatewayError> {
        if !self.known_agents.read().await.contains(agent_name) {
            return Err(GatewayError::UnknownAgent(agent_name.to_string()));
        }
        let tools = self.router.aggregate_tools().await;
        Ok(self.acl.read().await.filter_tools(agent_name, tools))
    }

    pub async fn handle_tools_call(&self, tool_name: &str, args: Option<serde_json::Value>) -> ToolCallResult {
        match self.dispatch_call(tool_name, args).await {
            Ok(result) => result,
            Err(e) => e.into_tool_result(),
        }
    }

    pub async fn handle_tools_call_for_agent(
        &self,
        agent_name: &str,
        tool_name: &str,
        args: Option<serde_json::Value>,
    ) -> Result<ToolCallResult, GatewayError> {
        if !self.known_agents.read().await.contains(agent_name) {
            return Err(GatewayError::UnknownAgent(agent_name.to_string()));
        }

        let (server_id, local_name) = match tool_name.split_once(crate::router::NAME_SEPARATOR) {
            Some(parts) => parts,
            None => return Ok(GatewayError::UnknownTool(tool_name.to_string()).into_tool_result()),
        };

        if let Err(e) = self.acl.read().await.check_call(agent_name, server_id, local_name) {
            warn!(agent = agent_name, server = server_id, tool = local_name, "ACL denied tool call");
            return Ok(e.into_tool_result());
        }

        Ok(self.handle_tools_call(tool_name, args).await)
    }

    /// Lists every prompt exposed by any registered prompt-provider upstream.
    /// Absent when `capabilities().prompts` is absent too (empty-providers
    /// case is indistinguishable from "not supported" to a caller, which is
    /// fine since the whole feature is optional).
    pub async fn handle_prompts_list(&self) -> Result<Vec<crate::prompts::PromptDescriptor>, GatewayError> {
        let providers = self.prompt_providers.read().await;
        let mut out = Vec::new();
        for provider in providers.values() {
            out.extend(provider.list_prompts().await?);
        }
        Ok(out)
    }

    pub async fn handle_prompts_get(
        &self,
        name: &str,
        args: &std::collections::HashMap<String, String>,
    ) -> Result<serde_json::Value, GatewayError> {
        let provider = self.find_prompt_provider(name).await?;
        provider.get_prompt(name, args).await
    }

    /// `resources/list` under the `prompt://<name>` scheme: one resource
    /// entry per known prompt.
    pub async fn handle_resources_list(&self) -> Result<Vec<serde_json::Value>, GatewayError> {
        let providers = self.prompt_providers.read().await;
        let mut out = Vec::new();
        for provider in providers.values() {
            for descriptor in provider.list_prompts().await? {
                out.push(serde_json::json!({
                    "uri": provider.resource_uri(&descriptor.name),
                    "name": descriptor.name,
                    "description": descriptor.description,
                }));
            }
        }
        Ok(out)
    }

    pub async fn handle_resources_read(&self, uri: &str) -> Result<serde_json::Value, GatewayError> {
        let name = uri
            .strip_prefix(crate::prompts::URI_SCHEME)
            .ok_or_else(|| GatewayError::InvalidParams(format!("not a prompt resource uri: {uri}")))?;
        let provider = self.find_prompt_provider(name).await?;
        provider.read_resource(uri).await
    }

    async fn find_prompt_provider(&self, prompt_name: &str) -> Result<PromptProvider, GatewayError> {
        let providers = self.prompt_providers.read().await;
        for provider in providers.values() {
            if provider.list_prompts().await?.iter().any(|d| d.name == prompt_name) {
                return Ok(provider.clone());
            }
        }
        Err(GatewayError::UnknownTool(prompt_name.to_string()))
    }

    async fn dispatch_call(&self, tool_name: &str, args: Option<serde_json::Value>) -> Result<ToolCallResult, GatewayError> {
        let (client, local_name) = self.router.resolve(tool_name).await?;
        let entry = self.servers.read().await;
        let transporter = entry
            .values()
            .find(|e| Arc::ptr_eq(&e.client, &client))
            .map(|e| e.transporter.clone())
            .ok_or_else(|| GatewayError::ServerNotFound(client.id.clone()))?;
        drop(entry);

        let params = serde_json::json!({ "name": local_name, "arguments": args.unwrap_or(serde_json::json!({})) });
        let raw = transporter.call("tools/call", Some(params)).await?;
        serde_json::from_value(raw).map_err(|e| GatewayError::Protocol(format!("malformed tools/call result: {e}")))
    }

    /// Registers a new upstream MCP server: runs the handshake, records its
    /// transport handle, and adds it to the router. Failures leave state
    /// unchanged.
    pub async fn register_mcp_server(
        &self,
        server_id: impl Into<String>,
        client: Arc<UpstreamClient>,
        transporter: Arc<dyn Transporter>,
    ) -> Result<(), GatewayError> {
        let server_id = server_id.into();
        transporter.connect().await?;
        let prompts_capable = run_handshake(&client, transporter.as_ref()).await?;

        self.router.register(client.clone()).await?;
        if prompts_capable {
            self.prompt_providers.write().await.insert(
                server_id.clone(),
                PromptProvider::new(server_id.clone(), client.clone(), transporter.clone()),
            );
        }
        self.servers.write().await.insert(
            server_id,
            ServerEntry {
                client,
                transporter,
            },
        );
        Ok(())
    }

    /// Registers an OpenAPI-backed upstream. Unlike `register_mcp_server`,
    /// this skips the JSON-RPC handshake entirely — per spec §4.E/§9,
    /// OpenAPI is not on the `Transporter` handshake trait, it has no
    /// `initialize`/`tools/list` to call. Its tool catalog is synthesized
    /// once from the parsed document and pushed straight into the cache.
    pub async fn register_openapi_server(
        &self,
        server_id: impl Into<String>,
        client: Arc<UpstreamClient>,
        transport: Arc<OpenApiTransport>,
    ) -> Result<(), GatewayError> {
        let server_id = server_id.into();
        client.set_tools(transport.tools()).await;
        client
            .set_initialized(
                ServerInfo {
                    name: server_id.clone(),
                    version: "openapi".to_string(),
                },
                false,
            )
            .await;

        self.router.register(client.clone()).await?;
        let transporter: Arc<dyn Transporter> = transport;
        self.servers.write().await.insert(
            server_id,
            ServerEntry {
                client,
                transporter,
            },
        );
        Ok(())
    }

    pub async fn unregister_mcp_server(&self, server_id: &str) -> Result<(), GatewayError> {
        let entry = self
            .servers
            .write()
            .await
            .remove(server_id)
            .ok_or_else(|| GatewayError::ServerNotFound(server_id.to_string()))?;
        self.router.deregister(server_id).await;
        self.health.unregister(server_id).await;
        self.prompt_providers.write().await.remove(server_id);
        let _ = entry.transporter.shutdown().await;
        Ok(())
    }

    pub async fn refresh_all_tools(&self) -> Vec<(String, Result<(), GatewayError>)> {
        let servers: Vec<(String, Arc<UpstreamClient>, Arc<dyn Transporter>)> = {
            let servers = self.servers.read().await;
            servers
                .iter()
                .map(|(id, e)| (id.clone(), e.client.clone(), e.transporter.clone()))
                .collect()
        };

        let mut results = Vec::new();
        for (id, client, transporter) in servers {
            let result = crate::upstream::handshake::refresh_tools(&client, transporter.as_ref()).await;
            results.push((id, result));
        }
        results
    }

    pub async fn status(&self) -> Vec<ServerStatusEntry> {
        let servers = self.servers.read().await;
        let mut out = Vec::new();
        for (id, entry) in servers.iter() {
            let health = self.health.status(id).await;
            out.push(ServerStatusEntry {
                id: id.clone(),
                initialized: entry.client.is_initialized().await,
                healthy: health.and_then(|h| h.healthy),
            });
        }
        out
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::ToolSelector;
    use crate::protocol::Content;
    use crate::upstream::ToolWhitelist;

    struct StubTransporter {
        tools: serde_json::Value,
        call_result: serde_json::Value,
    }

    #[async_trait::async_trait]
    impl Transporter for StubTransporter {
        async fn call(&self, method: &str, _params: Option<serde_json::Value>) -> Result<serde_json::Value, GatewayError> {
            match method {
                "initialize" => Ok(serde_json::json!({"serverInfo": {"name": "weather", "version": "1.0"}})),
                "tools/list" => Ok(self.tools.clone()),
                "tools/call" => Ok(self.call_result.clone()),
                other => Err(GatewayError::MethodNotFound(other.to_string())),
            }
        }

        async fn send(&self, _method: &str, _params: Option<serde_json::Value>) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    async fn gateway_with_weather() -> Gateway {
        let gateway = Gateway::new();
        let client = Arc::new(UpstreamClient::new("weather", ToolWhitelist::all()));
        let transporter: Arc<dyn Transporter> = Arc::new(StubTransporter {
            tools: serde_json::json!({"tools": [{"name": "forecast", "inputSchema": {"type": "object"}}]}),
            call_result: serde_json::json!({"content": [{"type": "text", "text": "sunny"}], "isError": false}),
        });
        gateway.register_mcp_server("weather", client, transporter).await.unwrap();
        gateway
    }

    #[tokio::test]
    async fn initialize_creates_a_session_and_advertises_tools_capability() {
        let gateway = Gateway::new();
        let result = gateway.handle_initialize(None).await.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["capabilities"]["tools"]["listChanged"], true);
        assert_eq!(gateway.sessions.len().await, 1);
    }

    #[tokio::test]
    async fn register_then_list_then_call_round_trip() {
        let gateway = gateway_with_weather().await;

        let tools = gateway.handle_tools_list().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].exposed_name, "weather__forecast");

        let result = gateway.handle_tools_call("weather__forecast", None).await;
        assert!(!result.is_error);
        assert!(matches!(&result.content[0], Content::Text { text, .. } if text == "sunny"));
    }

    #[tokio::test]
    async fn unknown_tool_name_is_an_in_band_error_not_a_panic() {
        let gateway = gateway_with_weather().await;
        let result = gateway.handle_tools_call("ghost__tool", None).await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn unknown_agent_is_rejected_for_list_and_call() {
        let gateway = gateway_with_weather().await;
        assert!(matches!(
            gateway.handle_tools_list_for_agent("ghost").await,
            Err(GatewayError::UnknownAgent(_))
        ));
        assert!(matches!(
            gateway.handle_tools_call_for_agent("ghost", "weather__forecast", None).await,
            Err(GatewayError::UnknownAgent(_))
        ));
    }

    #[tokio::test]
    async fn acl_denial_is_in_band_and_logged() {
        let gateway = gateway_with_weather().await;
        gateway.set_acl("viewer", vec![ToolSelector::whole_server("billing")]).await;

        let result = gateway
            .handle_tools_call_for_agent("viewer", "weather__forecast", None)
            .await
            .unwrap();
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn unregister_removes_tools_from_the_aggregate_catalog() {
        let gateway = gateway_with_weather().await;
        gateway.unregister_mcp_server("weather").await.unwrap();
        assert!(gateway.handle_tools_list().await.is_empty());
    }

    const PETSTORE_DOC: &str = r#"
openapi: 3.0.0
info:
  title: petstore
  version: "1.0"
paths:
  /pets/{petId}:
    get:
      operationId: getPetById
      parameters:
        - name: petId
          in: path
          required: true
          schema:
            type: string
      responses:
        "200":
          description: ok
"#;

    #[tokio::test]
    async fn openapi_registration_skips_the_handshake_and_populates_the_catalog() {
        let gateway = Gateway::new();
        let client = Arc::new(UpstreamClient::new("petstore", ToolWhitelist::all()));
        let transport = Arc::new(
            crate::upstream::openapi::OpenApiTransport::from_document(
                PETSTORE_DOC,
                "https://petstore.example",
                crate::upstream::openapi::Auth::None,
            )
            .unwrap(),
        );

        gateway.register_openapi_server("petstore", client, transport).await.unwrap();

        let tools = gateway.handle_tools_list().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].exposed_name, "petstore__getPetById");
    }

    struct PromptCapableTransporter;

    #[async_trait::async_trait]
    impl Transporter for PromptCapableTransporter {
        async fn call(&self, method: &str, _params: Option<serde_json::Value>) -> Result<serde_json::Value, GatewayError> {
            match method {
                "initialize" => Ok(serde_json::json!({
                    "serverInfo": {"name": "notes", "version": "1.0"},
                    "capabilities": {"prompts": {"listChanged": true}},
                })),
                "tools/list" => Ok(serde_json::json!({"tools": []})),
                "prompts/list" => Ok(serde_json::json!({
                    "prompts": [{"name": "greeting", "arguments": [{"name": "who", "required": false}]}]
                })),
                "prompts/get" => Ok(serde_json::json!({
                    "messages": [{"role": "user", "content": {"text": "Hello {{who}}"}}]
                })),
                other => Err(GatewayError::MethodNotFound(other.to_string())),
            }
        }

        async fn send(&self, _method: &str, _params: Option<serde_json::Value>) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn prompts_capable_upstream_is_served_under_the_resource_scheme() {
        let gateway = Gateway::new();
        let client = Arc::new(UpstreamClient::new("notes", ToolWhitelist::all()));
        gateway
            .register_mcp_server("notes", client, Arc::new(PromptCapableTransporter))
            .await
            .unwrap();

        let init = gateway.handle_initialize(None).await.unwrap();
        assert_eq!(init["capabilities"]["prompts"]["listChanged"], true);

        let prompts = gateway.handle_prompts_list().await.unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].name, "greeting");

        let resources = gateway.handle_resources_list().await.unwrap();
        assert_eq!(resources[0]["uri"], "prompt://greeting");

        let mut args = std::collections::HashMap::new();
        args.insert("who".to_string(), "Ada".to_string());
        let result = gateway.handle_prompts_get("greeting", &args).await.unwrap();
        assert_eq!(result["messages"][0]["content"]["text"], "Hello Ada");

        let read = gateway.handle_resources_read("prompt://greeting").await.unwrap();
        assert_eq!(read["messages"][0]["content"]["text"], "Hello {{who}}");
    }

    #[tokio::test]
    async fn upstream_without_prompts_capability_advertises_no_prompts_capability() {
        let gateway = gateway_with_weather().await;
        let init = gateway.handle_initialize(None).await.unwrap();
        assert!(init["capabilities"]["prompts"].is_null());
    }

    #[tokio::test]
    async fn tools_visible_to_an_agent_are_always_callable_by_that_agent() {
        let gateway = gateway_with_weather().await;
        gateway.set_acl("viewer", vec![ToolSelector::whole_server("weather")]).await;

        let visible = gateway.handle_tools_list_for_agent("viewer").await.unwrap();
        for tool in visible {
            let result = gateway
                .handle_tools_call_for_agent("viewer", &tool.exposed_name, None)
                .await
                .unwrap();
            assert!(!result.is_error);
        }
    }
}
