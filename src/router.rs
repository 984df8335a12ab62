//! Aggregation router (component J): merges every registered upstream's
//! tool catalog into one flat namespace and routes calls back to the owning
//! upstream.
//!
//! Grounded in `MCPToolAggregator`/`MCPAggregateServer` from the
//! `roci-core` aggregate-server reference (`other_examples/...aggregate.rs`)
//! and the `ClientManager`/`find_tool_owner` shape from the `op-mcp`
//! aggregator reference (`other_examples/...client.rs`), adapted to this
//! gateway's `server__tool` naming rule instead of a configurable collision
//! policy.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::GatewayError;
use crate::protocol::Tool;
use crate::upstream::UpstreamClient;

/// The separator used to namespace an upstream's tools in the aggregate
/// catalog: `server__tool`. Two underscores, chosen because upstream tool
/// names may themselves contain a single underscore.
pub const NAME_SEPARATOR: &str = "__";

#[derive(Debug, Clone)]
pub struct AggregatedTool {
    pub exposed_name: String,
    pub server_id: String,
    pub local_name: String,
    pub tool: Tool,
}

/// Insertion-ordered client list plus a name index, held behind one lock so
/// the two never drift apart. Spec §3 requires the aggregated catalog to be
/// a pure, deterministic function of the clients' current tool lists — that
/// only holds if registration order is preserved, which a `HashMap`'s
/// iteration order does not guarantee.
#[derive(Default)]
struct RouterState {
    clients: Vec<Arc<UpstreamClient>>,
    index: HashMap<String, usize>,
}

pub struct Router {
    state: RwLock<RouterState>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RouterState::default()),
        }
    }

    pub async fn register(&self, client: Arc<UpstreamClient>) -> Result<(), GatewayError> {
        let mut state = self.state.write().await;
        if state.index.contains_key(&client.id) {
            return Err(GatewayError::AlreadyRegistered(client.id.clone()));
        }
        state.index.insert(client.id.clone(), state.clients.len());
        state.clients.push(client);
        Ok(())
    }

    pub async fn deregister(&self, server_id: &str) -> Option<Arc<UpstreamClient>> {
        let mut state = self.state.write().await;
        let idx = state.index.remove(server_id)?;
        let client = state.clients.remove(idx);
        for i in state.index.values_mut() {
            if *i > idx {
                *i -= 1;
            }
        }
        Some(client)
    }

    pub async fn server(&self, server_id: &str) -> Option<Arc<UpstreamClient>> {
        let state = self.state.read().await;
        let idx = *state.index.get(server_id)?;
        Some(state.clients[idx].clone())
    }

    pub async fn server_ids(&self) -> Vec<String> {
        self.state.read().await.clients.iter().map(|c| c.id.clone()).collect()
    }

    /// Builds the aggregate catalog: every registered upstream's cached
    /// tools, in registration order, renamed `server__tool` with the
    /// title/description rewritten (`title` defaults to the local name,
    /// `description` is prefixed with `[server]`).
    pub async fn aggregate_tools(&self) -> Vec<AggregatedTool> {
        let clients = self.state.read().await.clients.clone();
        let mut out = Vec::new();
        for client in clients {
            let server_id = &client.id;
            for mut tool in client.tools().await {
                let local_name = tool.name.clone();
                tool.title = Some(tool.title.unwrap_or_else(|| local_name.clone()));
                tool.description = Some(match tool.description {
                    Some(d) => format!("[{server_id}] {d}"),
                    None => format!("[{server_id}]"),
                });
                out.push(AggregatedTool {
                    exposed_name: format!("{server_id}{NAME_SEPARATOR}{local_name}"),
                    server_id: server_id.clone(),
                    local_name,
                    tool,
                });
            }
        }
        out
    }

    /// Resolves an exposed `server__tool` name back to its owning upstream
    /// and the tool's local (un-prefixed) name, splitting on the *first*
    /// occurrence of the separator so a local tool name containing `__`
    /// doesn't get mis-split.
    pub async fn resolve(&self, exposed_name: &str) -> Result<(Arc<UpstreamClient>, String), GatewayError> {
        let (server_id, local_name) = exposed_name
            .split_once(NAME_SEPARATOR)
            .ok_or_else(|| GatewayError::UnknownTool(exposed_name.to_string()))?;

        let client = self
            .server(server_id)
            .await
            .ok_or_else(|| GatewayError::UnknownTool(exposed_name.to_string()))?;

        Ok((client, local_name.to_string()))
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
