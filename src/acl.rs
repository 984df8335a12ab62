//! Per-agent access control. An agent's entry is a list of `ToolSelector`s,
//! one per accessible server, each optionally narrowing down to a subset of
//! that server's tools. An empty selector list means no access at all; an
//! agent absent from the table entirely is unrestricted (the
//! backward-compatibility default) for list/describe purposes, but still
//! must be a *known* agent name to call through `handle_tools_call_for_agent`
//! — callers distinguish the two cases via `has_entry`.

use std::collections::HashMap;

use crate::error::GatewayError;
use crate::router::AggregatedTool;

#[derive(Debug, Clone)]
pub struct ToolSelector {
    pub server: String,
    /// `None` or empty means every tool on this server; an explicitly empty
    /// list is treated the same as `None`.
    pub tools: Option<Vec<String>>,
}

impl ToolSelector {
    pub fn whole_server(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            tools: None,
        }
    }

    pub fn specific_tools(server: impl Into<String>, tools: Vec<String>) -> Self {
        Self {
            server: server.into(),
            tools: Some(tools),
        }
    }

    fn matches(&self, server_id: &str, local_name: &str) -> bool {
        if self.server != server_id {
            return false;
        }
        match &self.tools {
            None => true,
            Some(tools) if tools.is_empty() => true,
            Some(tools) => tools.iter().any(|t| t == local_name),
        }
    }
}

#[derive(Default)]
pub struct AclTable {
    entries: HashMap<String, Vec<ToolSelector>>,
}

impl AclTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, agent_name: impl Into<String>, selectors: Vec<ToolSelector>) {
        self.entries.insert(agent_name.into(), selectors);
    }

    pub fn has_entry(&self, agent_name: &str) -> bool {
        self.entries.contains_key(agent_name)
    }

    pub fn remove(&mut self, agent_name: &str) {
        self.entries.remove(agent_name);
    }

    fn allows(&self, agent_name: &str, server_id: &str, local_name: &str) -> bool {
        match self.entries.get(agent_name) {
            None => true, // absent entry = unrestricted
            Some(selectors) => selectors.iter().any(|s| s.matches(server_id, local_name)),
        }
    }

    /// Filters an aggregated catalog down to what `agent_name` may see.
    /// An unknown agent is a caller-visible error even though an *absent
    /// entry* is treated as unrestricted — the two are
    /// distinguished by whether the agent was ever registered at all via
    /// `register_agent` (tracked by the gateway façade, not here).
    pub fn filter_tools(&self, agent_name: &str, tools: Vec<AggregatedTool>) -> Vec<AggregatedTool> {
        tools
            .into_iter()
            .filter(|t| self.allows(agent_name, &t.server_id, &t.local_name))
            .collect()
    }

    /// Checks whether `agent_name` may call `local_name` on `server_id`.
    pub fn check_call(&self, agent_name: &str, server_id: &str, local_name: &str) -> Result<(), GatewayError> {
        if self.allows(agent_name, server_id, local_name) {
            Ok(())
        } else {
            Err(GatewayError::AccessDenied {
                agent: agent_name.to_string(),
                server: server_id.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Tool;

    fn aggregated(server_id: &str, name: &str) -> AggregatedTool {
        AggregatedTool {
            exposed_name: format!("{server_id}__{name}"),
            server_id: server_id.to_string(),
            local_name: name.to_string(),
            tool: Tool {
                name: name.to_string(),
                title: None,
                description: None,
                input_schema: serde_json::json!({"type": "object"}),
            },
        }
    }

    #[test]
    fn absent_entry_is_unrestricted() {
        let table = AclTable::new();
        assert!(table.check_call("nobody-registered-this", "weather", "forecast").is_ok());
    }

    #[test]
    fn empty_selector_list_denies_everything() {
        let mut table = AclTable::new();
        table.insert("locked-out", vec![]);
        assert!(table.check_call("locked-out", "weather", "forecast").is_err());
    }

    #[test]
    fn selector_restricted_to_specific_tools() {
        let mut table = AclTable::new();
        table.insert(
            "viewer",
            vec![ToolSelector::specific_tools("weather", vec!["forecast".to_string()])],
        );
        assert!(table.check_call("viewer", "weather", "forecast").is_ok());
        assert!(table.check_call("viewer", "weather", "alerts").is_err());
        assert!(table.check_call("viewer", "billing", "charge").is_err());
    }

    #[test]
    fn whole_server_selector_allows_every_tool_on_it() {
        let mut table = AclTable::new();
        table.insert("admin", vec![ToolSelector::whole_server("weather")]);
        let tools = vec![aggregated("weather", "forecast"), aggregated("billing", "charge")];
        let visible = table.filter_tools("admin", tools);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].server_id, "weather");
    }
}
