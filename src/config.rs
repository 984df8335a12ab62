//! Minimal bootstrap configuration (component R).
//!
//! Stands in for the out-of-scope stack-config loader: a static list of
//! upstream server declarations read once at startup. Field shape is a
//! trimmed-down descendant of `Spittal-mcp-manager`'s `state::ServerConfig`;
//! the hot-reload/registry/persistence machinery around it is not carried
//! over, see DESIGN.md.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::GatewayError;
use crate::upstream::openapi::Auth as OpenApiAuth;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportConfig {
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Subprocess {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    ContainerStdio {
        container_id: String,
    },
    Openapi {
        document_path: String,
        base_url: String,
        #[serde(default)]
        bearer_token: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub tool_whitelist: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default)]
    pub allowed_servers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

impl BootstrapConfig {
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let text = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&text).map_err(|e| GatewayError::Parse(format!("invalid config at {}: {e}", path.display())))
    }
}

impl TransportConfig {
    pub fn openapi_auth(&self) -> OpenApiAuth {
        match self {
            TransportConfig::Openapi { bearer_token: Some(token), .. } => OpenApiAuth::Bearer(token.clone()),
            _ => OpenApiAuth::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_mixed_transport_config() {
        let yaml = r#"
servers:
  - id: weather
    transport: http
    url: https://weather.example/mcp
  - id: billing
    enabled: false
    transport: subprocess
    command: node
    args: ["billing-server.js"]
agents:
  - name: viewer
    allowed_servers: ["weather"]
"#;
        let config: BootstrapConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert!(!config.servers[1].enabled);
        assert_eq!(config.agents[0].name, "viewer");
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let result = BootstrapConfig::load(Path::new("/nonexistent/gridctl.yaml"));
        assert!(matches!(result, Err(GatewayError::Io(_))));
    }
}
