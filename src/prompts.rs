//! Prompts-as-resources adapter (component 4.O, expansion).
//!
//! If any registered upstream also answers `prompts/list`, the gateway
//! exposes `prompts/list`, `prompts/get` (with `{{argname}}` substitution)
//! and `resources/list`/`resources/read` under the `prompt://<name>` URI
//! scheme, delegating to that upstream. Built from the same tool-routing
//! shape as `router.rs`, substituting "prompt" for "tool" at the dispatch
//! layer.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::upstream::{Transporter, UpstreamClient};

pub const URI_SCHEME: &str = "prompt://";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// Wraps an upstream that has been confirmed to expose prompts, keeping the
/// transport handle needed to delegate `prompts/get`. Cheap to clone: both
/// handles are `Arc`s.
#[derive(Clone)]
pub struct PromptProvider {
    pub server_id: String,
    client: Arc<UpstreamClient>,
    transporter: Arc<dyn Transporter>,
}

impl PromptProvider {
    pub fn new(server_id: impl Into<String>, client: Arc<UpstreamClient>, transporter: Arc<dyn Transporter>) -> Self {
        Self {
            server_id: server_id.into(),
            client,
            transporter,
        }
    }

    pub async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>, GatewayError> {
        let raw = self.transporter.call("prompts/list", None).await?;
        #[derive(Deserialize)]
        struct ListResult {
            #[serde(default)]
            prompts: Vec<PromptDescriptor>,
        }
        let result: ListResult = serde_json::from_value(raw)
            .map_err(|e| GatewayError::Protocol(format!("malformed prompts/list result: {e}")))?;
        Ok(result.prompts)
    }

    /// Fetches a prompt and substitutes `{{argname}}` placeholders in its
    /// returned message text with caller-supplied argument values, honoring
    /// each declared argument's `required` flag.
    pub async fn get_prompt(
        &self,
        name: &str,
        args: &HashMap<String, String>,
    ) -> Result<serde_json::Value, GatewayError> {
        let descriptors = self.list_prompts().await?;
        let descriptor = descriptors
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| GatewayError::UnknownTool(name.to_string()))?;

        for arg in &descriptor.arguments {
            if arg.required && !args.contains_key(&arg.name) {
                return Err(GatewayError::InvalidParams(format!(
                    "missing required prompt argument '{}'",
                    arg.name
                )));
            }
        }

        let params = serde_json::json!({ "name": name, "arguments": args });
        let mut raw = self.transporter.call("prompts/get", Some(params)).await?;
        substitute_placeholders(&mut raw, args);
        Ok(raw)
    }

    pub fn resource_uri(&self, prompt_name: &str) -> String {
        format!("{URI_SCHEME}{prompt_name}")
    }

    pub async fn read_resource(&self, uri: &str) -> Result<serde_json::Value, GatewayError> {
        let name = uri
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| GatewayError::InvalidParams(format!("not a prompt resource uri: {uri}")))?;
        self.get_prompt(name, &HashMap::new()).await
    }

    pub async fn is_initialized(&self) -> bool {
        self.client.is_initialized().await
    }
}

fn substitute_placeholders(value: &mut serde_json::Value, args: &HashMap<String, String>) {
    match value {
        serde_json::Value::String(s) => {
            for (key, replacement) in args {
                let placeholder = format!("{{{{{key}}}}}");
                if s.contains(&placeholder) {
                    *s = s.replace(&placeholder, replacement);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                substitute_placeholders(item, args);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                substitute_placeholders(v, args);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_substitution_walks_nested_values() {
        let mut value = serde_json::json!({
            "messages": [{"role": "user", "content": {"text": "Hello {{name}}, welcome to {{place}}"}}]
        });
        let mut args = HashMap::new();
        args.insert("name".to_string(), "Ada".to_string());
        args.insert("place".to_string(), "gridctl".to_string());

        substitute_placeholders(&mut value, &args);

        assert_eq!(
            value["messages"][0]["content"]["text"],
            "Hello Ada, welcome to gridctl"
        );
    }

    #[test]
    fn resource_uri_uses_the_prompt_scheme() {
        assert_eq!(
            format!("{URI_SCHEME}daily-report"),
            "prompt://daily-report"
        );
    }
}
