//! OpenAPI-to-MCP-tool transport (component I).
//!
//! Turns a REST API described by an OpenAPI document into a set of MCP
//! tools, one per operation, without a persistent connection: every `call`
//! is a one-shot HTTP request built from the operation's schema. Grounded in
//! the OpenAPI-driven tool generation pattern surveyed across the
//! "agentgateway"-named reference repos, using the `openapiv3` crate they
//! settled on for parsing.

use std::collections::HashMap;
use std::time::Duration;

use openapiv3::{OpenAPI, Operation, Parameter, ParameterData, PathItem, ReferenceOr};
use reqwest::Client;
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::protocol::Tool;
use crate::upstream::Transporter;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub enum Auth {
    None,
    Bearer(String),
    Header { name: String, value: String },
}

struct ToolOperation {
    method: reqwest::Method,
    path_template: String,
    operation: Operation,
    query_params: Vec<String>,
    header_params: Vec<String>,
}

/// Stateless HTTP transport backed by a parsed OpenAPI document. `call`
/// dispatches by sanitized operationId; there is no handshake to run, so
/// `Transporter::connect`'s no-op default is used as-is.
pub struct OpenApiTransport {
    client: Client,
    base_url: String,
    auth: Auth,
    operations: HashMap<String, ToolOperation>,
}

impl OpenApiTransport {
    pub fn from_document(document: &str, base_url: impl Into<String>, auth: Auth) -> Result<Self, GatewayError> {
        let spec: OpenAPI = serde_yaml::from_str(document)
            .or_else(|_| serde_json::from_str(document).map_err(|e| GatewayError::Parse(e.to_string())))
            .map_err(|e| GatewayError::Parse(format!("failed to parse OpenAPI document: {e}")))?;

        let mut operations = HashMap::new();
        for (path, item) in spec.paths.iter() {
            let ReferenceOr::Item(item) = item else {
                continue;
            };
            collect_path_operations(path, item, &mut operations);
        }

        Ok(Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .map_err(|e| GatewayError::Transport(format!("failed to build http client: {e}")))?,
            base_url: base_url.into(),
            auth,
            operations,
        })
    }

    /// Synthesizes the MCP tool catalog from the parsed document's operations.
    pub fn tools(&self) -> Vec<Tool> {
        self.operations
            .iter()
            .map(|(name, op)| Tool {
                name: name.clone(),
                title: op.operation.summary.clone(),
                description: op.operation.description.clone(),
                input_schema: synthesize_input_schema(&op.operation),
            })
            .collect()
    }

    fn apply_auth(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Auth::None => req,
            Auth::Bearer(token) => req.bearer_auth(token),
            Auth::Header { name, value } => {
                req = req.header(name.as_str(), value.as_str());
                req
            }
        }
    }
}

fn collect_path_operations(
    path: &str,
    item: &PathItem,
    out: &mut HashMap<String, ToolOperation>,
) {
    let candidates: [(reqwest::Method, &Option<Operation>); 5] = [
        (reqwest::Method::GET, &item.get),
        (reqwest::Method::POST, &item.post),
        (reqwest::Method::PUT, &item.put),
        (reqwest::Method::DELETE, &item.delete),
        (reqwest::Method::PATCH, &item.patch),
    ];

    for (method, maybe_op) in candidates {
        let Some(operation) = maybe_op else {
            continue;
        };
        // Only operations with a non-empty operationId become tools; an
        // operation with none is dropped rather than aliased to a
        // synthesized name.
        let Some(raw_id) = operation.operation_id.clone().filter(|s| !s.is_empty()) else {
            continue;
        };
        let Some(name) = sanitize_operation_id(&raw_id) else {
            continue;
        };
        let (query_params, header_params) = param_names_by_location(&operation);
        out.insert(
            name,
            ToolOperation {
                method,
                path_template: path.to_string(),
                operation: operation.clone(),
                query_params,
                header_params,
            },
        );
    }
}

/// Sanitizes an operationId to the `[A-Za-z0-9_-]{1,64}` MCP tool-name
/// alphabet, truncating to 64 characters. Returns `None` when every
/// character had to be replaced — an all-underscore result is discarded
/// rather than aliased.
fn sanitize_operation_id(raw: &str) -> Option<String> {
    let sanitized: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .take(64)
        .collect();
    if sanitized.chars().all(|c| c == '_') {
        None
    } else {
        Some(sanitized)
    }
}

fn synthesize_input_schema(operation: &Operation) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    for param in &operation.parameters {
        let ReferenceOr::Item(param) = param else {
            continue;
        };
        let data = parameter_data(param);
        properties.insert(data.name.clone(), json!({"type": "string"}));
        if data.required {
            required.push(data.name.clone());
        }
    }

    if let Some(ReferenceOr::Item(body)) = &operation.request_body {
        if let Some((_, media)) = body.content.iter().find(|(k, _)| k.contains("json")) {
            if let Some(ReferenceOr::Item(schema)) = &media.schema {
                properties.insert(
                    "body".to_string(),
                    serde_json::to_value(schema).unwrap_or_else(|_| json!({"type": "object"})),
                );
                if body.required {
                    required.push("body".to_string());
                }
            }
        }
    }

    json!({
        "type": "object",
        "properties": Value::Object(properties),
        "required": required,
    })
}

fn parameter_data(param: &Parameter) -> &ParameterData {
    match param {
        Parameter::Query { parameter_data, .. } => parameter_data,
        Parameter::Header { parameter_data, .. } => parameter_data,
        Parameter::Path { parameter_data, .. } => parameter_data,
        Parameter::Cookie { parameter_data, .. } => parameter_data,
    }
}

/// Splits an operation's declared parameters into query- and header-location
/// names so `call` can route caller-supplied arguments to the right part of
/// the request instead of only ever querying on GET.
fn param_names_by_location(operation: &Operation) -> (Vec<String>, Vec<String>) {
    let mut query = Vec::new();
    let mut header = Vec::new();
    for param in &operation.parameters {
        let ReferenceOr::Item(param) = param else {
            continue;
        };
        match param {
            Parameter::Query { parameter_data, .. } => query.push(parameter_data.name.clone()),
            Parameter::Header { parameter_data, .. } => header.push(parameter_data.name.clone()),
            _ => {}
        }
    }
    (query, header)
}

fn required_path_param_names(operation: &Operation) -> Vec<String> {
    operation
        .parameters
        .iter()
        .filter_map(|p| match p {
            ReferenceOr::Item(Parameter::Path { parameter_data, .. }) => Some(parameter_data.name.clone()),
            _ => None,
        })
        .collect()
}

fn substitute_path_params(template: &str, args: &Value) -> String {
    let mut path = template.to_string();
    if let Some(obj) = args.as_object() {
        for (key, value) in obj {
            let placeholder = format!("{{{key}}}");
            if path.contains(&placeholder) {
                let encoded = url::form_urlencoded::byte_serialize(
                    value.as_str().unwrap_or_default().as_bytes(),
                )
                .collect::<String>();
                path = path.replace(&placeholder, &encoded);
            }
        }
    }
    path
}

#[async_trait::async_trait]
impl Transporter for OpenApiTransport {
    async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, GatewayError> {
        let op = self
            .operations
            .get(method)
            .ok_or_else(|| GatewayError::UnknownTool(method.to_string()))?;

        let args = params.unwrap_or(json!({}));
        for name in required_path_param_names(&op.operation) {
            let present = args.get(&name).map(|v| !v.is_null()).unwrap_or(false);
            if !present {
                return Err(GatewayError::InvalidParams(format!(
                    "missing required path parameter: {name}"
                )));
            }
        }

        let path = substitute_path_params(&op.path_template, &args);
        if path.contains('{') {
            return Err(GatewayError::InvalidParams(format!(
                "unresolved path parameter remains in '{path}'"
            )));
        }
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);

        let mut req = self.client.request(op.method.clone(), &url);
        req = self.apply_auth(req);

        if !op.query_params.is_empty() {
            let query: serde_json::Map<String, Value> = op
                .query_params
                .iter()
                .filter_map(|name| args.get(name).map(|v| (name.clone(), v.clone())))
                .collect();
            if !query.is_empty() {
                req = req.query(&query);
            }
        }
        for name in &op.header_params {
            if let Some(value) = args.get(name).and_then(|v| v.as_str()) {
                req = req.header(name.as_str(), value);
            }
        }

        if let Some(body) = args.get("body") {
            req = req.json(body);
        }

        let response = req
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("openapi request failed: {e}")))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Transport(format!("failed to read response body: {e}")))?;
        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(GatewayError::Transport(format!(
                "openapi response for {method} exceeded {MAX_RESPONSE_BYTES} bytes"
            )));
        }

        if !status.is_success() {
            // Surfaced as an in-band tool error with the response body, not
            // a transport failure — the gateway wraps any `Err` the same
            // way, so this distinction only matters for the message text.
            return Err(GatewayError::Transport(format!(
                "{status}: {}",
                String::from_utf8_lossy(&bytes)
            )));
        }

        serde_json::from_slice(&bytes).or_else(|_| {
            Ok(json!({ "raw": String::from_utf8_lossy(&bytes).to_string() }))
        })
    }

    async fn send(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), GatewayError> {
        self.call(method, params).await.map(|_| ())
    }
}
