use crate::jsonrpc::{self, RpcError};
use crate::protocol::ToolCallResult;

/// Error taxonomy for the gateway core. `to_rpc_error` and `into_tool_result`
/// implement the two ways an error can reach a downstream caller.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("access denied: agent '{agent}' has no access to server '{server}'")]
    AccessDenied { agent: String, server: String },

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("server already registered: {0}")]
    AlreadyRegistered(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("registration failed: {0}")]
    Registration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// Protocol-level failures become JSON-RPC error responses.
    pub fn to_rpc_error(&self) -> RpcError {
        let code = match self {
            GatewayError::Parse(_) => jsonrpc::PARSE_ERROR,
            GatewayError::InvalidRequest(_) | GatewayError::UnknownAgent(_) => {
                jsonrpc::INVALID_REQUEST
            }
            GatewayError::MethodNotFound(_) => jsonrpc::METHOD_NOT_FOUND,
            GatewayError::InvalidParams(_) => jsonrpc::INVALID_PARAMS,
            _ => jsonrpc::INTERNAL_ERROR,
        };
        RpcError {
            code,
            message: self.to_string(),
            data: None,
        }
    }

    /// Per-tool failures (ACL denial, unknown tool, upstream transport
    /// failure) are in-band `is_error: true` results, not transport errors.
    pub fn into_tool_result(self) -> ToolCallResult {
        ToolCallResult::error(self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_not_found_maps_to_correct_code() {
        let e = GatewayError::MethodNotFound("frobnicate".into());
        assert_eq!(e.to_rpc_error().code, jsonrpc::METHOD_NOT_FOUND);
    }

    #[test]
    fn access_denied_is_in_band() {
        let e = GatewayError::AccessDenied {
            agent: "viewer".into(),
            server: "b".into(),
        };
        let result = e.into_tool_result();
        assert!(result.is_error);
    }
}
