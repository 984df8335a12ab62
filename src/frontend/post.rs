//! Downstream POST front-end (component M).
//!
//! `initialize`, `notifications/initialized`, `tools/list`, `tools/call`,
//! `ping` served over a single POST endpoint, JSON in and JSON out. An
//! optional `X-Agent-Name` header switches to the ACL-gated `tools/list`
//! and `tools/call` variants. GET on the same path is a trivial SSE stub
//! that just stays open — streamable-HTTP clients poll it for
//! server-initiated notifications, which this gateway never emits, so it is
//! kept alive purely to satisfy clients that probe for it.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{self, Stream};

use crate::error::GatewayError;
use crate::frontend::FrontendState;
use crate::jsonrpc::{Request, Response as RpcResponse};

const AGENT_HEADER: &str = "x-agent-name";

fn agent_name(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AGENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn error_response(id: Option<serde_json::Value>, err: GatewayError) -> Response {
    let rpc_err = err.to_rpc_error();
    Json(RpcResponse::failure(id, rpc_err.code, rpc_err.message)).into_response()
}

pub async fn handle(
    State(state): State<FrontendState>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> Response {
    let agent = agent_name(&headers);
    let req = match serde_json::from_slice::<Request>(&body) {
        Ok(req) => req,
        Err(e) => return error_response(None, GatewayError::Parse(e.to_string())),
    };

    dispatch(&state, agent.as_deref(), req).await
}

/// Trivial GET stub: an SSE stream that never emits and stays open until the
/// client disconnects.
pub async fn get_stub() -> impl IntoResponse {
    let stream: std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> =
        Box::pin(stream::pending());
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)))
}

/// Shared JSON-RPC dispatch used by both the POST front-end and the legacy
/// SSE session's `/message` endpoint.
pub async fn dispatch(state: &FrontendState, agent: Option<&str>, req: Request) -> Response {
    let is_notification = req.is_notification();
    let gateway = &state.gateway;

    match req.method.as_str() {
        "initialize" => match gateway.handle_initialize(req.params.clone()).await {
            Ok(result) => Json(RpcResponse::success(req.id, result)).into_response(),
            Err(e) => error_response(req.id, e),
        },
        "notifications/initialized" => {
            if is_notification {
                axum::http::StatusCode::ACCEPTED.into_response()
            } else {
                Json(RpcResponse::success(req.id, serde_json::json!({}))).into_response()
            }
        }
        "ping" => Json(RpcResponse::success(req.id, serde_json::json!({}))).into_response(),
        "tools/list" => match agent {
            Some(agent) => match gateway.handle_tools_list_for_agent(agent).await {
                Ok(tools) => Json(RpcResponse::success(req.id, tools_list_result(&tools))).into_response(),
                Err(e) => error_response(req.id, e),
            },
            None => {
                let tools = gateway.handle_tools_list().await;
                Json(RpcResponse::success(req.id, tools_list_result(&tools))).into_response()
            }
        },
        "tools/call" => {
            let name = req.params.as_ref().and_then(|p| p.get("name")).and_then(|v| v.as_str());
            let Some(name) = name else {
                return error_response(req.id, GatewayError::InvalidParams("missing tool name in params".to_string()));
            };
            let args = req.params.as_ref().and_then(|p| p.get("arguments")).cloned();

            let result = match agent {
                Some(agent) => match gateway.handle_tools_call_for_agent(agent, name, args).await {
                    Ok(result) => result,
                    Err(e) => return error_response(req.id, e),
                },
                None => gateway.handle_tools_call(name, args).await,
            };
            Json(RpcResponse::success(req.id, serde_json::to_value(&result).unwrap_or_default())).into_response()
        }
        "prompts/list" => match gateway.handle_prompts_list().await {
            Ok(prompts) => Json(RpcResponse::success(req.id, serde_json::json!({"prompts": prompts}))).into_response(),
            Err(e) => error_response(req.id, e),
        },
        "prompts/get" => {
            let name = req.params.as_ref().and_then(|p| p.get("name")).and_then(|v| v.as_str());
            let Some(name) = name else {
                return error_response(req.id, GatewayError::InvalidParams("missing prompt name in params".to_string()));
            };
            let args: std::collections::HashMap<String, String> = req
                .params
                .as_ref()
                .and_then(|p| p.get("arguments"))
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();

            match gateway.handle_prompts_get(name, &args).await {
                Ok(result) => Json(RpcResponse::success(req.id, result)).into_response(),
                Err(e) => error_response(req.id, e),
            }
        }
        "resources/list" => match gateway.handle_resources_list().await {
            Ok(resources) => Json(RpcResponse::success(req.id, serde_json::json!({"resources": resources}))).into_response(),
            Err(e) => error_response(req.id, e),
        },
        "resources/read" => {
            let uri = req.params.as_ref().and_then(|p| p.get("uri")).and_then(|v| v.as_str());
            let Some(uri) = uri else {
                return error_response(req.id, GatewayError::InvalidParams("missing uri in params".to_string()));
            };
            match gateway.handle_resources_read(uri).await {
                Ok(result) => Json(RpcResponse::success(req.id, result)).into_response(),
                Err(e) => error_response(req.id, e),
            }
        }
        other => {
            if is_notification {
                axum::http::StatusCode::ACCEPTED.into_response()
            } else {
                error_response(req.id, GatewayError::MethodNotFound(other.to_string()))
            }
        }
    }
}

fn tools_list_result(tools: &[crate::router::AggregatedTool]) -> serde_json::Value {
    serde_json::json!({
        "tools": tools.iter().map(|t| {
            let mut tool = serde_json::to_value(&t.tool).unwrap_or_default();
            tool["name"] = serde_json::Value::String(t.exposed_name.clone());
            tool
        }).collect::<Vec<_>>()
    })
}
