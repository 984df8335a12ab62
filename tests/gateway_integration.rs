//! End-to-end tests against a real bound gateway server: every downstream
//! route is exercised the way an actual MCP client would, over a real TCP
//! socket with `reqwest`.

use std::sync::Arc;

use gridctl_gateway::error::GatewayError;
use gridctl_gateway::frontend;
use gridctl_gateway::gateway::Gateway;
use gridctl_gateway::upstream::{Transporter, ToolWhitelist, UpstreamClient};

struct StubTransporter;

#[async_trait::async_trait]
impl Transporter for StubTransporter {
    async fn call(&self, method: &str, _params: Option<serde_json::Value>) -> Result<serde_json::Value, GatewayError> {
        match method {
            "initialize" => Ok(serde_json::json!({"serverInfo": {"name": "echo", "version": "1.0"}})),
            "tools/list" => Ok(serde_json::json!({
                "tools": [{"name": "shout", "inputSchema": {"type": "object"}}]
            })),
            "tools/call" => Ok(serde_json::json!({
                "content": [{"type": "text", "text": "HELLO"}],
                "isError": false
            })),
            other => Err(GatewayError::MethodNotFound(other.to_string())),
        }
    }

    async fn send(&self, _method: &str, _params: Option<serde_json::Value>) -> Result<(), GatewayError> {
        Ok(())
    }
}

async fn spawn_gateway() -> String {
    let gateway = Arc::new(Gateway::new());
    let client = Arc::new(UpstreamClient::new("echo", ToolWhitelist::all()));
    gateway
        .register_mcp_server("echo", client, Arc::new(StubTransporter))
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = frontend::router(gateway);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn health_and_ready_report_server_status() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let health: serde_json::Value = client.get(format!("{base}/health")).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["status"], "ok");

    let ready: serde_json::Value = client.get(format!("{base}/ready")).send().await.unwrap().json().await.unwrap();
    assert_eq!(ready["status"], "ready");
    assert_eq!(ready["servers"][0]["id"], "echo");
}

#[tokio::test]
async fn tools_list_and_call_round_trip_over_http() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let list: serde_json::Value = client
        .post(format!("{base}/mcp"))
        .json(&serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let tools = list["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "echo__shout");

    let call: serde_json::Value = client
        .post(format!("{base}/mcp"))
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": {"name": "echo__shout", "arguments": {}}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(call["result"]["content"][0]["text"], "HELLO");
}

#[tokio::test]
async fn unknown_tool_call_is_an_in_band_error_not_an_http_failure() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/mcp"))
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {"name": "ghost__tool", "arguments": {}}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["result"]["isError"], true);
}

#[tokio::test]
async fn legacy_sse_session_advertises_an_endpoint_then_accepts_a_message_post() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let mut sse_stream = client
        .get(format!("{base}/sse"))
        .send()
        .await
        .unwrap()
        .bytes_stream();

    use futures::StreamExt;
    let first_chunk = tokio::time::timeout(std::time::Duration::from_secs(2), sse_stream.next())
        .await
        .expect("endpoint event should arrive promptly")
        .expect("stream should yield at least one chunk")
        .unwrap();
    let text = String::from_utf8_lossy(&first_chunk);
    assert!(text.contains("event:endpoint") || text.contains("event: endpoint"));
    let data_line = text.lines().find(|l| l.starts_with("data:")).unwrap();
    let payload: serde_json::Value = serde_json::from_str(data_line.trim_start_matches("data:").trim()).unwrap();
    let endpoint_url = payload["endpoint"].as_str().unwrap().to_string();

    let message_response: serde_json::Value = client
        .post(&endpoint_url)
        .json(&serde_json::json!({"jsonrpc": "2.0", "id": 9, "method": "ping"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(message_response["result"], serde_json::json!({}));
}

#[tokio::test]
async fn message_post_with_unknown_session_id_is_not_found() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/message?sessionId=does-not-exist"))
        .json(&serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
