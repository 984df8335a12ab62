//! HTTP/SSE-hybrid upstream transport (component F).
//!
//! Generalizes `Spittal-mcp-manager`'s `mcp/http_transport.rs`: supports both
//! streamable HTTP (POST, response in the body) and legacy SSE (GET for an
//! `endpoint` event, then POST with the reply delivered over the stream).
//! Adds a `ping` health probe used by the health monitor (`health.rs`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use reqwest::Client;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::jsonrpc::{Request, Response};
use crate::upstream::Transporter;

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Response>>>>;

pub struct HttpTransport {
    next_id: AtomicU64,
    client: Client,
    post_url: String,
    headers: HashMap<String, String>,
    session_id: Arc<Mutex<Option<String>>>,
    legacy_sse: bool,
    pending: PendingMap,
    sse_reader: Mutex<Option<JoinHandle<()>>>,
}

impl HttpTransport {
    pub async fn connect(url: &str, headers: HashMap<String, String>) -> Result<Self, GatewayError> {
        let client = Client::new();

        if url.ends_with("/sse") {
            debug!(url, "using legacy SSE transport");
            return Self::connect_legacy_sse(url, headers, client).await;
        }

        debug!(url, "using streamable HTTP transport");
        Ok(Self {
            next_id: AtomicU64::new(1),
            client,
            post_url: url.to_string(),
            headers,
            session_id: Arc::new(Mutex::new(None)),
            legacy_sse: false,
            pending: Arc::new(Mutex::new(HashMap::new())),
            sse_reader: Mutex::new(None),
        })
    }

    async fn connect_legacy_sse(
        url: &str,
        headers: HashMap<String, String>,
        client: Client,
    ) -> Result<Self, GatewayError> {
        let mut req = client.get(url).header("Accept", "text/event-stream");
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let response = req
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("SSE GET request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::Transport(format!(
                "SSE endpoint returned status {}",
                response.status()
            )));
        }

        let session_id = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut post_url: Option<String> = None;

        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(15);
        loop {
            match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(Some(Ok(chunk))) => {
                    buffer.push_str(&String::from_utf8_lossy(&chunk).replace("\r\n", "\n"));
                    if let Ok(found) = parse_endpoint_from_sse(&buffer, url) {
                        post_url = Some(found);
                        break;
                    }
                }
                Ok(Some(Err(e))) => {
                    return Err(GatewayError::Transport(format!("SSE stream error: {e}")))
                }
                Ok(None) | Err(_) => break,
            }
        }

        let post_url = post_url.ok_or_else(|| {
            GatewayError::Transport("timed out waiting for 'endpoint' event from SSE stream".to_string())
        })?;

        debug!(post_url, "legacy SSE discovered POST endpoint");
        let remaining = drain_consumed_events(&buffer);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let pending_clone = pending.clone();
        let reader = tokio::spawn(async move {
            let mut buf = remaining;
            loop {
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buf.push_str(&String::from_utf8_lossy(&chunk).replace("\r\n", "\n"));
                        dispatch_sse_responses(&mut buf, &pending_clone).await;
                    }
                    Some(Err(e)) => {
                        warn!("legacy SSE stream error: {e}");
                        break;
                    }
                    None => break,
                }
            }
            let mut map = pending_clone.lock().await;
            for (id, tx) in map.drain() {
                let _ = tx.send(Response::failure(
                    Some(serde_json::Value::String(id)),
                    -1,
                    "SSE stream closed",
                ));
            }
        });

        Ok(Self {
            next_id: AtomicU64::new(1),
            client,
            post_url,
            headers,
            session_id: Arc::new(Mutex::new(session_id)),
            legacy_sse: true,
            pending,
            sse_reader: Mutex::new(Some(reader)),
        })
    }

    async fn apply_common_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let sid = self.session_id.lock().await;
        if let Some(ref s) = *sid {
            req = req.header("Mcp-Session-Id", s.as_str());
        }
        req
    }

    async fn remember_session_id(&self, response: &reqwest::Response) {
        if let Some(new_sid) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().await = Some(new_sid.to_string());
        }
    }

    async fn send_streamable(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<Response, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::call(serde_json::json!(id), method, params);

        let req = self
            .client
            .post(&self.post_url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");
        let req = self.apply_common_headers(req).await;

        let response = req
            .json(&request)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("HTTP request failed: {e}")))?;

        self.remember_session_id(&response).await;

        if !response.status().is_success() {
            return Err(GatewayError::Transport(format!(
                "HTTP request for {method} returned status {}",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Transport(format!("failed to read HTTP response: {e}")))?;

        let json_text = if content_type.contains("text/event-stream") {
            extract_json_from_sse(&body)?
        } else {
            body
        };

        serde_json::from_str(&json_text)
            .map_err(|e| GatewayError::Protocol(format!("malformed JSON-RPC response: {e}")))
    }

    async fn send_legacy_sse(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<Response, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id_str = id.to_string();
        let request = Request::call(serde_json::json!(id), method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id_str.clone(), tx);

        let req = self
            .client
            .post(&self.post_url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");
        let req = self.apply_common_headers(req).await;

        let response = req.json(&request).send().await.map_err(|e| {
            GatewayError::Transport(format!("HTTP request failed: {e}"))
        })?;

        if !response.status().is_success() {
            self.pending.lock().await.remove(&id_str);
            return Err(GatewayError::Transport(format!(
                "HTTP request for {method} returned status {}",
                response.status()
            )));
        }

        match tokio::time::timeout(tokio::time::Duration::from_secs(60), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(GatewayError::Transport(
                "SSE stream closed while waiting for response".to_string(),
            )),
            Err(_) => {
                self.pending.lock().await.remove(&id_str);
                Err(GatewayError::Transport(format!(
                    "timeout waiting for SSE response to {method} (id={id})"
                )))
            }
        }
    }
}

#[async_trait::async_trait]
impl Transporter for HttpTransport {
    async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, GatewayError> {
        let response = if self.legacy_sse {
            self.send_legacy_sse(method, params).await?
        } else {
            self.send_streamable(method, params).await?
        };

        if let Some(err) = response.error {
            return Err(GatewayError::Protocol(format!("{}: {}", err.code, err.message)));
        }
        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }

    async fn send(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), GatewayError> {
        let request = Request::notification(method, params);

        let req = self
            .client
            .post(&self.post_url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");
        let req = self.apply_common_headers(req).await;

        let response = req
            .json(&request)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("HTTP notification failed: {e}")))?;

        self.remember_session_id(&response).await;

        if !response.status().is_success() {
            warn!(method, status = %response.status(), "HTTP notification returned non-success");
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), GatewayError> {
        if let Some(handle) = self.sse_reader.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }
}

impl HttpTransport {
    /// Lightweight liveness probe used by the health monitor; any
    /// successfully-parsed JSON-RPC reply (error or not) counts as alive.
    pub async fn ping(&self) -> Result<(), GatewayError> {
        self.call("ping", None).await.map(|_| ())
    }
}

#[async_trait::async_trait]
impl crate::health::Pingable for HttpTransport {
    async fn ping(&self) -> Result<(), String> {
        HttpTransport::ping(self).await.map_err(|e| e.to_string())
    }
}

fn parse_endpoint_from_sse(body: &str, base_url: &str) -> Result<String, GatewayError> {
    let mut current_event = String::new();
    for line in body.lines() {
        if let Some(event_type) = line.strip_prefix("event:") {
            current_event = event_type.trim().to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            if current_event == "endpoint" {
                let endpoint = data.trim();
                if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                    return Ok(endpoint.to_string());
                }
                let origin_end = base_url
                    .find("://")
                    .map(|i| {
                        base_url[i + 3..]
                            .find('/')
                            .map(|j| i + 3 + j)
                            .unwrap_or(base_url.len())
                    })
                    .unwrap_or(base_url.len());
                let origin = &base_url[..origin_end];
                let path = if endpoint.starts_with('/') {
                    endpoint.to_string()
                } else {
                    format!("/{endpoint}")
                };
                return Ok(format!("{origin}{path}"));
            }
        }
    }
    Err(GatewayError::Transport(
        "no 'endpoint' event found in SSE stream".to_string(),
    ))
}

fn drain_consumed_events(buffer: &str) -> String {
    for marker in ["event: endpoint", "event:endpoint"] {
        if let Some(idx) = buffer.find(marker) {
            if let Some(end) = buffer[idx..].find("\n\n") {
                let after = idx + end + 2;
                if after < buffer.len() {
                    return buffer[after..].to_string();
                }
            }
        }
    }
    String::new()
}

async fn dispatch_sse_responses(buffer: &mut String, pending: &PendingMap) {
    loop {
        let Some(event_end) = buffer.find("\n\n") else {
            break;
        };
        let event_block = buffer[..event_end].to_string();
        *buffer = buffer[event_end + 2..].to_string();

        let mut event_type = String::new();
        let mut data_parts = Vec::new();
        for line in event_block.lines() {
            if let Some(et) = line.strip_prefix("event:") {
                event_type = et.trim().to_string();
            } else if let Some(d) = line.strip_prefix("data:") {
                data_parts.push(d.trim().to_string());
            }
        }

        if !event_type.is_empty() && event_type != "message" {
            continue;
        }
        if data_parts.is_empty() {
            continue;
        }

        let json_text = data_parts.join("");
        let response: Response = match serde_json::from_str(&json_text) {
            Ok(r) => r,
            Err(e) => {
                warn!("legacy SSE: failed to parse JSON-RPC data: {e}");
                continue;
            }
        };

        let id_str = match &response.id {
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(serde_json::Value::String(s)) => s.clone(),
            _ => continue,
        };

        if let Some(tx) = pending.lock().await.remove(&id_str) {
            let _ = tx.send(response);
        }
    }
}

/// Scans an SSE response body line by line for `data:` lines, discarding any
/// that parse without an `id` field (those are streamed notifications), and
/// returns only the first one that has one.
fn extract_json_from_sse(body: &str) -> Result<String, GatewayError> {
    let mut current_event = String::new();
    for line in body.lines() {
        if let Some(event_type) = line.strip_prefix("event:") {
            current_event = event_type.trim().to_string();
            continue;
        }
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        if !(current_event.is_empty() || current_event == "message") {
            continue;
        }
        let data = data.trim();
        let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data) else {
            continue;
        };
        if parsed.get("id").is_some() {
            return Ok(data.to_string());
        }
    }
    Err(GatewayError::Transport(
        "no JSON-RPC reply with an id found in SSE response".to_string(),
    ))
}
