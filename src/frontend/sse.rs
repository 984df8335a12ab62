//! Downstream SSE front-end (component N): legacy two-endpoint transport.
//!
//! `GET /sse` opens a stream and immediately announces a per-session
//! `/message` URL via an `endpoint` event, mirroring
//! `lukaj99-semantic-scholar-mcp-rs`'s `handle_sse_legacy` /
//! `build_sse_stream_with_endpoint`. `POST /message?sessionId=...` decodes a
//! JSON-RPC request, dispatches it with the session's captured agent name,
//! and both returns the response in the POST body and pushes it onto the
//! session's broadcast stream as a `message` event.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;

use crate::frontend::post::dispatch;
use crate::frontend::FrontendState;
use crate::gateway::Gateway;
use crate::jsonrpc::Request;
use crate::session::SessionEvent;

/// Removes the session when the SSE response body is dropped — i.e. when
/// the downstream client disconnects and axum tears down the request's
/// stream. `Drop` can't run async code directly, so it spawns the actual
/// removal.
struct SessionCleanupGuard {
    gateway: Arc<Gateway>,
    session_id: String,
}

impl Drop for SessionCleanupGuard {
    fn drop(&mut self) {
        let gateway = self.gateway.clone();
        let session_id = std::mem::take(&mut self.session_id);
        tokio::spawn(async move {
            gateway.sessions.remove(&session_id).await;
        });
    }
}

/// Wraps a stream with a value that is dropped (and thus cleaned up)
/// alongside it, without otherwise altering its polling behavior.
struct WithGuard<S> {
    inner: S,
    _guard: SessionCleanupGuard,
}

impl<S: Stream + Unpin> Stream for WithGuard<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[derive(Debug, Deserialize)]
pub struct SseQuery {
    agent: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

fn resolve_agent(query_agent: Option<String>, headers: &HeaderMap) -> Option<String> {
    query_agent.or_else(|| {
        headers
            .get("x-agent-name")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    })
}

fn endpoint_url(headers: &HeaderMap, session_id: &str) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{scheme}://{host}/message?sessionId={session_id}")
}

fn to_sse_event(event: SessionEvent) -> Event {
    Event::default()
        .id(event.id.to_string())
        .event(event.event_type)
        .data(event.data)
}

pub async fn handle_sse(
    State(state): State<FrontendState>,
    Query(query): Query<SseQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let agent = resolve_agent(query.agent, &headers);
    let session_id = state.gateway.sessions.create(None, agent).await;
    let session = state
        .gateway
        .sessions
        .get(&session_id)
        .await
        .expect("session was just created");

    let url = endpoint_url(&headers, &session_id);
    session.push_event("endpoint", serde_json::json!({"endpoint": url}).to_string());

    let receiver = session.subscribe();
    let live_stream = BroadcastStream::new(receiver).filter_map(|result| async move {
        match result {
            Ok(event) => Some(Ok::<_, Infallible>(to_sse_event(event))),
            Err(_lag) => None,
        }
    });
    let boxed: Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> = Box::pin(live_stream);
    let guarded = WithGuard {
        inner: boxed,
        _guard: SessionCleanupGuard {
            gateway: state.gateway.clone(),
            session_id: session_id.clone(),
        },
    };

    let stream: Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> = Box::pin(guarded);

    (
        [
            ("X-Accel-Buffering", "no"),
            ("Cache-Control", "no-cache, no-store, must-revalidate"),
        ],
        Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(30))),
    )
}

pub async fn handle_message(
    State(state): State<FrontendState>,
    Query(query): Query<MessageQuery>,
    body: bytes::Bytes,
) -> Response {
    let Some(session_id) = query.session_id else {
        return (StatusCode::NOT_FOUND, "missing sessionId").into_response();
    };
    let Some(session) = state.gateway.sessions.get(&session_id).await else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };

    let req = match serde_json::from_slice::<Request>(&body) {
        Ok(req) => req,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid JSON-RPC body: {e}")).into_response();
        }
    };

    let response = dispatch(&state, session.agent_name.as_deref(), req).await;

    if let Ok(bytes) = axum::body::to_bytes(response.into_body(), crate::frontend::MAX_BODY_BYTES).await {
        session.push_event("message", String::from_utf8_lossy(&bytes).to_string());
        return (StatusCode::OK, bytes).into_response();
    }

    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_honors_forwarded_proto_and_host() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        headers.insert("host", "gateway.example".parse().unwrap());
        let url = endpoint_url(&headers, "abc123");
        assert_eq!(url, "https://gateway.example/message?sessionId=abc123");
    }

    #[test]
    fn endpoint_url_defaults_to_http_and_localhost() {
        let headers = HeaderMap::new();
        let url = endpoint_url(&headers, "abc123");
        assert_eq!(url, "http://localhost/message?sessionId=abc123");
    }

    #[test]
    fn resolve_agent_prefers_query_over_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-agent-name", "from-header".parse().unwrap());
        let agent = resolve_agent(Some("from-query".to_string()), &headers);
        assert_eq!(agent.as_deref(), Some("from-query"));
    }

    #[tokio::test]
    async fn dropping_the_cleanup_guard_removes_the_session() {
        let gateway = Arc::new(Gateway::new());
        let session_id = gateway.sessions.create(None, None).await;
        assert!(gateway.sessions.get(&session_id).await.is_some());

        let guard = SessionCleanupGuard {
            gateway: gateway.clone(),
            session_id: session_id.clone(),
        };
        drop(guard);

        // Drop only spawns the removal task; give it a chance to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(gateway.sessions.get(&session_id).await.is_none());
    }
}
