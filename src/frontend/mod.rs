//! Downstream HTTP/SSE front-ends (components M and N).
//!
//! Both front-ends share one JSON-RPC dispatch helper (`dispatch`) so that
//! `initialize`/`tools/list`/`tools/call`/`ping` behave identically whether
//! the request arrived on the streamable POST endpoint or on the legacy
//! SSE session's `/message` endpoint. Router shape follows
//! `Spittal-mcp-manager`'s `mcp/proxy.rs` (`Router::new().route(...).with_state(state)`, CORS +
//! trace layers), generalized from a single per-server proxy to the
//! aggregate gateway and enriched with the `lukaj99-semantic-scholar-mcp-rs`
//! dual-transport (`/mcp` + legacy `/sse`+`/message`) shape.

pub mod post;
pub mod sse;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::gateway::Gateway;

/// Max downstream request body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct FrontendState {
    pub gateway: Arc<Gateway>,
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    let state = FrontendState { gateway };

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/mcp", get(post::get_stub).post(post::handle))
        .route("/sse", get(sse::handle_sse))
        .route("/message", axum::routing::post(sse::handle_message))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn ready(axum::extract::State(state): axum::extract::State<FrontendState>) -> Json<serde_json::Value> {
    let statuses = state.gateway.status().await;
    let all_initialized = statuses.iter().all(|s| s.initialized);
    Json(serde_json::json!({
        "status": if all_initialized { "ready" } else { "not-ready" },
        "servers": statuses,
    }))
}
