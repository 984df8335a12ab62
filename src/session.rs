//! Downstream session manager (component C).
//!
//! Sessions are the gateway's own identity for a downstream connection,
//! distinct from the `Mcp-Session-Id` a gateway negotiates with upstreams
//! (see `upstream::http`). Capped at 1000 entries; when full, inserting a
//! new session evicts the least-recently-seen entry in a single pass — no
//! separate LRU structure is needed given the fixed cap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::RngCore;
use tokio::sync::{broadcast, RwLock};

pub const MAX_SESSIONS: usize = 1000;
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(3600);
const BROADCAST_CAPACITY: usize = 64;

/// A single event delivered on a session's SSE stream (`frontend/sse.rs`),
/// carrying the monotonic per-session id required on every event.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub id: u64,
    pub event_type: String,
    pub data: String,
}

#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub client_info: Option<serde_json::Value>,
    pub created_at: Instant,
    pub last_seen: Instant,
    pub agent_name: Option<String>,
    next_event_id: std::sync::Arc<AtomicU64>,
    broadcast: broadcast::Sender<SessionEvent>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("last_seen", &self.last_seen)
            .field("agent_name", &self.agent_name)
            .finish()
    }
}

impl Session {
    /// Broadcasts an event on this session's SSE stream, assigning it the
    /// next monotonic event id. Silently ignored if nobody is subscribed.
    pub fn push_event(&self, event_type: impl Into<String>, data: impl Into<String>) -> u64 {
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let _ = self.broadcast.send(SessionEvent {
            id,
            event_type: event_type.into(),
            data: data.into(),
        });
        id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.broadcast.subscribe()
    }
}

/// Generates a 128-bit random hex session id.
pub fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    max_age: Duration,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_max_age(DEFAULT_MAX_AGE)
    }

    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_age,
        }
    }

    /// Create a session, evicting the stalest entry if the map is at
    /// capacity. Returns the new session's id.
    pub async fn create(
        &self,
        client_info: Option<serde_json::Value>,
        agent_name: Option<String>,
    ) -> String {
        let id = new_session_id();
        let now = Instant::now();
        let session = Session {
            id: id.clone(),
            client_info,
            created_at: now,
            last_seen: now,
            agent_name,
            next_event_id: std::sync::Arc::new(AtomicU64::new(0)),
            broadcast: broadcast::channel(BROADCAST_CAPACITY).0,
        };

        let mut sessions = self.sessions.write().await;
        if sessions.len() >= MAX_SESSIONS {
            if let Some(stale_id) = sessions
                .iter()
                .min_by_key(|(_, s)| s.last_seen)
                .map(|(id, _)| id.clone())
            {
                sessions.remove(&stale_id);
            }
        }
        sessions.insert(id.clone(), session);
        id
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id)?;
        session.last_seen = Instant::now();
        Some(session.clone())
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Delete entries older than `max_age`; intended to run on a periodic
    /// background tick.
    pub async fn cleanup_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.last_seen.elapsed() <= self.max_age);
        before - sessions.len()
    }

    /// Broadcasts `event_type`/`data` to every live session, then clears the
    /// map. A write failure on one session's stream (receiver
    /// already dropped) is silently ignored by `push_event` and never
    /// disturbs the others.
    pub async fn broadcast_and_clear(&self, event_type: impl Into<String>, data: impl Into<String>) {
        let event_type = event_type.into();
        let data = data.into();
        let mut sessions = self.sessions.write().await;
        for session in sessions.values() {
            session.push_event(event_type.clone(), data.clone());
        }
        sessions.clear();
    }

    /// Spawn a background task that periodically removes stale sessions.
    /// Mirrors `lukaj99`'s periodic-tick idiom (`SessionManager::start_cleanup_task`).
    pub fn spawn_cleanup_task(self: std::sync::Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.cleanup_expired().await;
                if removed > 0 {
                    tracing::debug!(removed, "cleaned up expired sessions");
                }
            }
        });
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
