//! Health monitor (component L): periodic ping against every upstream that
//! exposes one, with precise first-failure/recovery transition and logging
//! rules.
//!
//! Expands `Spittal-mcp-manager`'s `ToolListHashes`/tools-changed-notification
//! idea (`mcp/proxy.rs`) into a full health state machine; the periodic-tick
//! shape itself is grounded in `lukaj99`'s `SessionManager::start_cleanup_task`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{info, warn};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: Option<bool>,
    pub last_check: Option<Instant>,
    pub last_healthy: Option<Instant>,
    pub error_message: Option<String>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            healthy: None,
            last_check: None,
            last_healthy: None,
            error_message: None,
        }
    }
}

/// Something the health monitor can probe. HTTP and container/subprocess
/// transports implement this via their `ping`/liveness check; the OpenAPI
/// transport has no persistent connection to probe and is simply not
/// registered here.
#[async_trait::async_trait]
pub trait Pingable: Send + Sync {
    async fn ping(&self) -> Result<(), String>;

    /// Whether `reconnect` does anything beyond the default no-op. The
    /// monitor only calls `reconnect` on a fresh unhealthy transition when
    /// this is true.
    fn supports_reconnect(&self) -> bool {
        false
    }

    async fn reconnect(&self) -> Result<(), String> {
        Err("reconnect not supported".to_string())
    }
}

pub struct HealthMonitor {
    targets: RwLock<HashMap<String, Arc<dyn Pingable>>>,
    statuses: RwLock<HashMap<String, HealthStatus>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            targets: RwLock::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, server_id: impl Into<String>, target: Arc<dyn Pingable>) {
        let server_id = server_id.into();
        self.targets.write().await.insert(server_id.clone(), target);
        self.statuses
            .write()
            .await
            .entry(server_id)
            .or_insert_with(HealthStatus::default);
    }

    pub async fn unregister(&self, server_id: &str) {
        self.targets.write().await.remove(server_id);
        self.statuses.write().await.remove(server_id);
    }

    pub async fn status(&self, server_id: &str) -> Option<HealthStatus> {
        self.statuses.read().await.get(server_id).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, HealthStatus> {
        self.statuses.read().await.clone()
    }

    /// Runs one probe pass over every registered target, applying the
    /// first-failure/recovery transition and logging rules.
    pub async fn tick(&self) {
        let targets: Vec<(String, Arc<dyn Pingable>)> = {
            let targets = self.targets.read().await;
            targets.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        for (server_id, target) in targets {
            let result = tokio::time::timeout(PING_TIMEOUT, target.ping())
                .await
                .unwrap_or_else(|_| Err("ping timed out".to_string()));

            self.apply_transition(&server_id, target, result).await;
        }
    }

    async fn apply_transition(
        &self,
        server_id: &str,
        target: Arc<dyn Pingable>,
        result: Result<(), String>,
    ) {
        let now = Instant::now();
        let previously_healthy = {
            let statuses = self.statuses.read().await;
            statuses.get(server_id).and_then(|s| s.healthy)
        };

        match result {
            Ok(()) => {
                if previously_healthy == Some(false) {
                    info!(server = server_id, "upstream recovered");
                }
                let mut statuses = self.statuses.write().await;
                let entry = statuses.entry(server_id.to_string()).or_default();
                entry.healthy = Some(true);
                entry.last_check = Some(now);
                entry.last_healthy = Some(now);
                entry.error_message = None;
            }
            Err(error) => {
                let newly_unhealthy = previously_healthy != Some(false);
                if newly_unhealthy {
                    warn!(server = server_id, %error, "upstream unhealthy");
                }
                {
                    let mut statuses = self.statuses.write().await;
                    let entry = statuses.entry(server_id.to_string()).or_default();
                    entry.healthy = Some(false);
                    entry.last_check = Some(now);
                    entry.error_message = Some(error);
                }

                if newly_unhealthy && target.supports_reconnect() {
                    match target.reconnect().await {
                        Ok(()) => {
                            info!(server = server_id, "reconnected");
                            let mut statuses = self.statuses.write().await;
                            let entry = statuses.entry(server_id.to_string()).or_default();
                            entry.healthy = Some(true);
                            entry.last_healthy = Some(now);
                            entry.error_message = None;
                        }
                        Err(error) => {
                            warn!(server = server_id, %error, "reconnection failed");
                        }
                    }
                }
            }
        }
    }

    /// Spawns a background ticker. Returns the `JoinHandle` so the caller
    /// (usually the gateway façade) can abort it on shutdown.
    pub fn spawn_ticker(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedTarget {
        calls: AtomicUsize,
        outcomes: Vec<Result<(), String>>,
        reconnect_outcome: Result<(), String>,
    }

    #[async_trait::async_trait]
    impl Pingable for ScriptedTarget {
        async fn ping(&self) -> Result<(), String> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes.get(i).cloned().unwrap_or_else(|| Err("exhausted".into()))
        }

        fn supports_reconnect(&self) -> bool {
            true
        }

        async fn reconnect(&self) -> Result<(), String> {
            self.reconnect_outcome.clone()
        }
    }

    #[tokio::test]
    async fn first_failure_marks_unhealthy_and_attempts_reconnect() {
        let monitor = HealthMonitor::new();
        let target = Arc::new(ScriptedTarget {
            calls: AtomicUsize::new(0),
            outcomes: vec![Err("refused".into())],
            reconnect_outcome: Ok(()),
        });
        monitor.register("svc", target.clone()).await;
        monitor.tick().await;

        // Reconnect succeeded, so the final recorded status is healthy again.
        let status = monitor.status("svc").await.unwrap();
        assert_eq!(status.healthy, Some(true));
    }

    #[tokio::test]
    async fn failed_reconnect_leaves_status_unhealthy() {
        let monitor = HealthMonitor::new();
        let target = Arc::new(ScriptedTarget {
            calls: AtomicUsize::new(0),
            outcomes: vec![Err("refused".into())],
            reconnect_outcome: Err("still down".into()),
        });
        monitor.register("svc", target).await;
        monitor.tick().await;

        let status = monitor.status("svc").await.unwrap();
        assert_eq!(status.healthy, Some(false));
        assert_eq!(status.error_message.as_deref(), Some("refused"));
    }

    #[tokio::test]
    async fn successful_ping_marks_healthy_with_no_reconnect_attempt() {
        let monitor = HealthMonitor::new();
        let target = Arc::new(ScriptedTarget {
            calls: AtomicUsize::new(0),
            outcomes: vec![Ok(())],
            reconnect_outcome: Err("should not be called".into()),
        });
        monitor.register("svc", target).await;
        monitor.tick().await;

        let status = monitor.status("svc").await.unwrap();
        assert_eq!(status.healthy, Some(true));
    }

    struct NoReconnectTarget {
        calls: AtomicUsize,
        outcomes: Vec<Result<(), String>>,
    }

    #[async_trait::async_trait]
    impl Pingable for NoReconnectTarget {
        async fn ping(&self) -> Result<(), String> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes.get(i).cloned().unwrap_or_else(|| Err("exhausted".into()))
        }
    }

    #[tokio::test]
    async fn stays_unhealthy_across_repeated_failing_ticks_without_reconnect_capability() {
        let monitor = HealthMonitor::new();
        let target = Arc::new(NoReconnectTarget {
            calls: AtomicUsize::new(0),
            outcomes: vec![Err("a".into()), Err("b".into()), Err("c".into())],
        });
        monitor.register("svc", target).await;

        monitor.tick().await;
        monitor.tick().await;
        monitor.tick().await;

        let status = monitor.status("svc").await.unwrap();
        assert_eq!(status.healthy, Some(false));
        assert_eq!(status.error_message.as_deref(), Some("c"));
    }
}
