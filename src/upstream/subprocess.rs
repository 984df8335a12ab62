//! Subprocess stdio transport (component H).
//!
//! Generalizes `Spittal-mcp-manager`'s `mcp/transport.rs` `StdioTransport`,
//! which spawns through `tauri_plugin_shell`; here the gateway spawns
//! directly with `tokio::process::Command` since there is no desktop shell
//! host. Framing (line-delimited JSON on stdout, stderr logged at warn) is
//! otherwise unchanged; the per-request timeout matches the container-attach
//! transport's 30 seconds, since the two share identical scan/route logic.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::jsonrpc::{Request, Response};
use crate::upstream::Transporter;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

pub struct SubprocessTransport {
    next_id: AtomicU64,
    stdin_tx: mpsc::Sender<String>,
    pending: PendingMap,
    child: Mutex<Option<Child>>,
}

impl SubprocessTransport {
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, GatewayError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| GatewayError::Transport(format!("failed to spawn process: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::Transport("child has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Transport("child has no stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GatewayError::Transport("child has no stderr".to_string()))?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            while let Some(line) = stdin_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let pending_clone = pending.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                debug!("subprocess stdout: {line}");
                match serde_json::from_str::<Response>(line) {
                    Ok(response) => {
                        if let Some(serde_json::Value::Number(n)) = &response.id {
                            if let Some(id) = n.as_u64() {
                                if let Some(tx) = pending_clone.lock().await.remove(&id) {
                                    let _ = tx.send(response);
                                    continue;
                                }
                            }
                        }
                    }
                    Err(e) => warn!("failed to parse JSON-RPC line: {e} — raw: {line}"),
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if !line.is_empty() {
                    warn!("subprocess stderr: {line}");
                }
            }
        });

        Ok(Self {
            next_id: AtomicU64::new(1),
            stdin_tx,
            pending,
            child: Mutex::new(Some(child)),
        })
    }
}

#[async_trait::async_trait]
impl Transporter for SubprocessTransport {
    async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::call(serde_json::json!(id), method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let line = serde_json::to_string(&request)
            .map_err(|e| GatewayError::Transport(format!("failed to serialize request: {e}")))?;
        self.stdin_tx
            .send(format!("{line}\n"))
            .await
            .map_err(|_| GatewayError::Transport("stdin channel closed".to_string()))?;

        let response = tokio::time::timeout(REQUEST_TIMEOUT, rx)
            .await
            .map_err(|_| {
                self.pending.try_lock().ok().map(|mut p| p.remove(&id));
                GatewayError::Transport(format!("timeout waiting for response to {method} (id={id})"))
            })?
            .map_err(|_| GatewayError::Transport("response channel dropped".to_string()))?;

        if let Some(err) = response.error {
            return Err(GatewayError::Protocol(format!("{}: {}", err.code, err.message)));
        }
        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }

    async fn send(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), GatewayError> {
        let request = Request::notification(method, params);
        let line = serde_json::to_string(&request)
            .map_err(|e| GatewayError::Transport(format!("failed to serialize notification: {e}")))?;
        self.stdin_tx
            .send(format!("{line}\n"))
            .await
            .map_err(|_| GatewayError::Transport("stdin channel closed".to_string()))
    }

    async fn shutdown(&self) -> Result<(), GatewayError> {
        if let Some(mut child) = self.child.lock().await.take() {
            drop(child.stdin.take());
            terminate(&child);
            if tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
                .await
                .is_err()
            {
                let _ = child.kill().await;
            }
        }
        Ok(())
    }
}

/// Sends the POSIX terminate signal; on non-unix targets there is no
/// equivalent so the 5-second grace period simply elapses before `kill()` is
/// used instead.
#[cfg(unix)]
fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}

#[async_trait::async_trait]
impl crate::health::Pingable for SubprocessTransport {
    async fn ping(&self) -> Result<(), String> {
        self.call("ping", None).await.map(|_| ()).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Writes a short shell script that reads one line of JSON-RPC off
    /// stdin, echoes a noisy line to stderr, and replies on stdout with a
    /// scripted result carrying the same id — close enough to a real MCP
    /// server's stdio loop to exercise spawn/write/demux/read end to end.
    fn scripted_server() -> tempfile::TempPath {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"#!/bin/sh
read line
id=$(echo "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
echo "boot" >&2
echo "{{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{{\"pong\":true}}}}"
"#
        )
        .unwrap();
        let path = file.into_temp_path();
        std::fs::set_permissions(&path, std::os::unix::fs::PermissionsExt::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn scripted_server_round_trips_a_request() {
        let script = scripted_server();
        let transport = SubprocessTransport::spawn("/bin/sh", &[script.to_str().unwrap().to_string()], &HashMap::new())
            .await
            .unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), transport.call("ping", None))
            .await
            .expect("should not time out")
            .unwrap();
        assert_eq!(result, serde_json::json!({"pong": true}));

        let _ = transport.shutdown().await;
    }

    #[tokio::test]
    async fn call_gets_no_response_while_the_child_stays_silent() {
        // `sleep` never writes to stdout, so nothing will ever resolve the
        // pending request; race it against a short deadline instead of
        // waiting out the real 30s REQUEST_TIMEOUT.
        let transport = SubprocessTransport::spawn("sleep", &["5".to_string()], &HashMap::new())
            .await
            .expect("sleep is available in the sandbox");

        let resolved = tokio::select! {
            _ = transport.call("ping", None) => true,
            _ = tokio::time::sleep(std::time::Duration::from_millis(150)) => false,
        };
        assert!(!resolved, "no response should arrive before the child ever writes to stdout");

        let _ = transport.shutdown().await;
    }
}
