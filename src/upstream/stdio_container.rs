//! Container-attach stdio transport (component G).
//!
//! Attaches to an already-running container's stdio via the Docker Engine
//! API's multiplexed attach stream, which prefixes every frame with an
//! 8-byte header: 1 byte stream id (0=stdin, 1=stdout, 2=stderr), 3 bytes
//! padding, 4-byte big-endian payload length. Framing and pending-request
//! bookkeeping otherwise mirror `subprocess.rs`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::jsonrpc::{Request, Response};
use crate::upstream::Transporter;

const MAX_LINE_BYTES: usize = 1024 * 1024;
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// Transport over a Docker container-attach multiplexed stream. Generic over
/// the underlying duplex stream so tests can substitute an in-memory pipe
/// instead of a real Docker API connection.
pub struct ContainerStdioTransport {
    next_id: AtomicU64,
    write_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    pending: PendingMap,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ContainerStdioTransport {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, mut writer) = tokio::io::split(stream);

        let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(64);
        tokio::spawn(async move {
            while let Some(bytes) = write_rx.recv().await {
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let pending_clone = pending.clone();
        let reader_task = tokio::spawn(async move {
            demux_loop(reader, pending_clone).await;
        });

        Self {
            next_id: AtomicU64::new(1),
            write_tx: Mutex::new(Some(write_tx)),
            pending,
            reader_task: Mutex::new(Some(reader_task)),
        }
    }
}

/// Reads Docker-framed stdout/stderr from `reader`, discarding stderr frames
/// and dispatching line-delimited JSON-RPC responses found on stdout.
async fn demux_loop<R: AsyncRead + Unpin>(mut reader: R, pending: PendingMap) {
    let mut stdout_buf = String::new();
    loop {
        let mut header = [0u8; 8];
        if reader.read_exact(&mut header).await.is_err() {
            break;
        }
        let stream_id = header[0];
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).await.is_err() {
            break;
        }

        if stream_id == 2 {
            // stderr: log and discard — the aggregate catalog has no
            // per-upstream log sink to forward it to.
            let text = String::from_utf8_lossy(&payload);
            let text = text.trim();
            if !text.is_empty() {
                debug!("container stderr: {text}");
            }
            continue;
        }
        if stream_id != 1 {
            continue;
        }

        stdout_buf.push_str(&String::from_utf8_lossy(&payload));
        if stdout_buf.len() > MAX_LINE_BYTES {
            warn!("container stdout line exceeded {MAX_LINE_BYTES} bytes, dropping buffer");
            stdout_buf.clear();
            continue;
        }

        while let Some(newline_pos) = stdout_buf.find('\n') {
            let line = stdout_buf[..newline_pos].trim().to_string();
            stdout_buf = stdout_buf[newline_pos + 1..].to_string();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Response>(&line) {
                Ok(response) => {
                    if let Some(serde_json::Value::Number(n)) = &response.id {
                        if let Some(id) = n.as_u64() {
                            if let Some(tx) = pending.lock().await.remove(&id) {
                                let _ = tx.send(response);
                            }
                        }
                    }
                }
                Err(e) => warn!("failed to parse JSON-RPC line from container: {e}"),
            }
        }
    }
}

#[async_trait::async_trait]
impl Transporter for ContainerStdioTransport {
    async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::call(serde_json::json!(id), method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let mut line = serde_json::to_vec(&request)
            .map_err(|e| GatewayError::Transport(format!("failed to serialize request: {e}")))?;
        line.push(b'\n');
        self.write(line).await?;

        let response = tokio::time::timeout(REQUEST_TIMEOUT, rx)
            .await
            .map_err(|_| {
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
        let mut line = serde_json::to_vec(&request)
            .map_err(|e| GatewayError::Transport(format!("failed to serialize notification: {e}")))?;
        line.push(b'\n');
        self.write(line).await
    }

    /// Cancels the background reader and closes the write side.
    async fn shutdown(&self) -> Result<(), GatewayError> {
        self.write_tx.lock().await.take();
        if let Some(handle) = self.reader_task.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }
}

impl ContainerStdioTransport {
    async fn write(&self, line: Vec<u8>) -> Result<(), GatewayError> {
        let guard = self.write_tx.lock().await;
        let tx = guard
            .as_ref()
            .ok_or_else(|| GatewayError::Transport("container stdio transport is closed".to_string()))?;
        tx.send(line)
            .await
            .map_err(|_| GatewayError::Transport("container write channel closed".to_string()))
    }
}

#[async_trait::async_trait]
impl crate::health::Pingable for ContainerStdioTransport {
    async fn ping(&self) -> Result<(), String> {
        self.call("ping", None).await.map(|_| ()).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn docker_frame(stream_id: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![stream_id, 0, 0, 0];
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    fn paired() -> (DuplexStream, DuplexStream) {
        tokio::io::duplex(8192)
    }

    #[tokio::test]
    async fn demuxes_stdout_response_and_ignores_stderr() {
        let (client_side, mut test_side) = paired();
        let transport = ContainerStdioTransport::new(client_side);

        tokio::spawn(async move {
            let _ = test_side
                .write_all(&docker_frame(2, b"noisy startup log\n"))
                .await;
            let response = serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}});
            let mut line = serde_json::to_vec(&response).unwrap();
            line.push(b'\n');
            let _ = test_side.write_all(&docker_frame(1, &line)).await;
        });

        let result = transport.call("ping", None).await.unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn oversized_stdout_line_is_dropped_without_panicking() {
        let (client_side, mut test_side) = paired();
        let _transport = ContainerStdioTransport::new(client_side);

        let huge = vec![b'a'; MAX_LINE_BYTES + 10];
        tokio::spawn(async move {
            let _ = test_side.write_all(&docker_frame(1, &huge)).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
