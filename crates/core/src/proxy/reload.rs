//! `/sail/api/v1/reload`
//!
//! The socket queues a rebuild job, streams its output as base64 chunks and
//! closes once the job (including the port refresh) has finished.
//! [`request_rebuild`] is the client side used by the CLI.

use super::ProxyState;
use crate::errors::{ProxyError, Result};
use crate::watcher::RebuildJob;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as ClientMessage;
use tracing::{debug, info, warn};

/// Reload endpoint path
pub const RELOAD_PATH: &str = "/sail/api/v1/reload";

/// Upper bound for one `sail edit` run
pub const RELOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Frame sent to the browser
#[derive(Debug, Serialize)]
pub struct ReloadMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub v: String,
}

impl ReloadMessage {
    pub fn data(chunk: &[u8]) -> Self {
        Self {
            kind: "data",
            v: STANDARD.encode(chunk),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: "error",
            v: message.into(),
        }
    }

    fn into_ws(self) -> Message {
        Message::Text(serde_json::to_string(&self).unwrap_or_default())
    }
}

/// Frame as read by a client
#[derive(Debug, Deserialize)]
struct ReceivedMessage {
    #[serde(rename = "type")]
    kind: String,
    v: String,
}

/// `ws://` URL of the reload endpoint behind `proxy_url`
pub fn reload_url(proxy_url: &str) -> Result<url::Url> {
    let invalid = |reason: String| ProxyError::Reload(format!("invalid proxy url {:?}: {}", proxy_url, reason));
    let mut url = url::Url::parse(proxy_url)
        .and_then(|base| base.join(RELOAD_PATH))
        .map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme {}", other)).into()),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot switch to websocket".to_string()))?;
    Ok(url)
}

/// Ask the proxy at `proxy_url` to rebuild its container and wait for the
/// result. Decoded output chunks are passed to `on_output` as they arrive.
pub async fn request_rebuild<F>(proxy_url: &str, mut on_output: F) -> Result<()>
where
    F: FnMut(&[u8]),
{
    let url = reload_url(proxy_url)?;
    let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| ProxyError::Reload(format!("failed to connect to {}: {}", url, e)))?;
    debug!("Connected to {}", url);

    let mut failure = None;
    while let Some(msg) = socket.next().await {
        match msg.map_err(|e| ProxyError::Reload(e.to_string()))? {
            ClientMessage::Text(text) => {
                let frame: ReceivedMessage = serde_json::from_str(&text)
                    .map_err(|e| ProxyError::Reload(format!("bad frame {:?}: {}", text, e)))?;
                match frame.kind.as_str() {
                    "data" => match STANDARD.decode(frame.v.as_bytes()) {
                        Ok(chunk) => on_output(&chunk),
                        Err(e) => warn!("Undecodable reload output: {}", e),
                    },
                    "error" => failure = Some(frame.v),
                    other => debug!("Ignoring reload frame {:?}", other),
                }
            }
            ClientMessage::Close(frame) => {
                let code = frame.map(|f| u16::from(f.code));
                if code == Some(CLOSE_NORMAL) {
                    return Ok(());
                }
                let reason = failure
                    .unwrap_or_else(|| format!("reload socket closed with {:?}", code));
                return Err(ProxyError::Reload(reason).into());
            }
            _ => {}
        }
    }
    let reason = failure.unwrap_or_else(|| "reload socket ended before the rebuild finished".to_string());
    Err(ProxyError::Reload(reason).into())
}

pub async fn handler(ws: WebSocketUpgrade, State(state): State<ProxyState>) -> Response {
    ws.on_upgrade(move |socket| stream_rebuild(socket, state))
}

async fn stream_rebuild(mut socket: WebSocket, state: ProxyState) {
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(64);
    let (job, done) = RebuildJob::reporting(out_tx);

    info!("Reload requested for {}", state.container);
    if state.jobs.send(job).await.is_err() {
        let _ = socket
            .send(ReloadMessage::error("rebuild queue closed").into_ws())
            .await;
        close(&mut socket, CLOSE_INTERNAL_ERROR, "rebuild queue closed").await;
        return;
    }

    while let Some(chunk) = out_rx.recv().await {
        if socket.send(ReloadMessage::data(&chunk).into_ws()).await.is_err() {
            debug!("Reload client went away; rebuild continues");
            break;
        }
    }

    let result = done
        .await
        .unwrap_or_else(|_| Err("rebuild was dropped".to_string()));
    match result {
        Ok(()) => close(&mut socket, CLOSE_NORMAL, "").await,
        Err(e) => {
            let _ = socket.send(ReloadMessage::error(e.clone()).into_ws()).await;
            close(&mut socket, CLOSE_INTERNAL_ERROR, "rebuild failed").await;
        }
    }
}

async fn close(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn pump<R>(mut reader: R, output: Option<mpsc::Sender<Bytes>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if let Some(tx) = &output {
                    let _ = tx.send(Bytes::copy_from_slice(&buf[..n])).await;
                }
            }
        }
    }
}

/// Run `<exe> edit --container <name>` with a no-op editor, forwarding its
/// stdout and stderr to `output`.
pub async fn rebuild_via_cli(
    exe: &Path,
    container: &str,
    output: Option<mpsc::Sender<Bytes>>,
) -> std::result::Result<(), String> {
    let mut child = Command::new(exe)
        .args(["edit", "--container", container])
        .env("EDITOR", "true")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to start {}: {}", exe.display(), e))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let run = async {
        let out = async {
            if let Some(stdout) = stdout {
                pump(stdout, output.clone()).await;
            }
        };
        let err = async {
            if let Some(stderr) = stderr {
                pump(stderr, output.clone()).await;
            }
        };
        tokio::join!(out, err);
        child.wait().await
    };

    let status = tokio::time::timeout(RELOAD_TIMEOUT, run)
        .await
        .map_err(|_| format!("rebuild timed out after {:?}", RELOAD_TIMEOUT))?
        .map_err(|e| format!("failed to wait for rebuild: {}", e))?;

    if status.success() {
        Ok(())
    } else {
        warn!("Rebuild of {} exited with {}", container, status);
        Err(format!("rebuild exited with {}", status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reload_url() {
        assert_eq!(
            reload_url("http://127.0.0.1:9123").unwrap().as_str(),
            "ws://127.0.0.1:9123/sail/api/v1/reload"
        );
        assert_eq!(
            reload_url("https://sail.example/").unwrap().as_str(),
            "wss://sail.example/sail/api/v1/reload"
        );
        assert!(reload_url("ftp://127.0.0.1:9123").is_err());
        assert!(reload_url("").is_err());
    }

    #[test]
    fn test_message_format() {
        let data = serde_json::to_value(ReloadMessage::data(b"hi\n")).unwrap();
        assert_eq!(data, serde_json::json!({"type": "data", "v": "aGkK"}));
        let error = serde_json::to_value(ReloadMessage::error("boom")).unwrap();
        assert_eq!(error, serde_json::json!({"type": "error", "v": "boom"}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rebuild_via_cli_streams_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-sail");
        std::fs::write(&script, "#!/bin/sh\necho \"$1 $2 $3 $EDITOR\"\nexit 3\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let result = rebuild_via_cli(&script, "cdr_sail", Some(tx)).await;
        assert!(result.unwrap_err().contains("exited"));

        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(
            String::from_utf8(collected).unwrap(),
            "edit --container cdr_sail true\n"
        );
    }
}
