//! Integration tests for the edge proxy
//!
//! A small axum app stands in for code-server on a loopback port; the proxy
//! is served through the same accept loop the `proxy` subcommand uses.

use axum::extract::ws::{Message as AxumMessage, WebSocketUpgrade};
use axum::http::header;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::{SinkExt, StreamExt};
use sail_core::proxy::reload::request_rebuild;
use sail_core::proxy::state::{PortCache, PortStatus};
use sail_core::proxy::{router, serve_connections, ProxyState};
use sail_core::watcher::{self, RebuildJob};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

const PAGE: &str = "<html><head><title>code-server</title></head><body>hi</body></html>";
const SCRIPT_TAG: &str = r#"<script src="sail.js"></script>"#;

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

async fn echo(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        while let Some(Ok(msg)) = socket.recv().await {
            if let AxumMessage::Text(text) = msg {
                if socket.send(AxumMessage::Text(text)).await.is_err() {
                    return;
                }
            }
        }
    })
}

/// Fake editor; returns its port.
async fn spawn_upstream() -> u16 {
    let app = Router::new()
        .route("/", get(|| async { ([(header::CONTENT_TYPE, "text/html")], PAGE) }))
        .route("/static/page.html", get(|| async { PAGE }))
        .route(
            "/gz",
            get(|| async {
                (
                    [
                        (header::CONTENT_TYPE, "text/html"),
                        (header::CONTENT_ENCODING, "gzip"),
                    ],
                    gzip(PAGE.as_bytes()),
                )
            }),
        )
        .route("/ws", get(echo));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

struct Proxy {
    addr: SocketAddr,
    ports: PortCache,
    jobs: mpsc::Receiver<RebuildJob>,
    _fatal: mpsc::Sender<String>,
}

async fn spawn_proxy(status: PortStatus) -> Proxy {
    let ports = PortCache::new();
    ports.set(status);
    let (jobs_tx, jobs_rx) = watcher::job_queue();
    let (fatal_tx, fatal_rx) = mpsc::channel(1);
    let state = ProxyState::new("cdr_sail", ports.clone(), jobs_tx)
        .with_port_wait(Duration::from_millis(200));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_connections(listener, router(state), fatal_rx));
    Proxy {
        addr,
        ports,
        jobs: jobs_rx,
        _fatal: fatal_tx,
    }
}

#[tokio::test]
async fn test_root_page_gets_script() {
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(PortStatus::Ready(upstream)).await;

    let body = reqwest::get(format!("http://{}/", proxy.addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains(&format!("<head>\n{}\n", SCRIPT_TAG)));
    assert!(body.contains("<body>hi</body>"));
}

#[tokio::test]
async fn test_other_paths_pass_through() {
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(PortStatus::Ready(upstream)).await;

    let body = reqwest::get(format!("http://{}/static/page.html", proxy.addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, PAGE);
}

#[tokio::test]
async fn test_gzipped_body_passes_through_unmodified_off_root() {
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(PortStatus::Ready(upstream)).await;

    let response = reqwest::get(format!("http://{}/gz", proxy.addr)).await.unwrap();
    assert_eq!(
        response.headers().get(header::CONTENT_ENCODING).unwrap(),
        "gzip"
    );
    let raw = response.bytes().await.unwrap();
    let mut decoded = String::new();
    GzDecoder::new(&raw[..]).read_to_string(&mut decoded).unwrap();
    assert_eq!(decoded, PAGE);
}

/// Editor whose root is not a plain HTML page
async fn spawn_json_upstream() -> u16 {
    let app = Router::new().route(
        "/",
        get(|| async { ([(header::CONTENT_TYPE, "application/json")], r#"{"html":"<head>"}"#) }),
    )
    .route(
        "/login",
        get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/")], PAGE) }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

#[tokio::test]
async fn test_non_html_root_is_not_rewritten() {
    let upstream = spawn_json_upstream().await;
    let proxy = spawn_proxy(PortStatus::Ready(upstream)).await;

    let body = reqwest::get(format!("http://{}/", proxy.addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, r#"{"html":"<head>"}"#);
}

#[tokio::test]
async fn test_head_on_root_passes_through() {
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(PortStatus::Ready(upstream)).await;

    let response = reqwest::Client::new()
        .head(format!("http://{}/", proxy.addr))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    assert_eq!(
        response.headers().get(header::CONTENT_LENGTH).unwrap(),
        PAGE.len().to_string().as_str()
    );
}

#[tokio::test]
async fn test_own_routes() {
    let proxy = spawn_proxy(PortStatus::Failed("unused".to_string())).await;

    let health = reqwest::get(format!("http://{}/sail/api/v1/healthz", proxy.addr))
        .await
        .unwrap();
    assert!(health.status().is_success());
    assert_eq!(health.text().await.unwrap(), "ok\n");

    let script = reqwest::get(format!("http://{}/sail.js", proxy.addr))
        .await
        .unwrap();
    assert_eq!(
        script.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/javascript"
    );
    assert!(script.text().await.unwrap().contains("sail/api/v1/reload"));
}

#[tokio::test]
async fn test_failed_port_is_a_500() {
    let proxy = spawn_proxy(PortStatus::Failed("no code-server".to_string())).await;

    let response = reqwest::get(format!("http://{}/", proxy.addr)).await.unwrap();
    assert_eq!(response.status().as_u16(), 500);
    let body = response.text().await.unwrap();
    assert!(body.starts_with("failed to get code server port\n"));
    assert!(body.contains("no code-server"));
    assert!(body.ends_with("please try to reload soon\n"));
}

#[tokio::test]
async fn test_request_waits_for_refresh() {
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(PortStatus::Refreshing).await;

    let ports = proxy.ports.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        ports.set(PortStatus::Ready(upstream));
    });

    let response = reqwest::get(format!("http://{}/static/page.html", proxy.addr))
        .await
        .unwrap();
    assert!(response.status().is_success());
}

#[tokio::test]
async fn test_websocket_is_bridged() {
    let upstream = spawn_upstream().await;
    let proxy = spawn_proxy(PortStatus::Ready(upstream)).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", proxy.addr))
        .await
        .unwrap();
    socket.send(Message::Text("ping".into())).await.unwrap();
    let reply = socket.next().await.unwrap().unwrap();
    assert_eq!(reply, Message::Text("ping".into()));
}

async fn reload_frames(addr: SocketAddr) -> (Vec<serde_json::Value>, Option<u16>) {
    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{}/sail/api/v1/reload", addr))
            .await
            .unwrap();
    let mut frames = Vec::new();
    let mut close_code = None;
    while let Some(msg) = socket.next().await {
        match msg {
            Ok(Message::Text(text)) => frames.push(serde_json::from_str(&text).unwrap()),
            Ok(Message::Close(frame)) => {
                close_code = frame.map(|f| u16::from(f.code));
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    (frames, close_code)
}

#[tokio::test]
async fn test_reload_streams_output_and_closes_normally() {
    let proxy = spawn_proxy(PortStatus::Failed("unused".to_string())).await;
    tokio::spawn(watcher::run_jobs(proxy.jobs, |output| async move {
        if let Some(tx) = output {
            let _ = tx.send(Bytes::from_static(b"Step 1/2\n")).await;
            let _ = tx.send(Bytes::from_static(b"Step 2/2\n")).await;
        }
        Ok(())
    }));

    let (frames, close_code) = reload_frames(proxy.addr).await;
    assert_eq!(close_code, Some(1000));
    let output: Vec<u8> = frames
        .iter()
        .inspect(|f| assert_eq!(f["type"], "data"))
        .flat_map(|f| STANDARD.decode(f["v"].as_str().unwrap()).unwrap())
        .collect();
    assert_eq!(String::from_utf8(output).unwrap(), "Step 1/2\nStep 2/2\n");
}

#[tokio::test]
async fn test_reload_failure_reports_error() {
    let proxy = spawn_proxy(PortStatus::Failed("unused".to_string())).await;
    tokio::spawn(watcher::run_jobs(proxy.jobs, |_output| async move {
        Err("build failed".to_string())
    }));

    let (frames, close_code) = reload_frames(proxy.addr).await;
    assert_eq!(close_code, Some(1011));
    let last = frames.last().unwrap();
    assert_eq!(last["type"], "error");
    assert_eq!(last["v"], "build failed");
}

#[tokio::test]
async fn test_request_rebuild_collects_output() {
    let proxy = spawn_proxy(PortStatus::Failed("unused".to_string())).await;
    tokio::spawn(watcher::run_jobs(proxy.jobs, |output| async move {
        if let Some(tx) = output {
            let _ = tx.send(Bytes::from_static(b"Successfully built\n")).await;
        }
        Ok(())
    }));

    let mut output = Vec::new();
    request_rebuild(&format!("http://{}", proxy.addr), |chunk| {
        output.extend_from_slice(chunk)
    })
    .await
    .unwrap();
    assert_eq!(output, b"Successfully built\n");
}

#[tokio::test]
async fn test_request_rebuild_reports_failure() {
    let proxy = spawn_proxy(PortStatus::Failed("unused".to_string())).await;
    tokio::spawn(watcher::run_jobs(proxy.jobs, |_output| async move {
        Err("port lookup after rebuild failed".to_string())
    }));

    let err = request_rebuild(&format!("http://{}", proxy.addr), |_| {})
        .await
        .unwrap_err();
    assert!(err.to_string().contains("port lookup after rebuild failed"));
}

#[tokio::test]
async fn test_rebuild_requests_share_one_queue() {
    let proxy = spawn_proxy(PortStatus::Failed("unused".to_string())).await;
    let running = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let overlaps = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let (r, o) = (running.clone(), overlaps.clone());
    tokio::spawn(watcher::run_jobs(proxy.jobs, move |_output| {
        let (r, o) = (r.clone(), o.clone());
        async move {
            use std::sync::atomic::Ordering;
            if r.fetch_add(1, Ordering::SeqCst) > 0 {
                o.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            r.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }));

    let url = format!("http://{}", proxy.addr);
    let (a, b) = tokio::join!(request_rebuild(&url, |_| {}), request_rebuild(&url, |_| {}));
    a.unwrap();
    b.unwrap();
    assert_eq!(overlaps.load(std::sync::atomic::Ordering::SeqCst), 0);
}
