//! Edge proxy
//!
//! One long-lived process per project listens on loopback and forwards to the
//! editor inside the container. It serves a few routes of its own under
//! `/sail`, injects its script into the editor page, and exits when the
//! container stops being its own.

pub mod gc;
pub mod launch;
pub mod reload;
pub mod rewrite;
pub mod state;

use crate::docker::Docker;
use crate::errors::{ProxyError, Result};
use crate::labels::ContainerState;
use crate::port::PortLocator;
use crate::watcher::{self, RebuildJob};
use anyhow::Context as _;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Request, Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1 as client_http1;
use hyper::server::conn::http1 as server_http1;
use hyper_util::rt::TokioIo;
use state::{PortCache, RELOAD_REFRESH_DEADLINE, STARTUP_REFRESH_DEADLINE};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tower::Service;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// How long a proxied request waits for an in-flight port refresh
pub const REQUEST_PORT_WAIT: Duration = Duration::from_secs(45);

const SAIL_JS: &str = include_str!("sail.js");

/// State shared by request handlers
#[derive(Clone)]
pub struct ProxyState {
    pub container: String,
    pub ports: PortCache,
    pub jobs: mpsc::Sender<RebuildJob>,
    pub port_wait: Duration,
}

impl ProxyState {
    pub fn new(container: impl Into<String>, ports: PortCache, jobs: mpsc::Sender<RebuildJob>) -> Self {
        Self {
            container: container.into(),
            ports,
            jobs,
            port_wait: REQUEST_PORT_WAIT,
        }
    }

    pub fn with_port_wait(mut self, wait: Duration) -> Self {
        self.port_wait = wait;
        self
    }
}

/// Routes served by the proxy
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/sail.js", get(sail_js))
        .route("/sail/api/v1/healthz", get(healthz))
        .route("/sail/api/v1/reload", get(reload::handler))
        .fallback(forward)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn sail_js() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/javascript")],
        SAIL_JS,
    )
}

async fn healthz() -> &'static str {
    "ok\n"
}

fn wants_upgrade(req: &Request<Body>) -> bool {
    req.headers().get(header::UPGRADE).is_some()
        || req
            .headers()
            .get(header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"))
}

async fn forward(State(state): State<ProxyState>, req: Request<Body>) -> Response<Body> {
    let port = match state.ports.wait(state.port_wait).await {
        Ok(port) => port,
        Err(e) => {
            warn!("No editor port for {}: {}", state.container, e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!(
                    "failed to get code server port\n{}\nplease try to reload soon\n",
                    e
                ),
            )
                .into_response();
        }
    };

    let result = if wants_upgrade(&req) {
        forward_upgrade(port, req).await
    } else {
        forward_http(port, req).await
    };
    result.unwrap_or_else(|e| {
        debug!("Forwarding to port {} failed: {:#}", port, e);
        (StatusCode::BAD_GATEWAY, format!("{:#}\n", e)).into_response()
    })
}

async fn connect(
    port: u16,
) -> anyhow::Result<client_http1::SendRequest<Body>> {
    let stream = TcpStream::connect(("localhost", port))
        .await
        .with_context(|| format!("failed to connect to editor port {}", port))?;
    let (sender, conn) = client_http1::Builder::new()
        .handshake(TokioIo::new(stream))
        .await
        .context("editor handshake failed")?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            let msg = e.to_string().to_lowercase();
            if !msg.contains("canceled") && !msg.contains("incomplete") {
                debug!("editor connection ended: {}", e);
            }
        }
    });
    Ok(sender)
}

fn upstream_request(req: &Request<Body>, body: Body) -> anyhow::Result<Request<Body>> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let mut upstream = Request::builder()
        .method(req.method().clone())
        .uri(path_and_query)
        .body(body)
        .context("failed to build editor request")?;
    *upstream.headers_mut() = req.headers().clone();
    Ok(upstream)
}

async fn forward_http(port: u16, req: Request<Body>) -> anyhow::Result<Response<Body>> {
    let root = rewrite::should_rewrite(req.uri().path(), false);
    let method = req.method().clone();
    let (parts, body) = req.into_parts();
    let head = Request::from_parts(parts, Body::empty());
    let upstream_req = upstream_request(&head, body)?;

    let mut sender = connect(port).await?;
    let response = sender
        .send_request(upstream_req)
        .await
        .context("editor request failed")?;
    let (mut parts, incoming) = response.into_parts();

    if !root || !rewrite::is_rewritable_response(&method, parts.status, &parts.headers) {
        return Ok(Response::from_parts(parts, Body::new(incoming)));
    }

    let original = incoming
        .collect()
        .await
        .context("failed to read editor response")?
        .to_bytes();
    let gzipped = parts
        .headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
    let rewritten = rewrite::rewrite_body(&original, gzipped).context("failed to rewrite page")?;
    parts.headers.remove(header::TRANSFER_ENCODING);
    parts
        .headers
        .insert(header::CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
    Ok(Response::from_parts(parts, Body::from(rewritten)))
}

async fn forward_upgrade(port: u16, mut req: Request<Body>) -> anyhow::Result<Response<Body>> {
    let body = std::mem::take(req.body_mut());
    let upstream_req = upstream_request(&req, body)?;

    let mut sender = connect(port).await?;
    let upstream = sender
        .send_request(upstream_req)
        .await
        .context("editor upgrade request failed")?;

    if upstream.status() != StatusCode::SWITCHING_PROTOCOLS {
        let (parts, incoming) = upstream.into_parts();
        return Ok(Response::from_parts(parts, Body::new(incoming)));
    }

    let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (key, value) in upstream.headers() {
        builder = builder.header(key, value);
    }

    let client_upgrade = hyper::upgrade::on(&mut req);
    let upstream_upgrade = hyper::upgrade::on(upstream);
    let response = builder
        .body(Body::empty())
        .context("failed to build upgrade response")?;

    tokio::spawn(async move {
        let (client_io, upstream_io) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
            Ok(pair) => pair,
            Err(e) => {
                debug!("upgrade bridging setup failed: {}", e);
                return;
            }
        };
        let mut client_io = TokioIo::new(client_io);
        let mut upstream_io = TokioIo::new(upstream_io);
        if let Err(e) = tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
            let msg = e.to_string().to_lowercase();
            if !msg.contains("broken pipe") && !msg.contains("connection reset") {
                debug!("upgrade bridge error: {}", e);
            }
        }
    });

    Ok(response)
}

/// Accept connections until `fatal` reports a reason to exit.
pub async fn serve_connections(
    listener: TcpListener,
    app: Router,
    mut fatal: mpsc::Receiver<String>,
) -> Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted.map_err(ProxyError::Bind)?,
            reason = fatal.recv() => {
                let reason = reason.unwrap_or_else(|| "fatal channel closed".to_string());
                error!("Proxy exiting: {}", reason);
                return Err(ProxyError::Terminated { reason }.into());
            }
        };

        let tower_service = app.clone();
        tokio::spawn(async move {
            let hyper_service = hyper::service::service_fn(move |request: Request<Incoming>| {
                tower_service.clone().call(request)
            });
            if let Err(err) = server_http1::Builder::new()
                .serve_connection(TokioIo::new(stream), hyper_service)
                .with_upgrades()
                .await
            {
                let err_str = err.to_string().to_lowercase();
                if !err_str.contains("shutting down")
                    && !err_str.contains("connection reset")
                    && !err_str.contains("broken pipe")
                {
                    debug!("Error serving {}: {}", peer, err);
                }
            }
        });
    }
}

/// Settings for [`run`]
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub container: String,
    pub listen: SocketAddr,
    /// Binary used for `edit --container` rebuilds
    pub self_exe: PathBuf,
    pub watch: bool,
}

impl ProxyConfig {
    pub fn new(container: impl Into<String>, self_exe: PathBuf) -> Self {
        Self {
            container: container.into(),
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            self_exe,
            watch: false,
        }
    }
}

/// `http://<addr>`
pub fn url_for(addr: SocketAddr) -> String {
    format!("http://{}", addr)
}

async fn announce(url: &str) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(format!("{}\n", url).as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

async fn start_watching(docker: &dyn Docker, container: &str, jobs: mpsc::Sender<RebuildJob>) -> Result<watcher::WatchHandle> {
    let info = crate::docker::require_container(docker, container).await?;
    let state = ContainerState::from_labels(container, &info.labels)?;
    let hat_dir = state
        .hat
        .as_deref()
        .filter(|h| !crate::hat::is_remote(h))
        .map(Path::new);
    let paths = watcher::watch_paths(Path::new(&state.project_local_dir), hat_dir);
    watcher::spawn(&paths, jobs)
}

/// Run the proxy for `config.container` until it terminates.
pub async fn run(
    config: ProxyConfig,
    docker: Arc<dyn Docker>,
    locator: Arc<dyn PortLocator>,
) -> Result<()> {
    let listener = TcpListener::bind(config.listen)
        .await
        .map_err(ProxyError::Bind)?;
    let addr = listener.local_addr().map_err(ProxyError::Bind)?;
    let url = url_for(addr);
    announce(&url).await?;
    info!("Proxy for {} listening on {}", config.container, url);

    let ports = PortCache::new();
    let (jobs_tx, jobs_rx) = watcher::job_queue();
    let (fatal_tx, fatal_rx) = mpsc::channel::<String>(4);

    {
        let (ports, docker, locator, fatal) = (
            ports.clone(),
            Arc::clone(&docker),
            Arc::clone(&locator),
            fatal_tx.clone(),
        );
        let container = config.container.clone();
        let watch = config.watch;
        let jobs = jobs_tx.clone();
        tokio::spawn(async move {
            let refreshed = ports
                .refresh(locator.as_ref(), docker.as_ref(), &container, STARTUP_REFRESH_DEADLINE)
                .await;
            if let Err(e) = refreshed {
                let _ = fatal.send(format!("initial port lookup failed: {}", e)).await;
                return;
            }
            if watch {
                match start_watching(docker.as_ref(), &container, jobs).await {
                    Ok(handle) => handle.join().await,
                    Err(e) => warn!("Not watching {}: {}", container, e),
                }
            }
        });
    }

    {
        let (ports, docker, locator, fatal) = (
            ports.clone(),
            Arc::clone(&docker),
            Arc::clone(&locator),
            fatal_tx.clone(),
        );
        let container = config.container.clone();
        let exe = config.self_exe.clone();
        tokio::spawn(watcher::run_jobs(jobs_rx, move |output| {
            let (ports, docker, locator, fatal) =
                (ports.clone(), Arc::clone(&docker), Arc::clone(&locator), fatal.clone());
            let container = container.clone();
            let exe = exe.clone();
            async move {
                let rebuilt = reload::rebuild_via_cli(&exe, &container, output).await;
                let refreshed = ports
                    .refresh(locator.as_ref(), docker.as_ref(), &container, RELOAD_REFRESH_DEADLINE)
                    .await;
                if let Err(e) = refreshed {
                    let reason = format!("port lookup after rebuild failed: {}", e);
                    let _ = fatal.send(reason.clone()).await;
                    return Err(reason);
                }
                rebuilt
            }
        }));
    }

    tokio::spawn(gc::run(
        Arc::clone(&docker),
        config.container.clone(),
        url.clone(),
        gc::GC_INTERVAL,
        fatal_tx,
    ));

    let app = router(ProxyState::new(config.container.clone(), ports, jobs_tx));
    serve_connections(listener, app, fatal_rx).await
}
