//! Readiness checks and the browser hand-off.

use anyhow::{Context, Result};
use sail_core::codeserver;
use sail_core::docker::Docker;
use sail_core::port::{self, PortLocator};
use sail_core::retry::{default_classifier, poll_until};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const PORT_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(15);

fn healthz_url(proxy_url: &str) -> Result<url::Url> {
    let base = url::Url::parse(proxy_url).with_context(|| format!("invalid proxy url {}", proxy_url))?;
    Ok(base.join("/sail/api/v1/healthz")?)
}

fn client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?)
}

async fn healthz(client: &reqwest::Client, url: &url::Url) -> reqwest::Result<()> {
    client.get(url.clone()).send().await?.error_for_status()?;
    Ok(())
}

/// Whether the proxy at `proxy_url` answers its health check.
pub async fn proxy_healthy(proxy_url: &str) -> bool {
    match (client(), healthz_url(proxy_url)) {
        (Ok(client), Ok(url)) => healthz(&client, &url).await.is_ok(),
        _ => false,
    }
}

/// Wait for code-server to listen inside `container`, then for the proxy to
/// answer.
pub async fn wait_online(
    docker: &dyn Docker,
    locator: &dyn PortLocator,
    container: &str,
    proxy_url: &str,
) -> Result<()> {
    let port = port::wait_for_port(locator, docker, container, POLL_INTERVAL, PORT_TIMEOUT)
        .await
        .context("code-server did not start")?;
    debug!("code-server in {} listens on {}", container, port);

    let client = client()?;
    let url = healthz_url(proxy_url)?;
    poll_until(
        POLL_INTERVAL,
        HEALTH_TIMEOUT,
        || healthz(&client, &url),
        default_classifier,
    )
    .await
    .with_context(|| format!("proxy at {} is not responding", proxy_url))
}

/// Dump the editor log from inside the container to stderr.
pub async fn print_editor_log(docker: &dyn Docker, container: &str) {
    let cmd = vec!["cat".to_string(), codeserver::LOG_PATH.to_string()];
    match docker.exec(container, &cmd).await {
        Ok(result) => {
            eprintln!("--- {} ---", codeserver::LOG_PATH);
            eprintln!("{}", result.stdout.trim_end());
        }
        Err(e) => warn!("Failed to read {}: {}", codeserver::LOG_PATH, e),
    }
}

fn opener() -> &'static str {
    if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    }
}

/// Open `url` in the default browser. Failures are logged; the URL is
/// always printed.
pub async fn open_browser(url: &str) {
    println!("{}", url);
    let status = Command::new(opener())
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("{} exited with {}", opener(), status),
        Err(e) => warn!("Failed to run {}: {}", opener(), e),
    }
}
