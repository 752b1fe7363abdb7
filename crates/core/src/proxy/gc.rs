//! Ownership check loop
//!
//! A proxy only serves the container that names it in its proxy URL label.
//! When that stops being true twice in a row the proxy exits.

use crate::docker::Docker;
use crate::labels;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

pub const GC_INTERVAL: Duration = Duration::from_secs(10);
pub const MAX_CONSECUTIVE_FAILURES: u32 = 2;

/// `Err` with the reason when `container` is gone, owned by another proxy,
/// or not running.
pub async fn check_ownership(
    docker: &dyn Docker,
    container: &str,
    proxy_url: &str,
) -> std::result::Result<(), String> {
    let info = docker
        .inspect_container(container)
        .await
        .map_err(|e| format!("failed to inspect {}: {}", container, e))?
        .ok_or_else(|| format!("container {} does not exist", container))?;

    match info.labels.get(labels::PROXY_URL) {
        Some(url) if url == proxy_url => {}
        Some(url) => {
            return Err(format!(
                "container {} belongs to proxy {}, not {}",
                container, url, proxy_url
            ))
        }
        None => return Err(format!("container {} has no proxy url label", container)),
    }

    if !info.running {
        return Err(format!("container {} is not running", container));
    }
    Ok(())
}

/// Check every `interval`; send the last reason on `fatal` after
/// [`MAX_CONSECUTIVE_FAILURES`] failures in a row.
pub async fn run(
    docker: Arc<dyn Docker>,
    container: String,
    proxy_url: String,
    interval: Duration,
    fatal: mpsc::Sender<String>,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0;
    loop {
        ticker.tick().await;
        match check_ownership(docker.as_ref(), &container, &proxy_url).await {
            Ok(()) => {
                if failures > 0 {
                    debug!("Ownership check recovered");
                }
                failures = 0;
            }
            Err(reason) => {
                failures += 1;
                warn!("Ownership check {} failed: {}", failures, reason);
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    let _ = fatal.send(reason).await;
                    return;
                }
            }
        }
    }
}
