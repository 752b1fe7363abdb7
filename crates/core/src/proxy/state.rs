//! Cached editor port
//!
//! Readers see one of three states. While a refresh is running they wait
//! instead of using a port that may belong to the replaced container.

use crate::docker::Docker;
use crate::errors::Result;
use crate::port::{self, PortLocator};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Lookup retry interval during a refresh
pub const REFRESH_INTERVAL: Duration = Duration::from_millis(100);
/// Refresh deadline when the proxy starts
pub const STARTUP_REFRESH_DEADLINE: Duration = Duration::from_secs(30);
/// Refresh deadline after a rebuild
pub const RELOAD_REFRESH_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortStatus {
    Refreshing,
    Ready(u16),
    Failed(String),
}

/// Shared port slot; clones observe the same value.
#[derive(Debug, Clone)]
pub struct PortCache {
    tx: watch::Sender<PortStatus>,
}

impl Default for PortCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PortCache {
    /// Starts out refreshing
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PortStatus::Refreshing);
        Self { tx }
    }

    pub fn current(&self) -> PortStatus {
        self.tx.borrow().clone()
    }

    pub fn set(&self, status: PortStatus) {
        self.tx.send_replace(status);
    }

    /// The port, waiting up to `timeout` for an in-flight refresh.
    pub async fn wait(&self, timeout: Duration) -> std::result::Result<u16, String> {
        let mut rx = self.tx.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|status| !matches!(status, PortStatus::Refreshing)),
        )
        .await;
        match settled {
            Err(_) => Err(format!("port refresh still running after {:?}", timeout)),
            Ok(Err(_)) => Err("port cache closed".to_string()),
            Ok(Ok(status)) => match &*status {
                PortStatus::Ready(port) => Ok(*port),
                PortStatus::Failed(reason) => Err(reason.clone()),
                PortStatus::Refreshing => Err("port refresh in progress".to_string()),
            },
        }
    }

    /// Mark the slot refreshing and look the port up again, polling until
    /// `deadline`.
    #[instrument(skip(self, locator, docker))]
    pub async fn refresh(
        &self,
        locator: &dyn PortLocator,
        docker: &dyn Docker,
        container: &str,
        deadline: Duration,
    ) -> Result<u16> {
        self.set(PortStatus::Refreshing);
        debug!("Refreshing editor port for {}", container);
        match port::wait_for_port(locator, docker, container, REFRESH_INTERVAL, deadline).await {
            Ok(port) => {
                info!("Editor port for {} is {}", container, port);
                self.set(PortStatus::Ready(port));
                Ok(port)
            }
            Err(e) => {
                warn!("Port refresh for {} failed: {}", container, e);
                self.set(PortStatus::Failed(e.to_string()));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::mock::{MockContainer, MockDocker};
    use crate::host::FIXED_GUEST_PORT;
    use crate::port::FixedMappingLocator;

    #[tokio::test(start_paused = true)]
    async fn test_wait_blocks_until_ready() {
        let cache = PortCache::new();
        let writer = cache.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            writer.set(PortStatus::Ready(8123));
        });
        assert_eq!(cache.wait(Duration::from_secs(45)).await, Ok(8123));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_while_refreshing() {
        let cache = PortCache::new();
        assert!(cache.wait(Duration::from_secs(45)).await.is_err());
        assert_eq!(cache.current(), PortStatus::Refreshing);
    }

    #[tokio::test]
    async fn test_failed_refresh_is_visible_to_readers() {
        let cache = PortCache::new();
        cache.set(PortStatus::Failed("no port".to_string()));
        assert_eq!(
            cache.wait(Duration::from_secs(1)).await,
            Err("no port".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_records_failure() {
        let docker = MockDocker::new();
        docker.add_container(MockContainer::new("c", "img"));
        let cache = PortCache::new();
        cache.set(PortStatus::Ready(1));
        let err = cache
            .refresh(&FixedMappingLocator, &docker, "c", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(cache.current(), PortStatus::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_refresh_outlasts_container_creation() {
        let docker = MockDocker::new();
        let late = docker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            late.add_container(MockContainer::new("c", "img").with_published(8123, FIXED_GUEST_PORT));
        });
        let cache = PortCache::new();
        let port = cache
            .refresh(&FixedMappingLocator, &docker, "c", STARTUP_REFRESH_DEADLINE)
            .await
            .unwrap();
        assert_eq!(port, 8123);
        assert_eq!(cache.current(), PortStatus::Ready(8123));
    }
}
