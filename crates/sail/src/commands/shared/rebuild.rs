//! Rebuild routing for commands that change an environment's Dockerfiles.
//!
//! While the environment's proxy is up, rebuilds go through its reload
//! socket: the proxy runs one rebuild at a time and refreshes its cached
//! editor port afterwards. Without a proxy the rebuild runs in-process.

use super::{proxy_healthy, CommandContext};
use anyhow::{Context, Result};
use sail_core::docker::{self, Docker};
use sail_core::labels::ContainerState;
use sail_core::proxy::reload;
use sail_core::rebuild::{RebuildOptions, Rebuilder};
use std::io::Write;
use tracing::{info, warn};

/// How a rebuild was carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildRoute {
    Proxy,
    InProcess,
}

/// Rebuild `name` in this process, without involving its proxy.
pub async fn rebuild_in_process(ctx: &CommandContext, name: &str) -> Result<()> {
    let run_ctx = ctx.run_context().await?;
    let locator = ctx.locator();
    let report = Rebuilder::new(&ctx.docker, locator.as_ref(), &run_ctx)
        .rebuild(name, &RebuildOptions::default())
        .await
        .with_context(|| format!("failed to rebuild {}", name))?;
    if let Some(err) = &report.outcome.on_start_error {
        warn!("on_start failed in {}: {}", name, err);
    }
    info!("Rebuilt {} from {} on port {}", name, report.image, report.port);
    Ok(())
}

/// Ask the proxy at `proxy_url` to rebuild, echoing its output to stderr.
pub async fn rebuild_through_proxy(proxy_url: &str) -> Result<()> {
    let mut stderr = std::io::stderr();
    reload::request_rebuild(proxy_url, |chunk| {
        let _ = stderr.write_all(chunk);
    })
    .await
    .with_context(|| format!("rebuild through {} failed", proxy_url))
}

/// Route for rebuilding `name`, with the proxy URL recorded on it.
pub async fn choose_route(docker: &dyn Docker, name: &str) -> Result<(RebuildRoute, String)> {
    let info = docker::require_container(docker, name).await?;
    let state = ContainerState::from_labels(name, &info.labels)?;
    let route = if proxy_healthy(&state.proxy_url).await {
        RebuildRoute::Proxy
    } else {
        RebuildRoute::InProcess
    };
    Ok((route, state.proxy_url))
}

/// Rebuild `name`, through its proxy when one answers.
pub async fn rebuild_environment(ctx: &CommandContext, name: &str) -> Result<RebuildRoute> {
    let (route, proxy_url) = choose_route(&ctx.docker, name).await?;
    match route {
        RebuildRoute::Proxy => {
            info!("Rebuilding {} through {}", name, proxy_url);
            rebuild_through_proxy(&proxy_url).await?;
        }
        RebuildRoute::InProcess => {
            info!("No proxy answers for {}; rebuilding in-process", name);
            rebuild_in_process(ctx, name).await?;
        }
    }
    Ok(route)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sail_core::docker::mock::{MockContainer, MockDocker};
    use sail_core::proxy::state::PortCache;
    use sail_core::proxy::{router, serve_connections, ProxyState};
    use sail_core::watcher;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn environment(proxy_url: &str) -> MockDocker {
        let state = ContainerState {
            base_image: "codercom/ubuntu-dev".to_string(),
            hat: None,
            project_local_dir: "/home/user/Projects/cdr/sail".to_string(),
            project_dir: "/home/user/sail".to_string(),
            project_name: "sail".to_string(),
            proxy_url: proxy_url.to_string(),
        };
        let docker = MockDocker::new();
        docker.add_container(MockContainer::new("cdr_sail", "img").with_labels(state.to_labels()));
        docker
    }

    #[tokio::test]
    async fn test_live_proxy_takes_the_rebuild() {
        let (jobs_tx, _jobs_rx) = watcher::job_queue();
        let (_fatal_tx, fatal_rx) = mpsc::channel(1);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let app = router(ProxyState::new("cdr_sail", PortCache::new(), jobs_tx));
        tokio::spawn(serve_connections(listener, app, fatal_rx));

        let docker = environment(&url);
        let (route, recorded) = choose_route(&docker, "cdr_sail").await.unwrap();
        assert_eq!(route, RebuildRoute::Proxy);
        assert_eq!(recorded, url);
    }

    #[tokio::test]
    async fn test_dead_proxy_rebuilds_in_process() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let docker = environment(&url);
        let (route, _) = choose_route(&docker, "cdr_sail").await.unwrap();
        assert_eq!(route, RebuildRoute::InProcess);
    }

    #[tokio::test]
    async fn test_missing_environment_is_an_error() {
        let docker = MockDocker::new();
        assert!(choose_route(&docker, "cdr_sail").await.is_err());
    }
}
