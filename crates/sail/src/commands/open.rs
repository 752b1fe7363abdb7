//! Open command implementation
//!
//! Implements `sail open`: start a stopped environment, replace its proxy if
//! that one is gone, and open the browser.

use crate::commands::shared::{
    open_browser, print_editor_log, proxy_healthy, wait_online, CommandContext, GlobalArgs,
};
use anyhow::{Context, Result};
use sail_core::docker::{self, Docker};
use sail_core::labels::ContainerState;
use sail_core::proxy::launch::fork_proxy;
use sail_core::rebuild::{RebuildOptions, Rebuilder};
use tracing::{info, instrument, warn};

/// Open command arguments
#[derive(Debug, Clone)]
pub struct OpenArgs {
    pub repo: String,
    pub no_open: bool,
    pub globals: GlobalArgs,
}

/// Execute the open command
#[instrument(skip(args), fields(repo = %args.repo))]
pub async fn execute_open(args: OpenArgs) -> Result<()> {
    let ctx = CommandContext::load(&args.globals)?;
    ctx.require_engine().await?;

    let name = ctx.project(&args.repo)?.identity().container_name;
    let info = docker::require_container(&ctx.docker, &name).await?;
    let state = ContainerState::from_labels(&name, &info.labels)?;

    if !info.running {
        info!("Starting {}", name);
        ctx.docker.start_container(&name).await?;
    }

    let locator = ctx.locator();
    let mut proxy_url = state.proxy_url.clone();
    if !proxy_healthy(&proxy_url).await {
        info!("Proxy at {} is gone; starting a new one", proxy_url);
        proxy_url = fork_proxy(&ctx.self_exe, &name, false).await?;

        // The container records its proxy; rebuild so the new one owns it.
        let run_ctx = ctx.run_context().await?;
        let options = RebuildOptions {
            proxy_url: Some(proxy_url.clone()),
        };
        let report = Rebuilder::new(&ctx.docker, locator.as_ref(), &run_ctx)
            .rebuild(&name, &options)
            .await
            .with_context(|| format!("failed to attach new proxy to {}", name))?;
        if let Some(err) = &report.outcome.on_start_error {
            warn!("on_start failed in {}: {}", name, err);
        }
    }

    if let Err(e) = wait_online(&ctx.docker, locator.as_ref(), &name, &proxy_url).await {
        print_editor_log(&ctx.docker, &name).await;
        return Err(e);
    }

    if args.no_open {
        println!("{}", proxy_url);
    } else {
        open_browser(&proxy_url).await;
    }
    Ok(())
}
