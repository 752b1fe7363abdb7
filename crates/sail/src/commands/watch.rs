//! Watch command implementation
//!
//! Implements `sail watch`: rebuild the environment in the foreground
//! whenever the project's `.sail` directory or a local hat changes. Each
//! rebuild is routed like `sail edit`, so a running proxy serializes it with
//! browser reloads.

use crate::commands::shared::{rebuild_environment, CommandContext, GlobalArgs};
use anyhow::Result;
use sail_core::docker;
use sail_core::hat;
use sail_core::labels::ContainerState;
use sail_core::watcher;
use std::path::Path;
use tracing::{info, instrument};

/// Watch command arguments
#[derive(Debug, Clone)]
pub struct WatchArgs {
    pub repo: String,
    pub globals: GlobalArgs,
}

/// Execute the watch command
#[instrument(skip(args), fields(repo = %args.repo))]
pub async fn execute_watch(args: WatchArgs) -> Result<()> {
    let ctx = CommandContext::load(&args.globals)?;
    ctx.require_engine().await?;

    let name = ctx.project(&args.repo)?.identity().container_name;
    let info = docker::require_container(&ctx.docker, &name).await?;
    let state = ContainerState::from_labels(&name, &info.labels)?;

    let hat_dir = state
        .hat
        .as_deref()
        .filter(|h| !hat::is_remote(h))
        .map(Path::new);
    let paths = watcher::watch_paths(Path::new(&state.project_local_dir), hat_dir);

    let (jobs_tx, jobs_rx) = watcher::job_queue();
    let _handle = watcher::spawn(&paths, jobs_tx)?;
    info!("Watching {} for changes; press Ctrl-C to stop", name);

    let (ctx, name) = (&ctx, &name);
    let jobs = watcher::run_jobs(jobs_rx, move |_output| async move {
        rebuild_environment(ctx, name)
            .await
            .map(|route| info!("Rebuilt {} ({:?})", name, route))
            .map_err(|e| format!("{:#}", e))
    });

    tokio::select! {
        _ = jobs => {}
        _ = tokio::signal::ctrl_c() => info!("Stopped watching {}", name),
    }
    Ok(())
}
