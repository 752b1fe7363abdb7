//! Rm command implementation

use crate::commands::shared::{CommandContext, GlobalArgs};
use anyhow::{Context, Result};
use sail_core::docker::{self, Docker};
use sail_core::host;
use sail_core::labels::{self, PROJECT_LOCAL_DIR};
use std::path::Path;
use tracing::{info, instrument, warn};

/// Rm command arguments
#[derive(Debug, Clone)]
pub struct RmArgs {
    pub repo: Option<String>,
    pub all: bool,
    pub with_data: bool,
    pub globals: GlobalArgs,
}

fn remove_dir(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_dir_all(path)
            .with_context(|| format!("failed to delete {}", path.display()))?;
        info!("Deleted {}", path.display());
    }
    Ok(())
}

/// Stop and remove `name`; with `with_data` also delete its project
/// checkout and its directory under `meta_root`.
pub async fn remove_environment(
    docker: &dyn Docker,
    name: &str,
    with_data: bool,
    meta_root: &Path,
) -> Result<()> {
    let info = docker::require_container(docker, name).await?;
    docker::stop_remove(docker, name).await?;
    info!("Removed {}", name);

    if with_data {
        if let Some(local_dir) = info.labels.get(PROJECT_LOCAL_DIR).filter(|d| !d.is_empty()) {
            remove_dir(Path::new(local_dir))?;
        }
        remove_dir(&host::container_meta_dir(meta_root, name))?;
    }
    Ok(())
}

/// Execute the rm command
#[instrument(skip(args))]
pub async fn execute_rm(args: RmArgs) -> Result<()> {
    let ctx = CommandContext::load(&args.globals)?;
    ctx.require_engine().await?;
    let meta_root = host::meta_root()?;

    let names = match (&args.repo, args.all) {
        (_, true) => ctx
            .docker
            .list_containers(Some(&labels::marker_filter()), true)
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect(),
        (Some(repo), false) => vec![ctx.project(repo)?.identity().container_name],
        (None, false) => anyhow::bail!("specify a repository or --all"),
    };

    let mut failed = 0;
    for name in &names {
        if let Err(e) = remove_environment(&ctx.docker, name, args.with_data, &meta_root).await {
            warn!("Failed to remove {}: {:#}", name, e);
            failed += 1;
        }
    }
    if failed > 0 {
        anyhow::bail!("failed to remove {} of {} environments", failed, names.len());
    }
    Ok(())
}
