//! Run command implementation
//!
//! Implements `sail run`: clone the project, build its image and hat, start
//! the proxy and the container, then wait for the editor.

use crate::commands::shared::{
    open_browser, print_editor_log, wait_online, CommandContext, GlobalArgs,
};
use anyhow::{bail, Context, Result};
use sail_core::docker::{self, BuildSpec, Docker};
use sail_core::git;
use sail_core::hat::{HatBuilder, HatDescriptor};
use sail_core::port;
use sail_core::project::Project;
use sail_core::proxy::launch::fork_proxy;
use sail_core::runner::Runner;
use tracing::{info, instrument, warn};

/// Run command arguments
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub repo: String,
    pub image: Option<String>,
    pub hat: Option<String>,
    pub keep: bool,
    pub no_open: bool,
    pub watch: bool,
    pub globals: GlobalArgs,
}

/// Base image: the flag, else the project image built from
/// `.sail/Dockerfile`, else the configured default.
async fn base_image(
    docker: &dyn Docker,
    project: &Project,
    flag: Option<&str>,
    default_image: &str,
) -> Result<String> {
    if let Some(image) = flag {
        return Ok(image.to_string());
    }
    let dockerfile = project.dockerfile_path();
    if !dockerfile.is_file() {
        return Ok(default_image.to_string());
    }
    let tag = project.identity().container_name;
    info!("Building project image {}", tag);
    docker
        .build_image(&BuildSpec {
            tag: tag.clone(),
            dockerfile,
            context: project.local_dir(),
            labels: Default::default(),
            network_host: true,
        })
        .await
        .context("failed to build project image")?;
    Ok(tag)
}

/// Execute the run command
#[instrument(skip(args), fields(repo = %args.repo))]
pub async fn execute_run(args: RunArgs) -> Result<()> {
    let ctx = CommandContext::load(&args.globals)?;
    ctx.require_engine().await?;
    git::ensure_available().await?;

    let project = ctx.project(&args.repo)?;
    let identity = project.identity();
    let name = identity.container_name.clone();

    if ctx.docker.inspect_container(&name).await?.is_some() {
        bail!(
            "container {} already exists; use `sail open {}` or `sail rm {}`",
            name,
            args.repo,
            args.repo
        );
    }

    let local_dir = project.local_dir();
    if git::ensure_cloned(&project.repo.clone_uri(), &local_dir).await? {
        info!("Cloned {} into {}", project.repo, local_dir.display());
    }

    let run_ctx = ctx.run_context().await?;
    let base = base_image(
        &ctx.docker,
        &project,
        args.image.as_deref(),
        &ctx.config.default_image,
    )
    .await?;
    let hat = ctx.resolve_hat(args.hat.as_deref())?;
    let image = HatBuilder::new(&ctx.docker)
        .apply_optional(&HatDescriptor {
            base_image: base.clone(),
            hat: hat.clone(),
        })
        .await?;

    let port = port::find_available_port()?;
    let proxy_url = fork_proxy(&ctx.self_exe, &name, args.watch).await?;
    info!("Proxy for {} at {}", name, proxy_url);

    let runner = Runner {
        container_name: name.clone(),
        hostname: identity.hostname.clone(),
        port,
        proxy_url: proxy_url.clone(),
        project_local_dir: local_dir,
        project_name: identity.project_name.clone(),
        base_image: base,
        hat,
    };

    let outcome = match runner.run(&ctx.docker, &run_ctx, &image).await {
        Ok(outcome) => outcome,
        Err(e) => {
            cleanup(&ctx.docker, &name, args.keep).await;
            return Err(e).context("failed to start environment");
        }
    };
    if let Some(err) = &outcome.on_start_error {
        warn!("on_start failed in {}: {}", name, err);
    }

    let locator = ctx.locator();
    if let Err(e) = wait_online(&ctx.docker, locator.as_ref(), &name, &proxy_url).await {
        print_editor_log(&ctx.docker, &name).await;
        cleanup(&ctx.docker, &name, args.keep).await;
        return Err(e);
    }

    info!("{} is ready in {}", name, outcome.project_dir);
    if args.no_open {
        println!("{}", proxy_url);
    } else {
        open_browser(&proxy_url).await;
    }
    Ok(())
}

async fn cleanup(docker: &dyn Docker, name: &str, keep: bool) {
    if keep {
        warn!("Keeping {} for inspection", name);
        return;
    }
    if let Err(e) = docker::stop_remove(docker, name).await {
        warn!("Failed to remove {}: {}", name, e);
    }
}
