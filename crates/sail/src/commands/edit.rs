//! Edit command implementation
//!
//! Implements `sail edit`: open the project (or hat) Dockerfile in the user's
//! editor, then rebuild the container in place. With `--container` (as run by
//! the proxy) the rebuild always happens in this process.

use crate::commands::shared::{rebuild_environment, rebuild_in_process, CommandContext, GlobalArgs};
use anyhow::{anyhow, bail, Context, Result};
use sail_core::docker;
use sail_core::hat;
use sail_core::labels::ContainerState;
use sail_core::project;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, instrument};

/// Edit command arguments
#[derive(Debug, Clone)]
pub struct EditArgs {
    /// Repository, or a container name when `container` is set
    pub target: String,
    pub hat: bool,
    pub container: bool,
    pub globals: GlobalArgs,
}

/// Write `FROM <image>` to `path` unless it already exists. Returns whether
/// the file was created.
pub fn ensure_dockerfile(path: &Path, default_image: &str) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, format!("FROM {}\n", default_image))?;
    Ok(true)
}

/// `$EDITOR` split into program and arguments, else `vi`.
pub fn editor_command(editor: Option<&str>) -> Result<Vec<String>> {
    let raw = editor.map(str::trim).filter(|e| !e.is_empty()).unwrap_or("vi");
    let words = shell_words::split(raw).with_context(|| format!("invalid EDITOR {:?}", raw))?;
    if words.is_empty() {
        bail!("invalid EDITOR {:?}", raw);
    }
    Ok(words)
}

/// Dockerfile of a local hat; remote hats cannot be edited.
fn hat_dockerfile(state: &ContainerState) -> Result<PathBuf> {
    match state.hat.as_deref() {
        None => bail!("no hat is applied to this environment"),
        Some(h) if hat::is_remote(h) => bail!("cannot edit remote hat {}", h),
        Some(h) => Ok(Path::new(h).join("Dockerfile")),
    }
}

async fn run_editor(file: &Path) -> Result<()> {
    let mut words = editor_command(std::env::var("EDITOR").ok().as_deref())?;
    let program = words.remove(0);
    let status = Command::new(&program)
        .args(&words)
        .arg(file)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .with_context(|| format!("failed to start editor {}", program))?;
    if !status.success() {
        bail!("editor {} exited with {}", program, status);
    }
    Ok(())
}

/// Execute the edit command
#[instrument(skip(args), fields(target = %args.target))]
pub async fn execute_edit(args: EditArgs) -> Result<()> {
    let ctx = CommandContext::load(&args.globals)?;
    ctx.require_engine().await?;

    let name = if args.container {
        args.target.clone()
    } else {
        ctx.project(&args.target)?.identity().container_name
    };
    let info = docker::require_container(&ctx.docker, &name).await?;
    let state = ContainerState::from_labels(&name, &info.labels)?;

    let file = if args.hat {
        hat_dockerfile(&state)?
    } else {
        let path = project::dockerfile_path(Path::new(&state.project_local_dir));
        if ensure_dockerfile(&path, &ctx.config.default_image)? {
            info!("Created {}", path.display());
        }
        path
    };
    if !file.is_file() {
        return Err(anyhow!("{} does not exist", file.display()));
    }
    run_editor(&file).await?;

    if args.container {
        rebuild_in_process(&ctx, &name).await?;
    } else {
        rebuild_environment(&ctx, &name).await?;
    }
    println!("rebuilt {}", name);
    Ok(())
}
