//! Thin wrapper over the `git` binary

use crate::errors::{ProjectError, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, instrument};

/// Check that `git` can be executed
#[instrument]
pub async fn ensure_available() -> Result<()> {
    match Command::new("git").arg("--version").output().await {
        Ok(output) if output.status.success() => Ok(()),
        _ => Err(ProjectError::Git("git is not installed".to_string()).into()),
    }
}

/// `git clone <uri> <target>`
#[instrument]
pub async fn clone(uri: &str, target: &Path) -> Result<()> {
    info!("Cloning {} to {}", uri, target.display());
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let output = Command::new("git")
        .arg("clone")
        .arg(uri)
        .arg(target)
        .stdin(Stdio::inherit())
        .output()
        .await
        .map_err(|e| ProjectError::Git(format!("Failed to execute git clone: {}", e)))?;

    if output.status.success() {
        debug!("Cloned {}", uri);
        Ok(())
    } else {
        Err(ProjectError::Git(format!(
            "clone of {} failed: {}",
            uri,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
        .into())
    }
}

/// Clone unless `target` already holds a repository
pub async fn ensure_cloned(uri: &str, target: &Path) -> Result<bool> {
    if target.join(".git").exists() {
        debug!("{} is already cloned", target.display());
        return Ok(false);
    }
    clone(uri, target).await?;
    Ok(true)
}
