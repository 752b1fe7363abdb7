//! Per-invocation state every command starts from.

use anyhow::{Context, Result};
use sail_core::codeserver;
use sail_core::config::SailConfig;
use sail_core::docker::{CliRuntime, Docker};
use sail_core::hat;
use sail_core::host::{self, HostCapabilities};
use sail_core::port::{self, PortLocator};
use sail_core::project::{Project, Repo};
use sail_core::runner::RunContext;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Global flags carried into every command
#[derive(Debug, Clone)]
pub struct GlobalArgs {
    pub config_path: Option<PathBuf>,
    pub docker_path: String,
}

pub struct CommandContext {
    pub docker: CliRuntime,
    pub config: SailConfig,
    pub home: PathBuf,
    /// Path of the running `sail` binary, used to fork proxies
    pub self_exe: PathBuf,
}

impl CommandContext {
    pub fn load(globals: &GlobalArgs) -> Result<Self> {
        let config = SailConfig::load(globals.config_path.as_deref())?;
        let home = host::home_dir()?;
        let self_exe = std::env::current_exe().context("failed to locate the sail binary")?;
        debug!("Using config {:?}", config);
        Ok(Self {
            docker: CliRuntime::with_runtime_path(globals.docker_path.clone()),
            config,
            home,
            self_exe,
        })
    }

    /// Fail early with a readable message when the engine is unreachable.
    pub async fn require_engine(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .with_context(|| format!("{} is not available", self.docker.runtime_path()))
    }

    pub fn project(&self, repo: &str) -> Result<Project> {
        Ok(Project::new(Repo::parse(repo)?, &self.config, &self.home))
    }

    /// Host context with a code-server binary ready to mount.
    pub async fn run_context(&self) -> Result<RunContext> {
        let bin = codeserver::load(&host::cache_root()?)
            .await
            .context("failed to load code-server")?;
        Ok(RunContext::detect(bin)?)
    }

    pub fn locator(&self) -> Box<dyn PortLocator> {
        port::locator_for(HostCapabilities::detect())
    }

    /// Hat from the flag, else the configured default hat.
    pub fn resolve_hat(&self, flag: Option<&str>) -> Result<Option<String>> {
        match flag {
            Some(h) if hat::is_remote(h) => Ok(Some(h.to_string())),
            Some(h) => Ok(Some(absolute(&host::expand_tilde(h, &self.home))?)),
            None => Ok(self.config.default_hat(&self.home)),
        }
    }
}

fn absolute(path: &Path) -> Result<String> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(home: &Path) -> CommandContext {
        CommandContext {
            docker: CliRuntime::docker(),
            config: SailConfig::default(),
            home: home.to_path_buf(),
            self_exe: PathBuf::from("/usr/local/bin/sail"),
        }
    }

    #[test]
    fn test_resolve_hat_flag_forms() {
        let ctx = context(Path::new("/home/ammar"));
        assert_eq!(
            ctx.resolve_hat(Some("github:cdr/hats")).unwrap().as_deref(),
            Some("github:cdr/hats")
        );
        assert_eq!(
            ctx.resolve_hat(Some("~/hats/zsh")).unwrap().as_deref(),
            Some("/home/ammar/hats/zsh")
        );
        let relative = ctx.resolve_hat(Some("hats/zsh")).unwrap().unwrap();
        assert!(Path::new(&relative).is_absolute());
        assert!(relative.ends_with("hats/zsh"));
    }

    #[test]
    fn test_project_uses_config_root() {
        let ctx = context(Path::new("/home/ammar"));
        let project = ctx.project("cdr/sail").unwrap();
        assert!(project.local_dir().starts_with("/home/ammar"));
        assert_eq!(project.identity().container_name, "cdr_sail");
    }
}
