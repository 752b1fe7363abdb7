//! Shell command implementation

use crate::commands::shared::{CommandContext, GlobalArgs};
use anyhow::Result;
use sail_core::docker::{self, Docker};
use sail_core::host::GUEST_HOME;
use tracing::{debug, instrument};

const DEFAULT_SHELL: &str = "/bin/bash";
const LOGIN_SHELL_LOOKUP: &str = "grep ^.*:.*:$(id -u): /etc/passwd | cut -d : -f 7-";

/// Shell command arguments
#[derive(Debug, Clone)]
pub struct ShellArgs {
    pub repo: String,
    pub globals: GlobalArgs,
}

/// Non-zero exit status of the interactive shell
#[derive(Debug)]
pub struct ShellExit(pub i32);

impl std::fmt::Display for ShellExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shell exited with code {}", self.0)
    }
}

impl std::error::Error for ShellExit {}

/// Login shell of the container's default user, else `/bin/bash`.
pub async fn login_shell(docker: &dyn Docker, container: &str) -> Result<String> {
    let cmd = vec![
        "/bin/bash".to_string(),
        "-c".to_string(),
        LOGIN_SHELL_LOOKUP.to_string(),
    ];
    let result = docker.exec(container, &cmd).await?;
    let shell = result.stdout.lines().next().unwrap_or_default().trim();
    if !result.success() || shell.is_empty() {
        debug!("No login shell found in {}; using {}", container, DEFAULT_SHELL);
        return Ok(DEFAULT_SHELL.to_string());
    }
    Ok(shell.to_string())
}

/// Execute the shell command
#[instrument(skip(args), fields(repo = %args.repo))]
pub async fn execute_shell(args: ShellArgs) -> Result<()> {
    let ctx = CommandContext::load(&args.globals)?;
    ctx.require_engine().await?;

    let name = ctx.project(&args.repo)?.identity().container_name;
    let info = docker::require_container(&ctx.docker, &name).await?;
    if !info.running {
        anyhow::bail!("{} is not running; use `sail open {}`", name, args.repo);
    }

    let shell = login_shell(&ctx.docker, &name).await?;
    let code = ctx
        .docker
        .exec_interactive(&name, GUEST_HOME, &[shell])
        .await?;
    if code != 0 {
        return Err(ShellExit(code).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sail_core::docker::mock::{MockContainer, MockDocker};
    use sail_core::docker::ExecResult;

    fn lookup_key() -> String {
        format!("/bin/bash -c {}", LOGIN_SHELL_LOOKUP)
    }

    #[tokio::test]
    async fn test_login_shell_from_passwd() {
        let docker = MockDocker::new();
        docker.add_container(MockContainer::new("cdr_sail", "img"));
        docker.set_exec_response(
            &lookup_key(),
            ExecResult {
                exit_code: 0,
                stdout: "/usr/bin/zsh\n".to_string(),
                stderr: String::new(),
            },
        );
        assert_eq!(login_shell(&docker, "cdr_sail").await.unwrap(), "/usr/bin/zsh");
    }

    #[tokio::test]
    async fn test_login_shell_fallback() {
        let docker = MockDocker::new();
        docker.add_container(MockContainer::new("cdr_sail", "img"));
        docker.set_exec_response(
            &lookup_key(),
            ExecResult {
                exit_code: 1,
                stdout: String::new(),
                stderr: String::new(),
            },
        );
        assert_eq!(login_shell(&docker, "cdr_sail").await.unwrap(), "/bin/bash");
    }
}
