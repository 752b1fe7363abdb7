//! Starting a detached proxy process

use crate::errors::{ProxyError, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, instrument};

const URL_TIMEOUT: Duration = Duration::from_secs(10);

/// Start `<exe> proxy <container>` in its own process group and return the
/// URL it prints. The proxy's stderr goes to a `sailproxy_<container>*`
/// temp file.
#[instrument(skip(exe))]
pub async fn fork_proxy(exe: &Path, container: &str, watch: bool) -> Result<String> {
    let log = tempfile::Builder::new()
        .prefix(&format!("sailproxy_{}", container))
        .tempfile()?;
    let (log_file, log_path) = log.keep().map_err(|e| e.error)?;

    let mut cmd = Command::new(exe);
    cmd.arg("proxy").arg(container);
    if watch {
        cmd.arg("--watch");
    }
    #[cfg(unix)]
    cmd.process_group(0);
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::from(log_file))
        .spawn()?;
    debug!("Proxy for {} logs to {}", container, log_path.display());

    let stdout = child.stdout.take().ok_or_else(|| ProxyError::Terminated {
        reason: "proxy stdout unavailable".to_string(),
    })?;
    let mut lines = BufReader::new(stdout).lines();
    let line = tokio::time::timeout(URL_TIMEOUT, lines.next_line())
        .await
        .map_err(|_| ProxyError::Terminated {
            reason: format!(
                "proxy did not report its url; see {}",
                log_path.display()
            ),
        })??;

    match line.as_deref().map(str::trim) {
        Some(url) if url::Url::parse(url).is_ok_and(|u| u.scheme() == "http") => {
            Ok(url.to_string())
        }
        _ => Err(ProxyError::Terminated {
            reason: format!("proxy exited early; see {}", log_path.display()),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-sail");
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reads_first_line() {
        let dir = tempfile::TempDir::new().unwrap();
        let exe = script(
            dir.path(),
            "#!/bin/sh\n[ \"$1\" = proxy ] || exit 1\necho http://127.0.0.1:9123\n",
        );
        let url = fork_proxy(&exe, "cdr_sail", false).await.unwrap();
        assert_eq!(url, "http://127.0.0.1:9123");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stray_output_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let exe = script(dir.path(), "#!/bin/sh\necho 'Error: no such container'\n");
        assert!(fork_proxy(&exe, "cdr_sail", false).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let exe = script(dir.path(), "#!/bin/sh\necho oops >&2\nexit 1\n");
        assert!(fork_proxy(&exe, "cdr_sail", false).await.is_err());
    }
}
