//! code-server provisioning and command line
//!
//! The editor binary is downloaded once from the latest GitHub release and
//! bind-mounted into every container at `/usr/bin/code-server`.

use crate::errors::{ProjectError, Result, SailError};
use crate::host::FIXED_GUEST_PORT;
use crate::retry::{default_classifier, retry_async, RetryConfig};
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

/// Use this binary instead of downloading one
pub const CODE_SERVER_BIN_ENV: &str = "SAIL_CODE_SERVER_BIN";

const LATEST_RELEASE_URL: &str = "https://api.github.com/repos/cdr/code-server/releases/latest";
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// Log file the editor output is teed to inside the container
pub const LOG_PATH: &str = "/tmp/code-server.log";

#[derive(Debug, Deserialize)]
struct Release {
    assets: Vec<Asset>,
}

#[derive(Debug, Clone, Deserialize)]
struct Asset {
    name: String,
    browser_download_url: String,
}

fn arch_markers() -> &'static [&'static str] {
    if cfg!(target_arch = "aarch64") {
        &["arm64", "aarch64"]
    } else {
        &["x86_64", "amd64"]
    }
}

/// Pick the linux tarball for this architecture
fn select_asset(assets: &[Asset]) -> Option<&Asset> {
    let linux_tarballs = || {
        assets
            .iter()
            .filter(|a| a.name.contains("linux") && a.name.ends_with(".tar.gz"))
    };
    linux_tarballs()
        .find(|a| arch_markers().iter().any(|m| a.name.contains(m)))
        .or_else(|| linux_tarballs().next())
}

/// Pull the `code-server` entry out of a gzipped tarball
pub fn extract_binary<R: Read>(tarball: R) -> Result<Vec<u8>> {
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(tarball));
    let entries = archive
        .entries()
        .map_err(|e| ProjectError::CodeServer(format!("failed to read archive: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| ProjectError::CodeServer(format!("corrupt archive: {}", e)))?;
        let is_binary = entry
            .path()
            .ok()
            .and_then(|p| p.file_name().map(|n| n == "code-server"))
            .unwrap_or(false);
        if is_binary && entry.header().entry_type().is_file() {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            return Ok(bytes);
        }
    }
    Err(ProjectError::CodeServer("code-server not found in archive".to_string()).into())
}

/// Cache path for `asset_name` under `cache_root`
pub fn cache_path(cache_root: &Path, asset_name: &str) -> PathBuf {
    cache_root
        .join("code-server")
        .join(asset_name)
        .join("code-server")
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(concat!("sail/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ProjectError::CodeServer(format!("failed to build HTTP client: {}", e)).into())
}

async fn latest_asset(client: &reqwest::Client) -> Result<Asset> {
    let release: Release = client
        .get(LATEST_RELEASE_URL)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| ProjectError::CodeServer(format!("failed to get latest release: {}", e)))?
        .json()
        .await
        .map_err(|e| ProjectError::CodeServer(format!("bad release metadata: {}", e)))?;
    select_asset(&release.assets)
        .cloned()
        .ok_or_else(|| ProjectError::CodeServer("no release found for platform".to_string()).into())
}

/// Path of a usable code-server binary, downloading it if needed.
#[instrument(skip(cache_root))]
pub async fn load(cache_root: &Path) -> Result<PathBuf> {
    if let Ok(bin) = std::env::var(CODE_SERVER_BIN_ENV) {
        if !bin.is_empty() {
            debug!("Using code-server from {}", CODE_SERVER_BIN_ENV);
            return Ok(PathBuf::from(bin));
        }
    }

    let started = Instant::now();
    let client = http_client()?;
    let asset = retry_async(
        &RetryConfig::default(),
        || latest_asset(&client),
        default_classifier,
    )
    .await?;

    let path = cache_path(cache_root, &asset.name);
    if path.exists() {
        debug!("code-server cached at {}", path.display());
        return Ok(path);
    }

    let tarball = retry_async(
        &RetryConfig::default(),
        || async {
            let response = client
                .get(&asset.browser_download_url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| {
                    ProjectError::CodeServer(format!(
                        "failed to get {}: {}",
                        asset.browser_download_url, e
                    ))
                })?;
            let bytes = response
                .bytes()
                .await
                .map_err(|e| ProjectError::CodeServer(e.to_string()))?;
            Ok::<_, SailError>(bytes)
        },
        default_classifier,
    )
    .await?;

    let target = path.clone();
    tokio::task::spawn_blocking(move || install(&tarball, &target))
        .await
        .map_err(|e| ProjectError::CodeServer(format!("install task failed: {}", e)))??;

    info!("Loaded code-server in {:?}", started.elapsed());
    Ok(path)
}

/// Extract into a temp file next to `target`, then move it into place.
fn install(tarball: &[u8], target: &Path) -> Result<()> {
    let dir = target
        .parent()
        .ok_or_else(|| ProjectError::CodeServer("invalid cache path".to_string()))?;
    std::fs::create_dir_all(dir)?;

    let binary = extract_binary(tarball)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, &binary)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o750))?;
    }
    tmp.persist(target)
        .map_err(|e| ProjectError::CodeServer(format!("failed to cache binary: {}", e.error)))?;
    Ok(())
}

/// Address code-server binds inside the container
pub fn bind_address(host_networking: bool, port: u16) -> (String, u16) {
    if host_networking {
        ("localhost".to_string(), port)
    } else {
        ("0.0.0.0".to_string(), FIXED_GUEST_PORT)
    }
}

/// Root process command for a sail container
pub fn command(project_dir: &str, host: &str, port: u16) -> Vec<String> {
    let script = format!(
        "set -euxo pipefail || exit 1\n\
         cd {dir}\n\
         sudo chown user:user ~/.vscode\n\
         /usr/bin/code-server --host {host} --port {port} \
         --user-data-dir ~/.config/Code \
         --extensions-dir ~/.vscode/host-extensions \
         --extra-extensions-dir ~/.vscode/extensions \
         --auth=none --allow-http 2>&1 | tee {log}",
        dir = shell_quote(project_dir),
        host = host,
        port = port,
        log = LOG_PATH,
    );
    vec!["bash".to_string(), "-c".to_string(), script]
}

fn shell_quote(value: &str) -> String {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/._-~".contains(c))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
