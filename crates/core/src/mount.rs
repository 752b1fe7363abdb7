//! Mount assembly
//!
//! The final mount set for a container is built in three steps: the mounts
//! sail always declares, then the shares the image asks for, then `~`
//! resolution and deduplication by target. Missing host sources are created
//! so the engine never invents root-owned directories.

use crate::errors::{MountError, Result};
use crate::host::{self, HostCapabilities, HostEnv, GUEST_HOME};
use crate::labels::Share;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Guest path the editor binary is mounted at
pub const CODE_SERVER_GUEST_PATH: &str = "/usr/bin/code-server";
/// Guest path host extensions are mounted at
pub const HOST_EXTENSIONS_DIR: &str = "~/.vscode/host-extensions";

const X11_SOCKET_DIR: &str = "/tmp/.X11-unix";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Bind,
    Volume,
}

impl fmt::Display for MountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountKind::Bind => write!(f, "bind"),
            MountKind::Volume => write!(f, "volume"),
        }
    }
}

/// A single mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub kind: MountKind,
    pub source: String,
    pub target: String,
}

impl MountSpec {
    pub fn new(kind: MountKind, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            target: target.into(),
        }
    }

    pub fn bind(source: impl AsRef<Path>, target: impl Into<String>) -> Self {
        Self::new(
            MountKind::Bind,
            source.as_ref().display().to_string(),
            target,
        )
    }

    /// Value for `docker create --mount`
    pub fn to_mount_arg(&self) -> String {
        format!(
            "type={},source={},target={}",
            self.kind, self.source, self.target
        )
    }
}

/// Everything needed to compute the mounts sail always adds
#[derive(Debug, Clone)]
pub struct MountContext<'a> {
    pub host: &'a HostEnv,
    pub capabilities: HostCapabilities,
    pub meta_root: &'a Path,
    pub container_name: &'a str,
    /// Local hat directory; remote hats are not mounted.
    pub hat_dir: Option<&'a Path>,
    pub project_local_dir: &'a Path,
    pub project_dir: &'a str,
    pub code_server_bin: &'a Path,
}

/// `<meta root>/<container>/globalStorage`
pub fn global_storage_dir(meta_root: &Path, container_name: &str) -> PathBuf {
    host::container_meta_dir(meta_root, container_name).join("globalStorage")
}

/// Mounts sail declares for every container, in order. Creates the
/// per-container globalStorage directory.
#[instrument(skip(ctx), fields(container = ctx.container_name))]
pub fn declared_mounts(ctx: &MountContext<'_>) -> Result<Vec<MountSpec>> {
    let mut mounts = Vec::new();

    if let Some(hat) = ctx.hat_dir {
        mounts.push(MountSpec::bind(hat, "~/.hat"));
    }
    mounts.push(MountSpec::bind(ctx.host.vscode_config_dir(), "~/.config/Code"));
    mounts.push(MountSpec::bind(
        ctx.host.vscode_extensions_dir(),
        HOST_EXTENSIONS_DIR,
    ));

    if ctx.capabilities.display_forwarding && ctx.host.display.is_some() {
        mounts.push(MountSpec::bind(X11_SOCKET_DIR, X11_SOCKET_DIR));
        if let Some(xauthority) = &ctx.host.xauthority {
            mounts.push(MountSpec::bind(xauthority, "~/.Xauthority"));
        }
    }

    if let Some(sock) = &ctx.host.ssh_auth_sock {
        mounts.push(MountSpec::bind(sock, sock.clone()));
    }

    let storage = global_storage_dir(ctx.meta_root, ctx.container_name);
    create_dir(&storage, 0o750)?;
    mounts.push(MountSpec::bind(
        &storage,
        "~/.local/share/code-server/globalStorage/",
    ));

    mounts.push(MountSpec::bind(ctx.project_local_dir, ctx.project_dir));
    mounts.push(MountSpec::bind(ctx.code_server_bin, CODE_SERVER_GUEST_PATH));

    Ok(mounts)
}

/// Append image shares after `explicit`, resolve `~` on both sides and keep
/// the first mount for each resolved target.
pub fn assemble(explicit: Vec<MountSpec>, shares: &[Share], host_home: &Path) -> Result<Vec<MountSpec>> {
    let mut mounts = explicit;
    mounts.extend(
        shares
            .iter()
            .map(|s| MountSpec::new(MountKind::Bind, s.source.clone(), s.target.clone())),
    );

    let mut resolved = Vec::with_capacity(mounts.len());
    for mount in mounts {
        resolved.push(resolve(mount, host_home)?);
    }
    Ok(dedup_by_target(resolved))
}

fn resolve(mount: MountSpec, host_home: &Path) -> Result<MountSpec> {
    let source = match mount.kind {
        MountKind::Bind => absolute(&host::expand_tilde(&mount.source, host_home))?
            .display()
            .to_string(),
        MountKind::Volume => mount.source,
    };
    let target = host::expand_tilde(&mount.target, Path::new(GUEST_HOME))
        .display()
        .to_string();
    Ok(MountSpec {
        kind: mount.kind,
        source,
        target,
    })
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| MountError::Resolve {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(cwd.join(path))
}

/// Keep the first mount for each target, preserving order
pub fn dedup_by_target(mounts: Vec<MountSpec>) -> Vec<MountSpec> {
    let mut seen = HashSet::new();
    mounts
        .into_iter()
        .filter(|m| {
            let target = m.target.trim_end_matches('/').to_string();
            if seen.insert(target) {
                true
            } else {
                debug!("Dropping duplicate mount for {}", m.target);
                false
            }
        })
        .collect()
}

/// Create missing bind sources as directories
pub fn ensure_sources(mounts: &[MountSpec]) -> Result<()> {
    for mount in mounts.iter().filter(|m| m.kind == MountKind::Bind) {
        let source = Path::new(&mount.source);
        match source.try_exists() {
            Ok(true) => continue,
            Ok(false) => create_dir(source, 0o755)?,
            Err(e) => {
                return Err(MountError::CreateSource {
                    path: mount.source.clone(),
                    source: e,
                }
                .into())
            }
        }
    }
    Ok(())
}

fn create_dir(path: &Path, mode: u32) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(path).map_err(|e| {
        MountError::CreateSource {
            path: path.display().to_string(),
            source: e,
        }
        .into()
    })
}
