//! Host capabilities and well-known paths
//!
//! Everything that depends on which OS sail runs on lives here, so callers
//! pick behaviour from one value instead of sprinkling `cfg!` checks.

use crate::errors::{ConfigError, Result};
use std::path::{Path, PathBuf};

/// Home directory of the `user` account inside sail images
pub const GUEST_HOME: &str = "/home/user";

/// Port code-server binds inside the container when host networking is off
pub const FIXED_GUEST_PORT: u16 = 8443;

/// How the editor port is reached and discovered on this host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStrategy {
    /// Container shares the host network; the editor binds a dynamic port that
    /// is discovered through `/proc` inside the container.
    HostNetworkProcfs,
    /// The editor binds [`FIXED_GUEST_PORT`] and the engine publishes it on a
    /// chosen loopback port.
    PublishedMapping,
}

/// What the current host supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    pub port_strategy: PortStrategy,
    /// X11 forwarding via `/tmp/.X11-unix`
    pub display_forwarding: bool,
}

impl HostCapabilities {
    pub fn detect() -> Self {
        if cfg!(target_os = "linux") {
            Self::linux()
        } else {
            Self::published()
        }
    }

    pub fn linux() -> Self {
        Self {
            port_strategy: PortStrategy::HostNetworkProcfs,
            display_forwarding: true,
        }
    }

    pub fn published() -> Self {
        Self {
            port_strategy: PortStrategy::PublishedMapping,
            display_forwarding: false,
        }
    }

    pub fn host_networking(&self) -> bool {
        self.port_strategy == PortStrategy::HostNetworkProcfs
    }
}

/// Snapshot of the host environment consulted while assembling a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEnv {
    pub home: PathBuf,
    pub ssh_auth_sock: Option<String>,
    pub display: Option<String>,
    pub xauthority: Option<String>,
    pub vscode_config_dir: Option<String>,
    pub vscode_extensions_dir: Option<String>,
    pub macos: bool,
}

impl HostEnv {
    /// Capture the current process environment
    pub fn capture() -> Result<Self> {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        Ok(Self {
            home: home_dir()?,
            ssh_auth_sock: var("SSH_AUTH_SOCK"),
            display: var("DISPLAY"),
            xauthority: var("XAUTHORITY"),
            vscode_config_dir: var("VSCODE_CONFIG_DIR"),
            vscode_extensions_dir: var("VSCODE_EXTENSIONS_DIR"),
            macos: cfg!(target_os = "macos"),
        })
    }

    /// Host VS Code user data directory
    pub fn vscode_config_dir(&self) -> PathBuf {
        if let Some(dir) = &self.vscode_config_dir {
            return PathBuf::from(dir);
        }
        if self.macos {
            self.home.join("Library/Application Support/Code")
        } else {
            self.home.join(".config/Code")
        }
    }

    /// Host VS Code extensions directory
    pub fn vscode_extensions_dir(&self) -> PathBuf {
        match &self.vscode_extensions_dir {
            Some(dir) => PathBuf::from(dir),
            None => self.home.join(".vscode/extensions"),
        }
    }

    /// Resolve a leading `~` against the host home
    pub fn expand(&self, path: &str) -> PathBuf {
        expand_tilde(path, &self.home)
    }
}

/// Replace a leading `~` (alone or followed by `/`) with `home`.
pub fn expand_tilde(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        return home.to_path_buf();
    }
    match path.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(path),
    }
}

/// Host home directory
pub fn home_dir() -> Result<PathBuf> {
    directories_next::BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .ok_or_else(|| {
            ConfigError::NotFound {
                reason: "could not determine home directory".to_string(),
            }
            .into()
        })
}

/// `<config dir>/sail`: config file and per-container metadata
pub fn meta_root() -> Result<PathBuf> {
    directories_next::BaseDirs::new()
        .map(|dirs| dirs.config_dir().join("sail"))
        .ok_or_else(|| {
            ConfigError::NotFound {
                reason: "could not determine config directory".to_string(),
            }
            .into()
        })
}

/// `<cache dir>/sail`: downloaded editor binaries
pub fn cache_root() -> Result<PathBuf> {
    directories_next::BaseDirs::new()
        .map(|dirs| dirs.cache_dir().join("sail"))
        .ok_or_else(|| {
            ConfigError::NotFound {
                reason: "could not determine cache directory".to_string(),
            }
            .into()
        })
}

/// Per-container metadata directory under [`meta_root`]
pub fn container_meta_dir(meta_root: &Path, container_name: &str) -> PathBuf {
    meta_root.join(container_name)
}
