//! User configuration
//!
//! A small TOML file providing the default base image, the default hat and the
//! directory projects are cloned into. When the file is missing a commented
//! default is written and then loaded, so first runs need no setup.

use crate::errors::{ConfigError, Result};
use crate::host;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "SAIL_CONFIG";

/// Base image used when neither the project nor the command line picks one
pub const DEFAULT_IMAGE: &str = "codercom/ubuntu-dev";

const DEFAULT_CONFIG: &str = r#"# sail configuration

# default_image is the base image used for projects that do not ship a
# .sail/Dockerfile of their own.
default_image = "codercom/ubuntu-dev"

# default_hat is a local directory or github:<owner>/<repo> reference whose
# Dockerfile is layered over every project image. Leave empty for none.
default_hat = ""

# project_root is where repositories are cloned to.
project_root = "~/Projects"
"#;

/// Parsed configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SailConfig {
    pub default_image: String,
    pub default_hat: String,
    pub project_root: String,
}

impl Default for SailConfig {
    fn default() -> Self {
        Self {
            default_image: DEFAULT_IMAGE.to_string(),
            default_hat: String::new(),
            project_root: "~/Projects".to_string(),
        }
    }
}

impl SailConfig {
    /// Parse configuration from TOML text
    pub fn from_toml(text: &str, path: &Path) -> Result<Self> {
        toml::from_str(text).map_err(|e| {
            ConfigError::Parsing {
                path: path.display().to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Load from `path`, writing the default file first if it does not exist.
    #[instrument]
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
            }
            std::fs::write(path, DEFAULT_CONFIG).map_err(ConfigError::Io)?;
            info!("Wrote default configuration to {}", path.display());
        }
        let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config = Self::from_toml(&text, path)?;
        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    /// Load using the usual precedence: explicit path, `SAIL_CONFIG`, then
    /// `<config dir>/sail/sail.toml`.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = resolve_path(explicit, std::env::var(CONFIG_ENV).ok().as_deref())?;
        Self::load_or_create(&path)
    }

    /// `project_root` with `~` expanded
    pub fn project_root(&self, home: &Path) -> PathBuf {
        host::expand_tilde(&self.project_root, home)
    }

    /// `default_hat` with `~` expanded; `None` when unset. Remote references
    /// are passed through untouched.
    pub fn default_hat(&self, home: &Path) -> Option<String> {
        let hat = self.default_hat.trim();
        if hat.is_empty() {
            None
        } else if hat.starts_with("github:") {
            Some(hat.to_string())
        } else {
            Some(host::expand_tilde(hat, home).display().to_string())
        }
    }
}

fn resolve_path(explicit: Option<&Path>, env_value: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(value) = env_value.filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(value));
    }
    Ok(host::meta_root()?.join("sail.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_file_round_trips_to_defaults() {
        let parsed = SailConfig::from_toml(DEFAULT_CONFIG, Path::new("sail.toml")).unwrap();
        assert_eq!(parsed, SailConfig::default());
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("sail.toml");
        let config = SailConfig::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.default_image, DEFAULT_IMAGE);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = SailConfig::from_toml(
            "default_hat = \"~/hats/go\"\n",
            Path::new("sail.toml"),
        )
        .unwrap();
        assert_eq!(config.default_image, DEFAULT_IMAGE);
        assert_eq!(
            config.default_hat(Path::new("/home/u")),
            Some("/home/u/hats/go".to_string())
        );
    }

    #[test]
    fn test_parse_error_names_path() {
        let err = SailConfig::from_toml("default_image = [", Path::new("/tmp/bad.toml"))
            .unwrap_err();
        assert!(err.to_string().contains("/tmp/bad.toml"));
    }

    #[test]
    fn test_hat_and_root_expansion() {
        let config = SailConfig {
            default_hat: "github:cdr/hats".to_string(),
            ..SailConfig::default()
        };
        let home = Path::new("/home/u");
        assert_eq!(config.default_hat(home), Some("github:cdr/hats".to_string()));
        assert_eq!(config.project_root(home), PathBuf::from("/home/u/Projects"));
        assert_eq!(SailConfig::default().default_hat(home), None);
    }

    #[test]
    fn test_resolve_path_precedence() {
        let explicit = Path::new("/etc/sail.toml");
        assert_eq!(
            resolve_path(Some(explicit), Some("/env.toml")).unwrap(),
            PathBuf::from("/etc/sail.toml")
        );
        assert_eq!(
            resolve_path(None, Some("/env.toml")).unwrap(),
            PathBuf::from("/env.toml")
        );
    }
}
