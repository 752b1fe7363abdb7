//! Repository references and the projects derived from them

use crate::config::SailConfig;
use crate::errors::{ProjectError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};

static REPO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<user>\w+@)?(?P<host>\S+:)?(?P<path>\S+)$").expect("valid repo regex")
});

const DEFAULT_USER: &str = "git";
const DEFAULT_HOST: &str = "github.com";

/// A git remote in `user@host:path` form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repo {
    pub user: String,
    pub host: String,
    pub path: String,
}

impl Repo {
    /// Parse `[user@][host:]path`. GitHub is assumed when no host is given.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| ProjectError::InvalidRepo {
            input: input.to_string(),
            reason: reason.to_string(),
        };
        let caps = REPO_RE
            .captures(input.trim())
            .ok_or_else(|| invalid("no path provided"))?;

        let capture = |name: &str| caps.name(name).map(|m| m.as_str()).unwrap_or_default();
        let user = capture("user").trim_end_matches('@');
        let host = capture("host").trim_end_matches(':');
        let mut path = capture("path").to_string();

        if path.is_empty() {
            return Err(invalid("no path provided").into());
        }

        let host = if host.is_empty() { DEFAULT_HOST } else { host };
        if host == DEFAULT_HOST {
            if !path.ends_with(".git") {
                path.push_str(".git");
            }
            if !path.contains('/') {
                return Err(invalid("GitHub repo path must have /").into());
            }
        }

        Ok(Self {
            user: if user.is_empty() { DEFAULT_USER } else { user }.to_string(),
            host: host.to_string(),
            path,
        })
    }

    pub fn clone_uri(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.path)
    }

    fn trimmed_path(&self) -> &str {
        self.path.strip_suffix(".git").unwrap_or(&self.path)
    }

    /// Container name: `codercom/bigdur` becomes `codercom_bigdur`
    pub fn docker_name(&self) -> String {
        self.trimmed_path().replace('/', "_")
    }

    /// Last path element without `.git`
    pub fn base_name(&self) -> String {
        self.trimmed_path()
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

impl fmt::Display for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.clone_uri())
    }
}

/// Names a project is known by on the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectIdentity {
    pub container_name: String,
    pub hostname: String,
    pub project_name: String,
}

/// A repository checked out under the configured project root
#[derive(Debug, Clone)]
pub struct Project {
    pub repo: Repo,
    project_root: PathBuf,
}

impl Project {
    pub fn new(repo: Repo, config: &SailConfig, home: &Path) -> Self {
        Self {
            repo,
            project_root: config.project_root(home),
        }
    }

    /// Host checkout directory
    pub fn local_dir(&self) -> PathBuf {
        self.project_root.join(self.repo.trimmed_path())
    }

    /// Optional project image definition
    pub fn dockerfile_path(&self) -> PathBuf {
        dockerfile_path(&self.local_dir())
    }

    pub fn identity(&self) -> ProjectIdentity {
        ProjectIdentity {
            container_name: self.repo.docker_name(),
            hostname: self.repo.base_name(),
            project_name: self.repo.base_name(),
        }
    }
}

/// `<local dir>/.sail/Dockerfile`
pub fn dockerfile_path(local_dir: &Path) -> PathBuf {
    local_dir.join(".sail").join("Dockerfile")
}
