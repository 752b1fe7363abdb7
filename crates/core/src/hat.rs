//! Hats: Dockerfile overlays applied on top of a base image
//!
//! A hat is a directory with a `Dockerfile`. Applying it rewrites the first
//! `FROM` line to the base image and builds the result under a tag derived
//! from the rewritten bytes, so re-applying an unchanged hat is a no-op.

use crate::docker::{BuildSpec, Docker};
use crate::errors::{HatError, Result};
use crate::git;
use crate::labels::{self, Labels};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, instrument};

const GITHUB_PREFIX: &str = "github:";

/// Records the base image id the hat was built on
pub const HAT_BASE_ID_LABEL: &str = "com.coder.sail.hat_base_id";

/// Base image plus optional hat reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HatDescriptor {
    pub base_image: String,
    /// Local directory or `github:<owner>/<repo>`
    pub hat: Option<String>,
}

impl HatDescriptor {
    /// Local hat directory, if the hat is not a remote reference
    pub fn local_dir(&self) -> Option<&Path> {
        self.hat
            .as_deref()
            .filter(|h| !is_remote(h))
            .map(Path::new)
    }
}

pub fn is_remote(reference: &str) -> bool {
    reference.starts_with(GITHUB_PREFIX)
}

/// Replace the first `FROM` line with `FROM <base>`. Lines are rejoined with
/// `\n` and the result trimmed.
pub fn replace_from(dockerfile: &str, base: &str) -> String {
    let mut replaced = false;
    let lines: Vec<String> = dockerfile
        .lines()
        .map(|line| {
            if !replaced && line.starts_with("FROM") {
                replaced = true;
                format!("FROM {}", base)
            } else {
                line.to_string()
            }
        })
        .collect();
    lines.join("\n").trim().to_string()
}

/// `<base>-hat-<first 16 hex chars of sha256(rewritten)>`
pub fn derived_tag(base: &str, rewritten: &str) -> String {
    let digest = Sha256::digest(rewritten.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}-hat-{}", base, &hex[..16])
}

/// A hat directory on disk; owns the clone for remote hats.
#[derive(Debug)]
struct ResolvedHat {
    dir: PathBuf,
    _clone: Option<TempDir>,
}

async fn resolve(reference: &str) -> Result<ResolvedHat> {
    if let Some(path) = reference.strip_prefix(GITHUB_PREFIX) {
        let path = path.trim_matches('/');
        if path.is_empty() || !path.contains('/') {
            return Err(HatError::InvalidReference {
                reference: reference.to_string(),
                reason: "expected github:<owner>/<repo>".to_string(),
            }
            .into());
        }
        let clone = tempfile::Builder::new().prefix("hat").tempdir()?;
        let uri = format!("git@github.com:{}.git", path);
        git::clone(&uri, clone.path()).await.map_err(|e| HatError::InvalidReference {
            reference: reference.to_string(),
            reason: e.to_string(),
        })?;
        return Ok(ResolvedHat {
            dir: clone.path().to_path_buf(),
            _clone: Some(clone),
        });
    }

    let dir = PathBuf::from(reference);
    if !dir.is_dir() {
        return Err(HatError::MissingDir {
            path: dir.display().to_string(),
        }
        .into());
    }
    Ok(ResolvedHat { dir, _clone: None })
}

/// Applies hats through the engine
pub struct HatBuilder<'a> {
    docker: &'a dyn Docker,
}

impl<'a> HatBuilder<'a> {
    pub fn new(docker: &'a dyn Docker) -> Self {
        Self { docker }
    }

    /// Build (or reuse) the hatted image and return its tag.
    #[instrument(skip(self))]
    pub async fn apply(&self, descriptor: &HatDescriptor) -> Result<String> {
        let reference = descriptor.hat.as_deref().ok_or(HatError::NotSpecified)?;
        let hat = resolve(reference).await?;

        let dockerfile_path = hat.dir.join("Dockerfile");
        let original = std::fs::read_to_string(&dockerfile_path).map_err(|_| {
            HatError::MissingDockerfile {
                path: dockerfile_path.display().to_string(),
            }
        })?;
        let rewritten = replace_from(&original, &descriptor.base_image);
        let tag = derived_tag(&descriptor.base_image, &rewritten);

        let base_id = self
            .docker
            .inspect_image(&descriptor.base_image)
            .await?
            .map(|image| image.id)
            .unwrap_or_default();

        if let Some(existing) = self.docker.inspect_image(&tag).await? {
            let built_on = existing.labels.get(HAT_BASE_ID_LABEL).cloned().unwrap_or_default();
            if built_on == base_id {
                debug!("Reusing hat image {}", tag);
                return Ok(tag);
            }
            debug!("Base image changed under {}; rebuilding", tag);
        }

        let mut tmp = tempfile::Builder::new().prefix("hat").tempfile()?;
        tmp.write_all(rewritten.as_bytes()).map_err(HatError::Io)?;
        tmp.flush().map_err(HatError::Io)?;

        let mut build_labels = Labels::new();
        build_labels.insert(labels::BASE_IMAGE.to_string(), descriptor.base_image.clone());
        build_labels.insert(labels::HAT.to_string(), reference.to_string());
        build_labels.insert(HAT_BASE_ID_LABEL.to_string(), base_id);

        info!("Building hat image {}", tag);
        self.docker
            .build_image(&BuildSpec {
                tag: tag.clone(),
                dockerfile: tmp.path().to_path_buf(),
                context: hat.dir.clone(),
                labels: build_labels,
                network_host: true,
            })
            .await
            .map_err(|e| HatError::Build {
                image: tag.clone(),
                message: e.to_string(),
            })?;

        Ok(tag)
    }

    /// Apply the hat when one is configured, else return the base image.
    pub async fn apply_optional(&self, descriptor: &HatDescriptor) -> Result<String> {
        match descriptor.hat {
            Some(_) => self.apply(descriptor).await,
            None => Ok(descriptor.base_image.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::mock::{MockDocker, MockOp};
    use crate::errors::SailError;

    fn hat_dir(contents: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), contents).unwrap();
        dir
    }

    #[test]
    fn test_replace_from_first_only() {
        assert_eq!(
            replace_from("FROM debian\nRUN echo hello", "ubuntu"),
            "FROM ubuntu\nRUN echo hello"
        );
        assert_eq!(
            replace_from("# hat\nFROM a AS build\nFROM b\n\n", "base"),
            "# hat\nFROM base\nFROM b"
        );
    }

    #[test]
    fn test_derived_tag_is_stable() {
        let a = derived_tag("img", "FROM img\nRUN x");
        assert_eq!(a, derived_tag("img", "FROM img\nRUN x"));
        assert_ne!(a, derived_tag("img", "FROM img\nRUN y"));
        let suffix = a.strip_prefix("img-hat-").unwrap();
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let docker = MockDocker::new();
        docker.add_image("base", Labels::new());
        let dir = hat_dir("FROM scratch\nRUN echo hi\n");
        let descriptor = HatDescriptor {
            base_image: "base".to_string(),
            hat: Some(dir.path().display().to_string()),
        };
        let builder = HatBuilder::new(&docker);
        let first = builder.apply(&descriptor).await.unwrap();
        let second = builder.apply(&descriptor).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(docker.build_count(), 1);
    }

    #[tokio::test]
    async fn test_apply_without_hat() {
        let docker = MockDocker::new();
        let descriptor = HatDescriptor {
            base_image: "base".to_string(),
            hat: None,
        };
        let err = HatBuilder::new(&docker).apply(&descriptor).await.unwrap_err();
        assert!(matches!(err, SailError::Hat(HatError::NotSpecified)));
        assert_eq!(
            HatBuilder::new(&docker)
                .apply_optional(&descriptor)
                .await
                .unwrap(),
            "base"
        );
    }

    #[tokio::test]
    async fn test_apply_missing_dir_and_dockerfile() {
        let docker = MockDocker::new();
        let builder = HatBuilder::new(&docker);
        let err = builder
            .apply(&HatDescriptor {
                base_image: "base".to_string(),
                hat: Some("/definitely/not/a/hat".to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SailError::Hat(HatError::MissingDir { .. })));

        let empty = TempDir::new().unwrap();
        let err = builder
            .apply(&HatDescriptor {
                base_image: "base".to_string(),
                hat: Some(empty.path().display().to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SailError::Hat(HatError::MissingDockerfile { .. })
        ));
    }

    #[tokio::test]
    async fn test_build_failure_is_reported() {
        let docker = MockDocker::new();
        docker.fail(MockOp::Build, 1);
        let dir = hat_dir("FROM x\nRUN false\n");
        let err = HatBuilder::new(&docker)
            .apply(&HatDescriptor {
                base_image: "base".to_string(),
                hat: Some(dir.path().display().to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SailError::Hat(HatError::Build { .. })));
        assert!(docker.image_tags().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_remote_reference() {
        let docker = MockDocker::new();
        let err = HatBuilder::new(&docker)
            .apply(&HatDescriptor {
                base_image: "base".to_string(),
                hat: Some("github:nope".to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SailError::Hat(HatError::InvalidReference { .. })
        ));
    }
}
