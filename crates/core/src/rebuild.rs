//! Rebuild a live project container in place
//!
//! The container is reconstructed purely from its labels, so a rebuild can run
//! from a fresh process. New artifacts are built while the old container keeps
//! serving; only then is it stopped, renamed aside and replaced. Every swap
//! step that succeeds pushes its compensating action, and a failure unwinds
//! that stack in reverse.

use crate::docker::{self, BuildSpec, ContainerInfo, Docker};
use crate::errors::{RebuildError, Result, SailError};
use crate::hat::{HatBuilder, HatDescriptor};
use crate::labels::ContainerState;
use crate::port::{self, PortLocator};
use crate::project;
use crate::runner::{RunContext, RunOutcome, Runner};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

const TMP_SUFFIX_LEN: usize = 5;

/// Rebuild progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildState {
    Idle,
    Building,
    Swapping,
    Promoted,
    RolledBack,
}

impl RebuildState {
    pub fn can_transition(self, next: RebuildState) -> bool {
        use RebuildState::*;
        matches!(
            (self, next),
            (Idle, Building) | (Building, Swapping) | (Swapping, Promoted) | (Swapping, RolledBack)
        )
    }
}

impl fmt::Display for RebuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RebuildState::Idle => "idle",
            RebuildState::Building => "building",
            RebuildState::Swapping => "swapping",
            RebuildState::Promoted => "promoted",
            RebuildState::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}

/// Undo action for one completed swap step
#[derive(Debug, Clone, PartialEq, Eq)]
enum Compensation {
    Restart(String),
    RenameBack { from: String, to: String },
    RemoveReplacement(String),
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compensation::Restart(name) => write!(f, "restart {}", name),
            Compensation::RenameBack { from, to } => write!(f, "rename {} to {}", from, to),
            Compensation::RemoveReplacement(name) => write!(f, "remove replacement {}", name),
        }
    }
}

impl Compensation {
    async fn apply(&self, docker: &dyn Docker) -> Result<()> {
        match self {
            Compensation::Restart(name) => docker.start_container(name).await,
            Compensation::RenameBack { from, to } => docker.rename_container(from, to).await,
            Compensation::RemoveReplacement(name) => {
                if docker.inspect_container(name).await?.is_some() {
                    docker::stop_remove(docker, name).await?;
                }
                Ok(())
            }
        }
    }
}

/// Caller overrides
#[derive(Debug, Clone, Default)]
pub struct RebuildOptions {
    /// Record this proxy URL instead of the old container's
    pub proxy_url: Option<String>,
}

/// What a promoted rebuild produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub image: String,
    pub port: u16,
    pub outcome: RunOutcome,
}

/// `<name>-tmp-<5 lowercase alphanumerics>`
pub fn temp_name(name: &str) -> String {
    let suffix: String = std::iter::repeat_with(|| {
        let c = fastrand::alphanumeric();
        c.to_ascii_lowercase()
    })
    .take(TMP_SUFFIX_LEN)
    .collect();
    format!("{}-tmp-{}", name, suffix)
}

/// Drives one rebuild of one container
pub struct Rebuilder<'a> {
    docker: &'a dyn Docker,
    locator: &'a dyn PortLocator,
    ctx: &'a RunContext,
    state: RebuildState,
}

impl<'a> Rebuilder<'a> {
    pub fn new(docker: &'a dyn Docker, locator: &'a dyn PortLocator, ctx: &'a RunContext) -> Self {
        Self {
            docker,
            locator,
            ctx,
            state: RebuildState::Idle,
        }
    }

    pub fn state(&self) -> RebuildState {
        self.state
    }

    fn advance(&mut self, name: &str, next: RebuildState) {
        debug_assert!(
            self.state.can_transition(next),
            "invalid rebuild transition {} -> {}",
            self.state,
            next
        );
        info!(container = %name, "Rebuild {} -> {}", self.state, next);
        self.state = next;
    }

    /// Rebuild `name` from its labels and swap the replacement in.
    #[instrument(skip(self, options))]
    pub async fn rebuild(&mut self, name: &str, options: &RebuildOptions) -> Result<RebuildReport> {
        let existing = docker::require_container(self.docker, name).await?;
        let state = ContainerState::from_labels(name, &existing.labels)?;

        self.advance(name, RebuildState::Building);
        let (base_image, image) = self
            .build(name, &state)
            .await
            .map_err(|e| RebuildError::Build(Box::new(e)))?;

        let port = match self.locator.locate(self.docker, name).await {
            Ok(port) => port,
            Err(e) => {
                debug!("Old editor port unavailable ({}); choosing a new one", e);
                port::find_available_port()?
            }
        };

        let runner = Runner {
            container_name: existing.name.clone(),
            hostname: existing.hostname.clone(),
            port,
            proxy_url: options
                .proxy_url
                .clone()
                .unwrap_or_else(|| state.proxy_url.clone()),
            project_local_dir: state.project_local_dir.clone().into(),
            project_name: state.project_name.clone(),
            base_image,
            hat: state.hat.clone(),
        };

        self.advance(name, RebuildState::Swapping);
        let mut compensations = Vec::new();
        let tmp = temp_name(name);
        match self
            .swap(&existing, &tmp, &runner, &image, &mut compensations)
            .await
        {
            Ok(outcome) => {
                self.advance(name, RebuildState::Promoted);
                if let Err(e) = docker::stop_remove(self.docker, &tmp).await {
                    warn!("Failed to remove old container {}: {}", tmp, e);
                }
                Ok(RebuildReport {
                    image,
                    port,
                    outcome,
                })
            }
            Err(cause) => {
                warn!("Swap of {} failed: {}", name, cause);
                let result = self.rollback(compensations, cause).await;
                self.advance(name, RebuildState::RolledBack);
                Err(result.into())
            }
        }
    }

    /// Project image (when `.sail/Dockerfile` exists), then the hat.
    /// Returns the base image and the image to run.
    async fn build(&self, name: &str, state: &ContainerState) -> Result<(String, String)> {
        let local_dir = Path::new(&state.project_local_dir);
        let dockerfile = project::dockerfile_path(local_dir);

        let base_image = if dockerfile.is_file() {
            info!("Building project image {}", name);
            self.docker
                .build_image(&BuildSpec {
                    tag: name.to_string(),
                    dockerfile,
                    context: local_dir.to_path_buf(),
                    labels: Default::default(),
                    network_host: true,
                })
                .await?;
            name.to_string()
        } else {
            state.base_image.clone()
        };

        let image = HatBuilder::new(self.docker)
            .apply_optional(&HatDescriptor {
                base_image: base_image.clone(),
                hat: state.hat.clone(),
            })
            .await?;
        Ok((base_image, image))
    }

    async fn swap(
        &self,
        existing: &ContainerInfo,
        tmp: &str,
        runner: &Runner,
        image: &str,
        compensations: &mut Vec<Compensation>,
    ) -> Result<RunOutcome> {
        let name = existing.name.as_str();

        if existing.running {
            self.docker.stop_container(name, Some(1)).await?;
            compensations.push(Compensation::Restart(name.to_string()));
        }

        self.docker.rename_container(name, tmp).await?;
        compensations.push(Compensation::RenameBack {
            from: tmp.to_string(),
            to: name.to_string(),
        });

        compensations.push(Compensation::RemoveReplacement(name.to_string()));
        runner.run(self.docker, self.ctx, image).await
    }

    async fn rollback(&self, compensations: Vec<Compensation>, cause: SailError) -> RebuildError {
        for step in compensations.into_iter().rev() {
            debug!("Rollback: {}", step);
            if let Err(e) = step.apply(self.docker).await {
                return RebuildError::RollbackIncomplete {
                    cause: Box::new(cause),
                    step: step.to_string(),
                    reason: e.to_string(),
                };
            }
        }
        RebuildError::RolledBack {
            cause: Box::new(cause),
        }
    }
}
