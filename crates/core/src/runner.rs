//! Container runner
//!
//! Turns an image plus a project identity into a started container whose
//! labels carry everything needed to rebuild it later.

use crate::codeserver;
use crate::docker::{ContainerSpec, Docker};
use crate::errors::{DockerError, Result};
use crate::hat;
use crate::host::{HostCapabilities, HostEnv, FIXED_GUEST_PORT, GUEST_HOME};
use crate::labels::{ContainerState, ImageLabels};
use crate::mount::{self, MountContext};
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};

/// Host-side inputs shared by every container sail creates
#[derive(Debug, Clone)]
pub struct RunContext {
    pub host: HostEnv,
    pub capabilities: HostCapabilities,
    pub meta_root: PathBuf,
    pub code_server_bin: PathBuf,
}

impl RunContext {
    /// Context for the current host
    pub fn detect(code_server_bin: PathBuf) -> Result<Self> {
        Ok(Self {
            host: HostEnv::capture()?,
            capabilities: HostCapabilities::detect(),
            meta_root: crate::host::meta_root()?,
            code_server_bin,
        })
    }
}

/// Everything that identifies one project container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Runner {
    pub container_name: String,
    pub hostname: String,
    /// Editor port: bound directly with host networking, published otherwise
    pub port: u16,
    pub proxy_url: String,
    pub project_local_dir: PathBuf,
    pub project_name: String,
    pub base_image: String,
    pub hat: Option<String>,
}

/// Result of a successful start
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub project_dir: String,
    /// `on_start` hook failure; the container is still running.
    pub on_start_error: Option<String>,
}

/// Guest project directory for an image
pub fn project_dir(image_labels: &ImageLabels<'_>, project_name: &str) -> String {
    let root = image_labels.project_root().unwrap_or(GUEST_HOME);
    format!("{}/{}", root.trim_end_matches('/'), project_name)
}

impl Runner {
    /// Label state this runner writes; [`ContainerState::from_labels`]
    /// returns it unchanged.
    pub fn state(&self, project_dir: &str) -> ContainerState {
        ContainerState {
            base_image: self.base_image.clone(),
            hat: self.hat.clone(),
            project_local_dir: self.project_local_dir.display().to_string(),
            project_dir: project_dir.to_string(),
            project_name: self.project_name.clone(),
            proxy_url: self.proxy_url.clone(),
        }
    }

    fn env(&self, ctx: &RunContext) -> Vec<String> {
        let mut env = Vec::new();
        if let Some(sock) = &ctx.host.ssh_auth_sock {
            env.push(format!("SSH_AUTH_SOCK={}", sock));
        }
        if ctx.capabilities.display_forwarding {
            if let Some(display) = &ctx.host.display {
                env.push(format!("DISPLAY={}", display));
                env.push(format!("XAUTHORITY={}/.Xauthority", GUEST_HOME));
            }
        }
        env
    }

    /// Build the create spec for `image` and the mounts it needs.
    pub fn spec(&self, ctx: &RunContext, image: &str, image_labels: &ImageLabels<'_>) -> Result<ContainerSpec> {
        let project_dir = project_dir(image_labels, &self.project_name);
        let descriptor = hat::HatDescriptor {
            base_image: self.base_image.clone(),
            hat: self.hat.clone(),
        };

        let declared = mount::declared_mounts(&MountContext {
            host: &ctx.host,
            capabilities: ctx.capabilities,
            meta_root: &ctx.meta_root,
            container_name: &self.container_name,
            hat_dir: descriptor.local_dir(),
            project_local_dir: &self.project_local_dir,
            project_dir: &project_dir,
            code_server_bin: &ctx.code_server_bin,
        })?;
        let mounts = mount::assemble(declared, &image_labels.shares()?, &ctx.host.home)?;

        let host_networking = ctx.capabilities.host_networking();
        let (bind_host, bind_port) = codeserver::bind_address(host_networking, self.port);

        let mut labels = image_labels.passthrough();
        labels.extend(self.state(&project_dir).to_labels());

        let publish = if host_networking {
            Vec::new()
        } else {
            vec![format!("127.0.0.1:{}:{}/tcp", self.port, FIXED_GUEST_PORT)]
        };

        Ok(ContainerSpec {
            name: self.container_name.clone(),
            image: image.to_string(),
            hostname: self.hostname.clone(),
            cmd: codeserver::command(&project_dir, &bind_host, bind_port),
            env: self.env(ctx),
            labels,
            mounts,
            network_host: host_networking,
            privileged: true,
            extra_hosts: vec![format!("{}:127.0.0.1", self.hostname)],
            publish,
            user: None,
        })
    }

    /// Create and start the container from `image`, then fire the image's
    /// `on_start` hook.
    #[instrument(skip(self, docker, ctx), fields(container = %self.container_name))]
    pub async fn run(&self, docker: &dyn Docker, ctx: &RunContext, image: &str) -> Result<RunOutcome> {
        let image_info = docker
            .inspect_image(image)
            .await?
            .ok_or_else(|| DockerError::ImageNotFound {
                image: image.to_string(),
            })?;
        let image_labels = ImageLabels::new(&image_info.labels);

        let spec = self.spec(ctx, image, &image_labels)?;
        mount::ensure_sources(&spec.mounts)?;
        debug!("Creating {} from {}", spec.name, image);
        docker.create_container(&spec).await?;
        docker.start_container(&self.container_name).await?;
        info!("Started {}", self.container_name);

        let project_dir = project_dir(&image_labels, &self.project_name);
        let on_start_error = match image_labels.on_start() {
            Some(cmd) => run_on_start(docker, &self.container_name, &project_dir, cmd).await,
            None => None,
        };

        Ok(RunOutcome {
            project_dir,
            on_start_error,
        })
    }
}

async fn run_on_start(docker: &dyn Docker, container: &str, workdir: &str, cmd: &str) -> Option<String> {
    let argv = vec!["/bin/bash".to_string(), "-c".to_string(), cmd.to_string()];
    match docker.exec_detached(container, workdir, &argv).await {
        Ok(()) => None,
        Err(e) => {
            warn!("on_start hook failed in {}: {}", container, e);
            Some(e.to_string())
        }
    }
}
