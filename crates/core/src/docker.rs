//! Container engine access
//!
//! [`Docker`] is the narrow surface sail needs from the engine. [`CliRuntime`]
//! drives the `docker` CLI with a timeout on every call; [`mock::MockDocker`]
//! is an in-memory engine for tests.

use crate::errors::{DockerError, Result};
use crate::labels::Labels;
use crate::mount::MountSpec;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Create/start are bounded; on expiry the operation failed.
pub const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Inspect/list/rename/remove
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
/// Commands executed inside a container
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Container information returned by inspect/list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    /// Image reference the container was created from
    pub image: String,
    pub hostname: String,
    /// Engine state string (`running`, `exited`, `created`, ...)
    pub state: String,
    pub running: bool,
    /// Empty for list results; inspect to read them.
    pub labels: Labels,
    pub port_mappings: Vec<PortMapping>,
}

/// Image information returned by inspect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: String,
    pub labels: Labels,
}

/// A published port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
    pub host_ip: String,
}

/// `docker build` invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub tag: String,
    pub dockerfile: PathBuf,
    pub context: PathBuf,
    pub labels: Labels,
    pub network_host: bool,
}

/// `docker create` invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: String,
    pub cmd: Vec<String>,
    /// `KEY=value` entries
    pub env: Vec<String>,
    pub labels: Labels,
    pub mounts: Vec<MountSpec>,
    pub network_host: bool,
    pub privileged: bool,
    /// `host:ip` entries
    pub extra_hosts: Vec<String>,
    /// `ip:hostPort:containerPort/proto` entries
    pub publish: Vec<String>,
    pub user: Option<String>,
}

impl ContainerSpec {
    /// Arguments for `docker create`, image and command last
    pub fn create_args(&self) -> Vec<String> {
        let mut args = vec!["create".to_string(), "--name".to_string(), self.name.clone()];
        if !self.hostname.is_empty() {
            args.push("--hostname".to_string());
            args.push(self.hostname.clone());
        }
        if self.network_host {
            args.push("--network=host".to_string());
        }
        if self.privileged {
            args.push("--privileged".to_string());
        }
        if let Some(user) = &self.user {
            args.push("--user".to_string());
            args.push(user.clone());
        }
        for host in &self.extra_hosts {
            args.push("--add-host".to_string());
            args.push(host.clone());
        }
        for publish in &self.publish {
            args.push("--publish".to_string());
            args.push(publish.clone());
        }
        for env in &self.env {
            args.push("--env".to_string());
            args.push(env.clone());
        }
        let mut labels: Vec<_> = self.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        for mount in &self.mounts {
            args.push("--mount".to_string());
            args.push(mount.to_mount_arg());
        }
        args.push(self.image.clone());
        args.extend(self.cmd.iter().cloned());
        args
    }
}

/// Result of a command executed in a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`DockerError::ExecFailed`]
    pub fn into_success(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(DockerError::ExecFailed {
                code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            }
            .into())
        }
    }
}

/// Engine operations used by sail
#[async_trait]
pub trait Docker: Send + Sync {
    /// Check that the engine is reachable
    async fn ping(&self) -> Result<()>;

    /// List containers, optionally filtered by a `key[=value]` label
    async fn list_containers(&self, label: Option<&str>, all: bool)
        -> Result<Vec<ContainerInfo>>;

    /// `Ok(None)` when no such container exists
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>>;

    /// `Ok(None)` when no such image exists
    async fn inspect_image(&self, image: &str) -> Result<Option<ImageInfo>>;

    async fn build_image(&self, spec: &BuildSpec) -> Result<()>;

    /// Returns the new container id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, name: &str) -> Result<()>;

    async fn stop_container(&self, name: &str, timeout: Option<u32>) -> Result<()>;

    async fn remove_container(&self, name: &str) -> Result<()>;

    async fn rename_container(&self, from: &str, to: &str) -> Result<()>;

    /// Run a command and collect its output; a non-zero exit is not an error here.
    async fn exec(&self, name: &str, cmd: &[String]) -> Result<ExecResult>;

    /// Run a command in the background in `workdir`
    async fn exec_detached(&self, name: &str, workdir: &str, cmd: &[String]) -> Result<()>;
}

/// Stop with a one second grace period, then remove
pub async fn stop_remove(docker: &dyn Docker, name: &str) -> Result<()> {
    docker.stop_container(name, Some(1)).await?;
    docker.remove_container(name).await
}

/// Inspect, turning absence into [`DockerError::ContainerNotFound`]
pub async fn require_container(docker: &dyn Docker, name: &str) -> Result<ContainerInfo> {
    docker.inspect_container(name).await?.ok_or_else(|| {
        DockerError::ContainerNotFound {
            name: name.to_string(),
        }
        .into()
    })
}

/// Docker implementation over the engine CLI
#[derive(Debug, Clone)]
pub struct CliRuntime {
    runtime_path: String,
}

impl CliRuntime {
    pub fn docker() -> Self {
        Self {
            runtime_path: "docker".to_string(),
        }
    }

    /// Use a specific engine binary
    pub fn with_runtime_path(runtime_path: String) -> Self {
        Self { runtime_path }
    }

    pub fn runtime_path(&self) -> &str {
        &self.runtime_path
    }

    async fn run<I, S>(&self, operation: &str, args: I, limit: Duration) -> Result<Output>
    where
        I: IntoIterator<Item = S> + std::fmt::Debug,
        S: AsRef<std::ffi::OsStr>,
    {
        debug!("docker {}: {:?}", operation, args);
        let mut cmd = Command::new(&self.runtime_path);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);

        match tokio::time::timeout(limit, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DockerError::NotInstalled.into())
            }
            Ok(Err(e)) => Err(DockerError::CLIError(format!(
                "Failed to execute docker {}: {}",
                operation, e
            ))
            .into()),
            Err(_) => Err(DockerError::Timeout {
                operation: operation.to_string(),
                seconds: limit.as_secs(),
            }
            .into()),
        }
    }

    async fn run_checked<I, S>(&self, operation: &str, args: I, limit: Duration) -> Result<String>
    where
        I: IntoIterator<Item = S> + std::fmt::Debug,
        S: AsRef<std::ffi::OsStr>,
    {
        let output = self.run(operation, args, limit).await?;
        if !output.status.success() {
            return Err(DockerError::CLIError(format!(
                "docker {} failed: {}",
                operation,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// `docker exec -it` attached to the current terminal; returns the exit code.
    #[instrument(skip(self))]
    pub async fn exec_interactive(&self, name: &str, workdir: &str, cmd: &[String]) -> Result<i32> {
        let status = Command::new(&self.runtime_path)
            .args(["exec", "-w", workdir, "-it", name])
            .args(cmd)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| DockerError::CLIError(format!("Failed to execute docker exec: {}", e)))?;
        Ok(status.code().unwrap_or(-1))
    }
}

impl Default for CliRuntime {
    fn default() -> Self {
        Self::docker()
    }
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such object")
        || stderr.contains("No such container")
        || stderr.contains("No such image")
}

fn labels_at(value: &serde_json::Value) -> Labels {
    value
        .get("Config")
        .and_then(|c| c.get("Labels"))
        .and_then(|l| l.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn str_at<'a>(value: &'a serde_json::Value, path: &[&str]) -> &'a str {
    let mut cursor = value;
    for key in path {
        match cursor.get(key) {
            Some(next) => cursor = next,
            None => return "",
        }
    }
    cursor.as_str().unwrap_or_default()
}

/// Bindings from `NetworkSettings.Ports`, or `HostConfig.PortBindings` for a
/// container that is not running.
fn parse_port_mappings(container: &serde_json::Value) -> Vec<PortMapping> {
    let live = container
        .get("NetworkSettings")
        .and_then(|ns| ns.get("Ports"))
        .and_then(|p| p.as_object());
    let configured = container
        .get("HostConfig")
        .and_then(|hc| hc.get("PortBindings"))
        .and_then(|p| p.as_object());

    let mut mappings = Vec::new();
    for ports in [live, configured].into_iter().flatten() {
        for (port_spec, bindings) in ports {
            let Some((port, protocol)) = port_spec.split_once('/') else {
                continue;
            };
            let Ok(container_port) = port.parse::<u16>() else {
                continue;
            };
            for binding in bindings.as_array().into_iter().flatten() {
                let host_port = binding
                    .get("HostPort")
                    .and_then(|v| v.as_str())
                    .and_then(|v| v.parse::<u16>().ok());
                if let Some(host_port) = host_port {
                    mappings.push(PortMapping {
                        host_port,
                        container_port,
                        protocol: protocol.to_string(),
                        host_ip: str_at(binding, &["HostIp"]).to_string(),
                    });
                }
            }
        }
        if !mappings.is_empty() {
            break;
        }
    }
    mappings
}

/// Parse `docker inspect <container>` output
pub fn parse_container_inspect(json: &str) -> Result<Option<ContainerInfo>> {
    if json.trim().is_empty() {
        return Ok(None);
    }
    let containers: Vec<serde_json::Value> = serde_json::from_str(json)
        .map_err(|e| DockerError::CLIError(format!("Failed to parse inspect JSON: {}", e)))?;
    let Some(container) = containers.first() else {
        return Ok(None);
    };

    Ok(Some(ContainerInfo {
        id: str_at(container, &["Id"]).to_string(),
        name: str_at(container, &["Name"]).trim_start_matches('/').to_string(),
        image: str_at(container, &["Config", "Image"]).to_string(),
        hostname: str_at(container, &["Config", "Hostname"]).to_string(),
        state: str_at(container, &["State", "Status"]).to_string(),
        running: container
            .get("State")
            .and_then(|s| s.get("Running"))
            .and_then(|r| r.as_bool())
            .unwrap_or(false),
        labels: labels_at(container),
        port_mappings: parse_port_mappings(container),
    }))
}

/// Parse `docker image inspect <image>` output
pub fn parse_image_inspect(json: &str) -> Result<Option<ImageInfo>> {
    let images: Vec<serde_json::Value> = serde_json::from_str(json).map_err(|e| {
        DockerError::CLIError(format!("Failed to parse image inspect output: {}", e))
    })?;
    Ok(images.first().map(|image| ImageInfo {
        id: str_at(image, &["Id"]).to_string(),
        labels: labels_at(image),
    }))
}

/// Parse `docker ps --format '{{json .}}'` output, one object per line
pub fn parse_container_list(output: &str) -> Result<Vec<ContainerInfo>> {
    let mut containers = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let value: serde_json::Value = serde_json::from_str(line).map_err(|e| {
            DockerError::CLIError(format!("Failed to parse container JSON: {}", e))
        })?;
        let state = str_at(&value, &["State"]).to_string();
        containers.push(ContainerInfo {
            id: str_at(&value, &["ID"]).to_string(),
            name: str_at(&value, &["Names"]).to_string(),
            image: str_at(&value, &["Image"]).to_string(),
            running: state == "running",
            state,
            ..ContainerInfo::default()
        });
    }
    Ok(containers)
}

#[async_trait]
impl Docker for CliRuntime {
    #[instrument(skip(self))]
    async fn ping(&self) -> Result<()> {
        self.run_checked("info", ["info", "--format", "{{json .ID}}"], QUERY_TIMEOUT)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn list_containers(
        &self,
        label: Option<&str>,
        all: bool,
    ) -> Result<Vec<ContainerInfo>> {
        let mut args = vec!["ps".to_string(), "--format".to_string(), "{{json .}}".to_string()];
        if all {
            args.push("--all".to_string());
        }
        if let Some(label) = label {
            args.push("--filter".to_string());
            args.push(format!("label={}", label));
        }
        let stdout = self.run_checked("ps", &args, QUERY_TIMEOUT).await?;
        parse_container_list(&stdout)
    }

    #[instrument(skip(self))]
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>> {
        let output = self
            .run("inspect", ["container", "inspect", name], QUERY_TIMEOUT)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                return Ok(None);
            }
            return Err(DockerError::CLIError(format!(
                "failed to inspect {}: {}",
                name,
                stderr.trim()
            ))
            .into());
        }
        parse_container_inspect(&String::from_utf8_lossy(&output.stdout))
    }

    #[instrument(skip(self))]
    async fn inspect_image(&self, image: &str) -> Result<Option<ImageInfo>> {
        let output = self
            .run("image inspect", ["image", "inspect", image], QUERY_TIMEOUT)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                return Ok(None);
            }
            return Err(DockerError::CLIError(format!(
                "failed to inspect image {}: {}",
                image,
                stderr.trim()
            ))
            .into());
        }
        parse_image_inspect(&String::from_utf8_lossy(&output.stdout))
    }

    /// Streams build output to stderr; builds are not time bounded.
    #[instrument(skip(self, spec), fields(tag = %spec.tag))]
    async fn build_image(&self, spec: &BuildSpec) -> Result<()> {
        let mut cmd = Command::new(&self.runtime_path);
        cmd.arg("build");
        if spec.network_host {
            cmd.arg("--network=host");
        }
        cmd.arg("-t").arg(&spec.tag).arg("-f").arg(&spec.dockerfile);
        let mut labels: Vec<_> = spec.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            cmd.arg("--label").arg(format!("{}={}", key, value));
        }
        cmd.arg(&spec.context)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DockerError::NotInstalled,
            _ => DockerError::CLIError(format!("Failed to execute docker build: {}", e)),
        })?;
        if let Some(mut stdout) = child.stdout.take() {
            tokio::io::copy(&mut stdout, &mut tokio::io::stderr()).await?;
        }
        let status = child.wait().await?;
        if !status.success() {
            return Err(DockerError::CLIError(format!(
                "docker build of {} exited with {}",
                spec.tag, status
            ))
            .into());
        }
        Ok(())
    }

    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let stdout = self
            .run_checked("create", spec.create_args(), LIFECYCLE_TIMEOUT)
            .await?;
        Ok(stdout.trim().to_string())
    }

    #[instrument(skip(self))]
    async fn start_container(&self, name: &str) -> Result<()> {
        self.run_checked("start", ["start", name], LIFECYCLE_TIMEOUT)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn stop_container(&self, name: &str, timeout: Option<u32>) -> Result<()> {
        let grace = timeout.unwrap_or(10);
        let limit = LIFECYCLE_TIMEOUT + Duration::from_secs(u64::from(grace));
        self.run_checked("stop", ["stop", "-t", &grace.to_string(), name], limit)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn remove_container(&self, name: &str) -> Result<()> {
        self.run_checked("rm", ["rm", "-f", name], LIFECYCLE_TIMEOUT)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn rename_container(&self, from: &str, to: &str) -> Result<()> {
        self.run_checked("rename", ["rename", from, to], QUERY_TIMEOUT)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn exec(&self, name: &str, cmd: &[String]) -> Result<ExecResult> {
        let mut args = vec!["exec".to_string(), name.to_string()];
        args.extend(cmd.iter().cloned());
        let output = self.run("exec", &args, EXEC_TIMEOUT).await?;
        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    #[instrument(skip(self))]
    async fn exec_detached(&self, name: &str, workdir: &str, cmd: &[String]) -> Result<()> {
        let mut args = vec![
            "exec".to_string(),
            "-d".to_string(),
            "-w".to_string(),
            workdir.to_string(),
            name.to_string(),
        ];
        args.extend(cmd.iter().cloned());
        self.run_checked("exec", &args, EXEC_TIMEOUT).await.map(|_| ())
    }
}

pub mod mock {
    //! In-memory engine for tests
    //!
    //! Containers and images live in shared maps; every call is recorded so
    //! tests can assert on ordering. Failures are injected per operation.

    use super::{BuildSpec, ContainerInfo, ContainerSpec, Docker, ExecResult, ImageInfo, PortMapping};
    use crate::errors::{DockerError, Result};
    use crate::labels::Labels;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Operation kinds that can be made to fail
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum MockOp {
        Build,
        Create,
        Start,
        Stop,
        Remove,
        Rename,
        Exec,
    }

    /// Recorded call
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum MockCall {
        Build { tag: String, dockerfile: String },
        Create { name: String, image: String },
        Start(String),
        Stop(String),
        Remove(String),
        Rename { from: String, to: String },
        Exec { container: String, cmd: Vec<String> },
        ExecDetached { container: String, workdir: String, cmd: Vec<String> },
    }

    /// Mock container state
    #[derive(Debug, Clone, Default)]
    pub struct MockContainer {
        pub id: String,
        pub name: String,
        pub image: String,
        pub hostname: String,
        pub running: bool,
        pub labels: Labels,
        pub ports: Vec<PortMapping>,
        pub spec: Option<ContainerSpec>,
    }

    /// `ip:hostPort:containerPort/proto` as passed to `docker create`
    fn parse_publish(entry: &str) -> Option<PortMapping> {
        let (binding, protocol) = entry.split_once('/').unwrap_or((entry, "tcp"));
        let mut parts = binding.rsplitn(3, ':');
        let container_port = parts.next()?.parse().ok()?;
        let host_port = parts.next()?.parse().ok()?;
        Some(PortMapping {
            host_port,
            container_port,
            protocol: protocol.to_string(),
            host_ip: parts.next().unwrap_or_default().to_string(),
        })
    }

    impl MockContainer {
        pub fn new(name: &str, image: &str) -> Self {
            Self {
                id: format!("{}-id", name),
                name: name.to_string(),
                image: image.to_string(),
                hostname: name.to_string(),
                running: true,
                ..Self::default()
            }
        }

        pub fn with_labels(mut self, labels: Labels) -> Self {
            self.labels = labels;
            self
        }

        pub fn with_state(mut self, running: bool) -> Self {
            self.running = running;
            self
        }

        pub fn with_hostname(mut self, hostname: &str) -> Self {
            self.hostname = hostname.to_string();
            self
        }

        pub fn with_published(mut self, host_port: u16, container_port: u16) -> Self {
            self.ports.push(PortMapping {
                host_port,
                container_port,
                protocol: "tcp".to_string(),
                host_ip: "127.0.0.1".to_string(),
            });
            self
        }

        fn info(&self) -> ContainerInfo {
            ContainerInfo {
                id: self.id.clone(),
                name: self.name.clone(),
                image: self.image.clone(),
                hostname: self.hostname.clone(),
                state: if self.running { "running" } else { "exited" }.to_string(),
                running: self.running,
                labels: self.labels.clone(),
                port_mappings: self.ports.clone(),
            }
        }
    }

    /// Configuration for the mock engine
    #[derive(Debug, Clone, Default)]
    pub struct MockDockerConfig {
        pub daemon_unavailable: bool,
        /// Responses keyed by the space-joined command
        pub exec_responses: HashMap<String, ExecResult>,
        pub default_exec_response: ExecResult,
        /// Remaining failures per operation; `u32::MAX` fails forever
        pub failures: HashMap<MockOp, u32>,
    }

    #[derive(Debug, Default)]
    struct MockState {
        containers: Vec<MockContainer>,
        images: HashMap<String, ImageInfo>,
        calls: Vec<MockCall>,
        next_id: u64,
    }

    /// Mock Docker runtime; clones share state.
    #[derive(Debug, Clone, Default)]
    pub struct MockDocker {
        config: Arc<Mutex<MockDockerConfig>>,
        state: Arc<Mutex<MockState>>,
    }

    impl MockDocker {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_container(&self, container: MockContainer) {
            self.state.lock().unwrap().containers.push(container);
        }

        pub fn add_image(&self, tag: &str, labels: Labels) {
            self.state.lock().unwrap().images.insert(
                tag.to_string(),
                ImageInfo {
                    id: format!("sha256:{}", tag),
                    labels,
                },
            );
        }

        pub fn container(&self, name: &str) -> Option<MockContainer> {
            self.state
                .lock()
                .unwrap()
                .containers
                .iter()
                .find(|c| c.name == name)
                .cloned()
        }

        pub fn container_names(&self) -> Vec<String> {
            let mut names: Vec<String> = self
                .state
                .lock()
                .unwrap()
                .containers
                .iter()
                .map(|c| c.name.clone())
                .collect();
            names.sort();
            names
        }

        pub fn image_tags(&self) -> Vec<String> {
            let mut tags: Vec<String> = self.state.lock().unwrap().images.keys().cloned().collect();
            tags.sort();
            tags
        }

        pub fn calls(&self) -> Vec<MockCall> {
            self.state.lock().unwrap().calls.clone()
        }

        pub fn build_count(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, MockCall::Build { .. }))
                .count()
        }

        pub fn update_config<F>(&self, f: F)
        where
            F: FnOnce(&mut MockDockerConfig),
        {
            f(&mut self.config.lock().unwrap());
        }

        /// Make the next `times` calls of `op` fail
        pub fn fail(&self, op: MockOp, times: u32) {
            self.update_config(|c| {
                c.failures.insert(op, times);
            });
        }

        pub fn set_exec_response(&self, cmd: &str, response: ExecResult) {
            self.update_config(|c| {
                c.exec_responses.insert(cmd.to_string(), response);
            });
        }

        fn check(&self, op: MockOp) -> Result<()> {
            let mut config = self.config.lock().unwrap();
            if config.daemon_unavailable {
                return Err(DockerError::NotInstalled.into());
            }
            if let Some(remaining) = config.failures.get_mut(&op) {
                if *remaining > 0 {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    return Err(DockerError::CLIError(format!("injected {:?} failure", op)).into());
                }
            }
            Ok(())
        }

        fn record(&self, call: MockCall) {
            self.state.lock().unwrap().calls.push(call);
        }

        fn with_container<T>(
            &self,
            name: &str,
            f: impl FnOnce(&mut MockContainer) -> T,
        ) -> Result<T> {
            let mut state = self.state.lock().unwrap();
            match state.containers.iter_mut().find(|c| c.name == name) {
                Some(container) => Ok(f(container)),
                None => Err(DockerError::CLIError(format!("No such container: {}", name)).into()),
            }
        }
    }

    #[async_trait]
    impl Docker for MockDocker {
        async fn ping(&self) -> Result<()> {
            if self.config.lock().unwrap().daemon_unavailable {
                return Err(DockerError::NotInstalled.into());
            }
            Ok(())
        }

        async fn list_containers(
            &self,
            label: Option<&str>,
            all: bool,
        ) -> Result<Vec<ContainerInfo>> {
            self.ping().await?;
            let state = self.state.lock().unwrap();
            Ok(state
                .containers
                .iter()
                .filter(|c| all || c.running)
                .filter(|c| match label {
                    None => true,
                    Some(selector) => match selector.split_once('=') {
                        Some((k, v)) => c.labels.get(k).map(String::as_str) == Some(v),
                        None => c.labels.contains_key(selector),
                    },
                })
                .map(|c| ContainerInfo {
                    labels: Labels::new(),
                    ..c.info()
                })
                .collect())
        }

        async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>> {
            self.ping().await?;
            Ok(self.container(name).map(|c| c.info()))
        }

        async fn inspect_image(&self, image: &str) -> Result<Option<ImageInfo>> {
            self.ping().await?;
            Ok(self.state.lock().unwrap().images.get(image).cloned())
        }

        async fn build_image(&self, spec: &BuildSpec) -> Result<()> {
            let dockerfile = std::fs::read_to_string(&spec.dockerfile).unwrap_or_default();
            self.record(MockCall::Build {
                tag: spec.tag.clone(),
                dockerfile,
            });
            self.check(MockOp::Build)?;
            self.add_image(&spec.tag, spec.labels.clone());
            Ok(())
        }

        async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
            self.record(MockCall::Create {
                name: spec.name.clone(),
                image: spec.image.clone(),
            });
            self.check(MockOp::Create)?;
            let mut state = self.state.lock().unwrap();
            if state.containers.iter().any(|c| c.name == spec.name) {
                return Err(DockerError::CLIError(format!(
                    "Conflict. The container name \"/{}\" is already in use",
                    spec.name
                ))
                .into());
            }
            state.next_id += 1;
            let id = format!("mock{:04}", state.next_id);
            state.containers.push(MockContainer {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                hostname: spec.hostname.clone(),
                running: false,
                labels: spec.labels.clone(),
                ports: spec.publish.iter().filter_map(|p| parse_publish(p)).collect(),
                spec: Some(spec.clone()),
            });
            Ok(id)
        }

        async fn start_container(&self, name: &str) -> Result<()> {
            self.record(MockCall::Start(name.to_string()));
            self.check(MockOp::Start)?;
            self.with_container(name, |c| c.running = true)
        }

        async fn stop_container(&self, name: &str, _timeout: Option<u32>) -> Result<()> {
            self.record(MockCall::Stop(name.to_string()));
            self.check(MockOp::Stop)?;
            self.with_container(name, |c| c.running = false)
        }

        async fn remove_container(&self, name: &str) -> Result<()> {
            self.record(MockCall::Remove(name.to_string()));
            self.check(MockOp::Remove)?;
            let mut state = self.state.lock().unwrap();
            let before = state.containers.len();
            state.containers.retain(|c| c.name != name);
            if state.containers.len() == before {
                return Err(DockerError::CLIError(format!("No such container: {}", name)).into());
            }
            Ok(())
        }

        async fn rename_container(&self, from: &str, to: &str) -> Result<()> {
            self.record(MockCall::Rename {
                from: from.to_string(),
                to: to.to_string(),
            });
            self.check(MockOp::Rename)?;
            if self.container(to).is_some() {
                return Err(DockerError::CLIError(format!("name {} is already in use", to)).into());
            }
            self.with_container(from, |c| c.name = to.to_string())
        }

        async fn exec(&self, name: &str, cmd: &[String]) -> Result<ExecResult> {
            self.record(MockCall::Exec {
                container: name.to_string(),
                cmd: cmd.to_vec(),
            });
            self.check(MockOp::Exec)?;
            if self.container(name).is_none() {
                return Err(DockerError::CLIError(format!("No such container: {}", name)).into());
            }
            let config = self.config.lock().unwrap();
            Ok(config
                .exec_responses
                .get(&cmd.join(" "))
                .cloned()
                .unwrap_or_else(|| config.default_exec_response.clone()))
        }

        async fn exec_detached(&self, name: &str, workdir: &str, cmd: &[String]) -> Result<()> {
            self.record(MockCall::ExecDetached {
                container: name.to_string(),
                workdir: workdir.to_string(),
                cmd: cmd.to_vec(),
            });
            self.check(MockOp::Exec)?;
            self.with_container(name, |_| ())
        }
    }
}
