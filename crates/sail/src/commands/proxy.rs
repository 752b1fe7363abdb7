//! Proxy command implementation
//!
//! Implements the hidden `sail proxy` subcommand that `sail run` and
//! `sail open` fork for each container.

use crate::commands::shared::GlobalArgs;
use anyhow::{Context, Result};
use sail_core::config::CONFIG_ENV;
use sail_core::docker::{CliRuntime, Docker};
use sail_core::host::HostCapabilities;
use sail_core::port::{self, PortLocator};
use sail_core::proxy::{self, ProxyConfig};
use std::sync::Arc;
use tracing::{info, instrument};

/// Proxy command arguments
#[derive(Debug, Clone)]
pub struct ProxyArgs {
    pub container: String,
    pub watch: bool,
    pub globals: GlobalArgs,
}

/// Execute the proxy command
#[instrument(skip(args), fields(container = %args.container))]
pub async fn execute_proxy(args: ProxyArgs) -> Result<()> {
    // Rebuilds run `sail edit` as a child process and must see the same config.
    if let Some(path) = &args.globals.config_path {
        std::env::set_var(CONFIG_ENV, path);
    }

    let self_exe = std::env::current_exe().context("failed to locate the sail binary")?;
    let mut config = ProxyConfig::new(args.container.clone(), self_exe);
    config.watch = args.watch;

    let docker: Arc<dyn Docker> =
        Arc::new(CliRuntime::with_runtime_path(args.globals.docker_path.clone()));
    let locator: Arc<dyn PortLocator> = Arc::from(port::locator_for(HostCapabilities::detect()));

    let result = proxy::run(config, docker, locator).await;
    info!("Proxy for {} exiting", args.container);
    Ok(result?)
}
