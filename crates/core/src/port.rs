//! Editor port discovery
//!
//! With host networking code-server binds a dynamic port that is found by
//! reading `/proc` inside the container: the pid of code-server, the socket
//! inodes among its fds, then the row of `/proc/net/tcp` for one of those
//! inodes whose remote port is zero. Without host networking the port is the
//! published mapping of the fixed guest port.

use crate::docker::Docker;
use crate::errors::{PortError, Result, SailError};
use crate::host::{HostCapabilities, PortStrategy, FIXED_GUEST_PORT};
use crate::retry::{poll_until, RetryDecision};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, instrument};

/// Range `find_available_port` draws from
pub const PORT_RANGE: (u16, u16) = (8000, 9000);

static SOCKET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"socket:\[(\d+)\]").expect("valid socket regex"));

/// Finds the port code-server listens on for a container
#[async_trait]
pub trait PortLocator: Send + Sync {
    async fn locate(&self, docker: &dyn Docker, container: &str) -> Result<u16>;
}

/// Locator matching the host's port strategy
pub fn locator_for(capabilities: HostCapabilities) -> Box<dyn PortLocator> {
    match capabilities.port_strategy {
        PortStrategy::HostNetworkProcfs => Box::new(ProcfsLocator),
        PortStrategy::PublishedMapping => Box::new(FixedMappingLocator),
    }
}

/// Decode the port of a hex `addr:port` pair from `/proc/net/tcp`. The
/// address must be valid hex too (32 bits for tcp, 128 for tcp6).
pub fn parse_hex_port(pair: &str) -> std::result::Result<u16, PortError> {
    let err = || PortError::Parse {
        input: pair.to_string(),
    };
    let (addr, port) = match pair.split(':').collect::<Vec<_>>()[..] {
        [addr, port] => (addr, port),
        _ => return Err(err()),
    };
    if !matches!(addr.len(), 8 | 32) || u128::from_str_radix(addr, 16).is_err() {
        return Err(err());
    }
    u16::from_str_radix(port, 16).map_err(|_| err())
}

/// One row of `/proc/net/tcp`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpEntry {
    pub local_port: u16,
    pub remote_port: u16,
    pub inode: String,
}

/// Parse `/proc/net/tcp` (or tcp6) text. Header rows are skipped; any other
/// malformed row is an error.
pub fn parse_net_tcp(text: &str) -> std::result::Result<Vec<TcpEntry>, PortError> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.first() {
            None => continue,
            Some(&"sl") => continue,
            Some(_) => {}
        }
        if fields.len() < 10 {
            return Err(PortError::Parse {
                input: line.trim().to_string(),
            });
        }
        entries.push(TcpEntry {
            local_port: parse_hex_port(fields[1])?,
            remote_port: parse_hex_port(fields[2])?,
            inode: fields[9].to_string(),
        });
    }
    Ok(entries)
}

/// Socket inodes from a `find /proc/<pid>/fd -type l -ls` listing
pub fn parse_socket_inodes(listing: &str) -> HashSet<String> {
    SOCKET_RE
        .captures_iter(listing)
        .map(|c| c[1].to_string())
        .collect()
}

/// The listening row among `entries` for one of `inodes`
pub fn select_listening(entries: &[TcpEntry], inodes: &HashSet<String>) -> Option<u16> {
    entries
        .iter()
        .find(|e| e.remote_port == 0 && inodes.contains(&e.inode))
        .map(|e| e.local_port)
}

fn lookup_err(step: &str, err: SailError) -> SailError {
    PortError::Lookup(format!("{}: {}", step, err)).into()
}

async fn exec_stdout(docker: &dyn Docker, container: &str, cmd: &[&str]) -> Result<(i32, String)> {
    let cmd: Vec<String> = cmd.iter().map(|s| s.to_string()).collect();
    let result = docker.exec(container, &cmd).await?;
    Ok((result.exit_code, result.stdout))
}

/// `/proc` based lookup for host-networked containers
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcfsLocator;

impl ProcfsLocator {
    async fn pid(&self, docker: &dyn Docker, container: &str) -> Result<u32> {
        let (code, out) = exec_stdout(docker, container, &["pgrep", "-P", "1", "code-server"])
            .await
            .map_err(|e| lookup_err("pgrep", e))?;
        let first = out.lines().next().map(str::trim).unwrap_or_default();
        if code != 0 || first.is_empty() {
            return Err(PortError::NotFound {
                container: container.to_string(),
            }
            .into());
        }
        first.parse().map_err(|_| {
            PortError::Parse {
                input: first.to_string(),
            }
            .into()
        })
    }
}

#[async_trait]
impl PortLocator for ProcfsLocator {
    #[instrument(skip(self, docker))]
    async fn locate(&self, docker: &dyn Docker, container: &str) -> Result<u16> {
        let pid = self.pid(docker, container).await?;

        let fd_dir = format!("/proc/{}/fd", pid);
        let (_, listing) = exec_stdout(docker, container, &["find", &fd_dir, "-type", "l", "-ls"])
            .await
            .map_err(|e| lookup_err("fd listing", e))?;
        let inodes = parse_socket_inodes(&listing);
        debug!("code-server pid {} has {} sockets", pid, inodes.len());

        let mut entries = Vec::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            let (code, text) = exec_stdout(docker, container, &["cat", table])
                .await
                .map_err(|e| lookup_err("net table", e))?;
            if code == 0 {
                entries.extend(parse_net_tcp(&text)?);
            }
        }

        select_listening(&entries, &inodes).ok_or_else(|| {
            PortError::NotFound {
                container: container.to_string(),
            }
            .into()
        })
    }
}

/// Published-port lookup for hosts without host networking
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedMappingLocator;

#[async_trait]
impl PortLocator for FixedMappingLocator {
    #[instrument(skip(self, docker))]
    async fn locate(&self, docker: &dyn Docker, container: &str) -> Result<u16> {
        // A container that is not created or started yet is still coming up.
        let info = docker.inspect_container(container).await?;
        info.filter(|info| info.running)
            .and_then(|info| {
                info.port_mappings
                    .iter()
                    .find(|m| m.container_port == FIXED_GUEST_PORT)
                    .map(|m| m.host_port)
            })
            .ok_or_else(|| {
                PortError::NotFound {
                    container: container.to_string(),
                }
                .into()
            })
    }
}

fn classify(err: &SailError) -> RetryDecision {
    match err {
        SailError::Port(port) if port.is_retryable() => RetryDecision::Retry,
        _ => RetryDecision::Stop,
    }
}

/// Poll `locator` until it finds the port or `timeout` elapses; the last
/// error is returned on expiry.
pub async fn wait_for_port(
    locator: &dyn PortLocator,
    docker: &dyn Docker,
    container: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<u16> {
    poll_until(
        interval,
        timeout,
        || locator.locate(docker, container),
        classify,
    )
    .await
}

/// A free loopback port drawn at random from [`PORT_RANGE`]
pub fn find_available_port() -> Result<u16> {
    let (start, end) = PORT_RANGE;
    for _ in 0..64 {
        let port = fastrand::u16(start..end);
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    (start..end)
        .find(|port| std::net::TcpListener::bind(("127.0.0.1", *port)).is_ok())
        .ok_or_else(|| PortError::NoAvailablePort { start, end }.into())
}
