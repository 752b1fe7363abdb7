//! Error types and handling
//!
//! Each area of the orchestrator (engine access, hats, labels, mounts, port
//! discovery, rebuilds, the edge proxy) has its own error enum. They are
//! wrapped by [`SailError`] so internal helpers can propagate with `?` and the
//! binary only has to deal with a single type.

use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file parsing error
    #[error("Failed to parse configuration file {path}: {message}")]
    Parsing { path: String, message: String },

    /// Configuration file I/O error
    #[error("Failed to access configuration file")]
    Io(#[from] std::io::Error),

    /// No usable configuration location
    #[error("Configuration directory not found: {reason}")]
    NotFound { reason: String },
}

/// Container engine errors
#[derive(Error, Debug)]
pub enum DockerError {
    /// The engine CLI is not installed or not accessible
    #[error("Docker is not installed or not accessible")]
    NotInstalled,

    /// Engine CLI command error
    #[error("Docker CLI error: {0}")]
    CLIError(String),

    /// Container not found
    #[error("Container not found: {name}")]
    ContainerNotFound { name: String },

    /// Image not found
    #[error("Image not found: {image}")]
    ImageNotFound { image: String },

    /// Command executed inside a container returned non-zero
    #[error("Command execution failed with exit code {code}: {stderr}")]
    ExecFailed { code: i32, stderr: String },

    /// Engine call exceeded its per-operation timeout
    #[error("Docker {operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },
}

/// Hat (Dockerfile overlay) errors
#[derive(Error, Debug)]
pub enum HatError {
    /// apply was requested without a hat
    #[error("Unable to apply hat, none specified")]
    NotSpecified,

    /// Hat directory does not exist
    #[error("Hat directory not found: {path}")]
    MissingDir { path: String },

    /// Hat directory has no Dockerfile
    #[error("Hat Dockerfile not found: {path}")]
    MissingDockerfile { path: String },

    /// Hat reference could not be interpreted or fetched
    #[error("Invalid hat reference {reference}: {reason}")]
    InvalidReference { reference: String, reason: String },

    /// The engine failed to build the hatted image
    #[error("Failed to build hat image {image}: {message}")]
    Build { image: String, message: String },

    /// Hat file I/O error
    #[error("Hat I/O error")]
    Io(#[from] std::io::Error),
}

/// Label-encoded state errors
#[derive(Error, Debug)]
pub enum LabelError {
    /// An expected label is absent from a container: it was not created by
    /// sail, or its labels were tampered with.
    #[error("Container {container} is missing label {label}")]
    Missing { container: String, label: String },
}

/// Mount assembly errors
#[derive(Error, Debug)]
pub enum MountError {
    /// Image declared a share that is not `src:dst`
    #[error("Invalid share {value:?}")]
    InvalidShare { value: String },

    /// A mount path could not be resolved
    #[error("Failed to resolve mount path {path}: {reason}")]
    Resolve { path: String, reason: String },

    /// A missing mount source could not be created on the host
    #[error("Failed to create mount source {path}")]
    CreateSource {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Port discovery errors
#[derive(Error, Debug)]
pub enum PortError {
    /// No listening socket was found for the editor process
    #[error("Failed to find port for code-server in {container}")]
    NotFound { container: String },

    /// A `/proc/net/tcp` row or address could not be parsed
    #[error("Failed to parse port: {input}")]
    Parse { input: String },

    /// The lookup itself failed (exec error, process missing)
    #[error("Port lookup failed: {0}")]
    Lookup(String),

    /// No free host port in the searched range
    #[error("No available ports between {start} and {end}")]
    NoAvailablePort { start: u16, end: u16 },
}

impl PortError {
    /// Whether the caller should keep polling until its deadline
    pub fn is_retryable(&self) -> bool {
        matches!(self, PortError::NotFound { .. } | PortError::Lookup(_))
    }
}

/// Project resolution errors
#[derive(Error, Debug)]
pub enum ProjectError {
    /// Repository reference could not be parsed
    #[error("Invalid repository {input:?}: {reason}")]
    InvalidRepo { input: String, reason: String },

    /// Git clone/pull failed
    #[error("Git error: {0}")]
    Git(String),

    /// Editor server binary could not be provisioned
    #[error("Failed to load code-server: {0}")]
    CodeServer(String),
}

/// Rebuild protocol errors
#[derive(Error, Debug)]
pub enum RebuildError {
    /// Building new artifacts failed; the original container was not touched
    #[error("Failed to build new environment: {0}")]
    Build(Box<SailError>),

    /// The swap failed and the original container was restored
    #[error("Rebuild failed and was rolled back: {cause}")]
    RolledBack { cause: Box<SailError> },

    /// The swap failed and at least one compensating action failed too
    #[error("Rebuild failed ({cause}); rollback step {step} failed: {reason}")]
    RollbackIncomplete {
        cause: Box<SailError>,
        step: String,
        reason: String,
    },
}

/// Edge proxy errors
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Listener could not be bound
    #[error("Failed to listen: {0}")]
    Bind(#[source] std::io::Error),

    /// The proxy decided to exit (lost ownership, refresh deadline)
    #[error("Proxy terminated: {reason}")]
    Terminated { reason: String },

    /// A rebuild requested through the reload socket did not succeed
    #[error("Reload failed: {0}")]
    Reload(String),
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum SailError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Docker/Runtime-related errors
    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),

    /// Hat errors
    #[error("Hat error: {0}")]
    Hat(#[from] HatError),

    /// Label-state errors
    #[error("Label error: {0}")]
    Label(#[from] LabelError),

    /// Mount errors
    #[error("Mount error: {0}")]
    Mount(#[from] MountError),

    /// Port discovery errors
    #[error("Port error: {0}")]
    Port(#[from] PortError),

    /// Project errors
    #[error("Project error: {0}")]
    Project(#[from] ProjectError),

    /// Rebuild errors
    #[error("Rebuild error: {0}")]
    Rebuild(#[from] RebuildError),

    /// Proxy errors
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Filesystem watch errors
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SailError {
    /// True for "container does not exist" and "port not bound yet"
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SailError::Docker(DockerError::ContainerNotFound { .. })
                | SailError::Port(PortError::NotFound { .. })
        )
    }
}

/// Convenience type alias for Results with SailError
pub type Result<T> = std::result::Result<T, SailError>;
