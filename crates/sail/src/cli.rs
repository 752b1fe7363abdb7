use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Log format options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log level options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    /// Error messages only
    Error,
    /// Warning and error messages
    Warn,
    /// Informational messages and above
    Info,
    /// Debug messages and above
    Debug,
    /// All messages including trace
    Trace,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Clone a project and start its environment
    #[command(long_about = "Clone a project and start its environment\n\n\
        The repository is cloned into the project root when it is not already there. \
        The image is the --image flag, else the project's .sail/Dockerfile, else the \
        configured default image. A hat, when given or configured, is layered on top.")]
    Run {
        /// Repository (`user/repo`, `host:path` or `user@host:path`)
        repo: String,
        /// Base image to use instead of the project or default image
        #[arg(long)]
        image: Option<String>,
        /// Hat directory or `github:user/repo` reference
        #[arg(long)]
        hat: Option<String>,
        /// Keep the container if startup fails
        #[arg(long)]
        keep: bool,
        /// Do not open a browser
        #[arg(long)]
        no_open: bool,
        /// Rebuild automatically when the project or hat Dockerfiles change
        #[arg(long)]
        watch: bool,
    },

    /// Edit the project's Dockerfile and rebuild the environment
    Edit {
        /// Repository, or the container name with --container
        repo: String,
        /// Edit the hat's Dockerfile instead
        #[arg(long)]
        hat: bool,
        /// Treat the argument as a container name
        #[arg(long)]
        container: bool,
    },

    /// Serve the edge proxy for a container
    #[command(hide = true)]
    Proxy {
        /// Container name
        container: String,
        /// Rebuild automatically when the project or hat Dockerfiles change
        #[arg(long)]
        watch: bool,
    },

    /// Open an existing environment in the browser
    Open {
        /// Repository
        repo: String,
        /// Do not open a browser
        #[arg(long)]
        no_open: bool,
    },

    /// List environments
    Ls {
        /// Include stopped environments
        #[arg(long)]
        all: bool,
    },

    /// Remove environments
    Rm {
        /// Repository
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        repo: Option<String>,
        /// Remove every environment
        #[arg(long)]
        all: bool,
        /// Also delete the project checkout and per-container data
        #[arg(long)]
        with_data: bool,
    },

    /// Open a login shell in an environment
    Shell {
        /// Repository
        repo: String,
    },

    /// Rebuild the environment whenever its Dockerfiles change
    Watch {
        /// Repository
        repo: String,
    },
}

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version,
    about = "Containerized development environments with a browser editor",
    long_about = "Containerized development environments with a browser editor\n\nEach project runs in its own container with code-server, reached through a per-project proxy.",
    color = clap::ColorChoice::Auto
)]
pub struct Cli {
    /// Log format (text or json, defaults to text, can be set via SAIL_LOG_FORMAT env var)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log level
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Configuration file path (defaults to SAIL_CONFIG, then the user config dir)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Path to docker executable
    #[arg(long, global = true, default_value = "docker")]
    pub docker_path: String,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub async fn dispatch(self) -> Result<()> {
        let log_format = match self.log_format {
            Some(LogFormat::Text) => Some("text"),
            Some(LogFormat::Json) => Some("json"),
            None => None,
        };
        let log_level = self.log_level.as_str();
        if std::env::var_os("SAIL_LOG").is_none() && std::env::var_os("RUST_LOG").is_none() {
            std::env::set_var(
                "RUST_LOG",
                format!("sail={},sail_core={}", log_level, log_level),
            );
        }
        sail_core::logging::init(log_format)?;
        tracing::debug!("CLI initialized with log level: {}", log_level);

        let globals = crate::commands::shared::GlobalArgs {
            config_path: self.config,
            docker_path: self.docker_path,
        };

        match self.command {
            Commands::Run {
                repo,
                image,
                hat,
                keep,
                no_open,
                watch,
            } => {
                use crate::commands::run::{execute_run, RunArgs};
                execute_run(RunArgs {
                    repo,
                    image,
                    hat,
                    keep,
                    no_open,
                    watch,
                    globals,
                })
                .await
            }
            Commands::Edit {
                repo,
                hat,
                container,
            } => {
                use crate::commands::edit::{execute_edit, EditArgs};
                execute_edit(EditArgs {
                    target: repo,
                    hat,
                    container,
                    globals,
                })
                .await
            }
            Commands::Proxy { container, watch } => {
                use crate::commands::proxy::{execute_proxy, ProxyArgs};
                execute_proxy(ProxyArgs {
                    container,
                    watch,
                    globals,
                })
                .await
            }
            Commands::Open { repo, no_open } => {
                use crate::commands::open::{execute_open, OpenArgs};
                execute_open(OpenArgs {
                    repo,
                    no_open,
                    globals,
                })
                .await
            }
            Commands::Ls { all } => {
                use crate::commands::ls::{execute_ls, LsArgs};
                execute_ls(LsArgs { all, globals }).await
            }
            Commands::Rm {
                repo,
                all,
                with_data,
            } => {
                use crate::commands::rm::{execute_rm, RmArgs};
                execute_rm(RmArgs {
                    repo,
                    all,
                    with_data,
                    globals,
                })
                .await
            }
            Commands::Shell { repo } => {
                use crate::commands::shell::{execute_shell, ShellArgs};
                execute_shell(ShellArgs { repo, globals }).await
            }
            Commands::Watch { repo } => {
                use crate::commands::watch::{execute_watch, WatchArgs};
                execute_watch(WatchArgs { repo, globals }).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_global_flags_default_values() {
        let cli = Cli::parse_from(["sail", "ls"]);
        assert_eq!(cli.docker_path, "docker");
        assert!(cli.config.is_none());
        assert!(matches!(cli.command, Commands::Ls { all: false }));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "sail",
            "ls",
            "--docker-path",
            "/usr/local/bin/docker",
            "--config",
            "/tmp/sail.toml",
        ]);
        assert_eq!(cli.docker_path, "/usr/local/bin/docker");
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/sail.toml")));
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::parse_from([
            "sail",
            "run",
            "cdr/sail",
            "--image",
            "ubuntu:22.04",
            "--hat",
            "~/hats/zsh",
            "--keep",
            "--no-open",
        ]);
        match cli.command {
            Commands::Run {
                repo,
                image,
                hat,
                keep,
                no_open,
                watch,
            } => {
                assert_eq!(repo, "cdr/sail");
                assert_eq!(image.as_deref(), Some("ubuntu:22.04"));
                assert_eq!(hat.as_deref(), Some("~/hats/zsh"));
                assert!(keep);
                assert!(no_open);
                assert!(!watch);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_rm_needs_repo_or_all() {
        assert!(Cli::try_parse_from(["sail", "rm"]).is_err());
        assert!(Cli::try_parse_from(["sail", "rm", "cdr/sail", "--all"]).is_err());
        let cli = Cli::parse_from(["sail", "rm", "--all", "--with-data"]);
        assert!(matches!(
            cli.command,
            Commands::Rm {
                repo: None,
                all: true,
                with_data: true
            }
        ));
    }

    #[test]
    fn test_edit_container_mode() {
        let cli = Cli::parse_from(["sail", "edit", "--container", "cdr_sail"]);
        match cli.command {
            Commands::Edit {
                repo,
                hat,
                container,
            } => {
                assert_eq!(repo, "cdr_sail");
                assert!(!hat);
                assert!(container);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_proxy_is_hidden_but_parses() {
        let cli = Cli::parse_from(["sail", "proxy", "cdr_sail", "--watch"]);
        assert!(matches!(
            cli.command,
            Commands::Proxy { watch: true, .. }
        ));
    }
}
