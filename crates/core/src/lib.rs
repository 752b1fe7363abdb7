//! Core library for sail
//!
//! This crate contains the environment lifecycle: hat image builds, label-encoded
//! container state, mount assembly, the container runner, in-place rebuilds with
//! rollback, editor port discovery, and the per-project edge proxy.

pub mod codeserver;
pub mod config;
pub mod docker;
pub mod errors;
pub mod git;
pub mod hat;
pub mod host;
pub mod labels;
pub mod logging;
pub mod mount;
pub mod port;
pub mod project;
pub mod proxy;
pub mod rebuild;
pub mod retry;
pub mod runner;
pub mod watcher;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
