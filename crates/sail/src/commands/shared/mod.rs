//! Shared helpers for command implementations.

pub mod context;
pub mod online;
pub mod rebuild;

pub use context::{CommandContext, GlobalArgs};
pub use online::{open_browser, print_editor_log, proxy_healthy, wait_online};
pub use rebuild::{rebuild_environment, rebuild_in_process, RebuildRoute};
