//! Command implementations
//!
//! This module contains implementations for all CLI subcommands.

pub mod edit;
pub mod ls;
pub mod open;
pub mod proxy;
pub mod rm;
pub mod run;
pub mod shared;
pub mod shell;
pub mod watch;
