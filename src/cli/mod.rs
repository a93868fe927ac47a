//! cli
//!
//! Command-line interface layer for Stratus.
//!
//! # Responsibilities
//!
//! - Parse command-line arguments and global flags
//! - Load configuration and build the runs API client
//! - Delegate to command handlers
//!
//! # Architecture
//!
//! The CLI layer is thin. It parses arguments via clap, turns them into an
//! [`crate::core::types::Operation`] and hands it to the
//! [`crate::engine::Engine`]. It never talks to the runs API directly for
//! run lifecycle work.

pub mod args;
pub mod commands;

pub use args::{Cli, Shell};

use anyhow::Result;

/// Run the CLI application and return the process exit code.
///
/// This is the main entry point called from `main.rs`.
pub fn run(cli: Cli) -> Result<i32> {
    commands::dispatch(cli)
}
