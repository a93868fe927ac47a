//! core
//!
//! Core domain types and local collaborators for Stratus.
//!
//! # Modules
//!
//! - [`types`] - Strong types: WorkspaceName, Operation, PlanMode, etc.
//! - [`state`] - State manager abstraction and the local file implementation
//! - [`lock`] - Lock coordinator (timeout, backoff, cancellation)
//! - [`config`] - Configuration schema and loading
//! - [`configdir`] - Configuration directory detection and upload archive
//! - [`deplocks`] - Provider dependency lock set
//!
//! # Design Principles
//!
//! - Strong typing prevents invalid states at compile time
//! - Core never depends on the runs API or the engine

pub mod config;
pub mod configdir;
pub mod deplocks;
pub mod lock;
pub mod state;
pub mod types;
