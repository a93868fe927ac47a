//! runs
//!
//! Abstraction over the remote runs service.
//!
//! # Architecture
//!
//! The `RunsApi` trait mirrors the service one call at a time. The engine
//! never calls it directly for run lifecycle work; it goes through
//! [`RunClient`], which validates operations against the advertised API
//! version and owns the polling backoff.
//!
//! # Modules
//!
//! - `traits`: Core `RunsApi` trait and the data it exchanges
//! - [`facade`]: Validation, run creation, polling, run actions
//! - [`http`]: HTTPS/JSON implementation
//! - [`mock`]: In-memory implementation for deterministic testing
//! - [`state`]: State manager backed by the workspace lock
//! - `factory`: Transport selection

mod factory;
pub mod facade;
pub mod http;
pub mod mock;
pub mod state;
mod traits;

pub use facade::{PollSettings, Rejection, RunClient, RunError};
pub use factory::create_runs_api;
pub use state::RemoteStateManager;
pub use traits::*;
