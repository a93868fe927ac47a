//! Stratus - Remote run orchestration for infrastructure plan and apply
//!
//! Stratus drives plan and apply operations on a remote runs service on
//! behalf of a local command-line client: it uploads configuration, queues
//! a run, streams its logs, gates on policy checks, asks for confirmation
//! and applies, while holding the workspace state lock throughout.
//!
//! # Architecture
//!
//! The codebase follows a layered architecture:
//!
//! - [`cli`] - Command-line interface layer (parses args, delegates to engine)
//! - [`engine`] - The operation state machine and its collaborators
//! - [`runs`] - The runs API trait, its HTTP and mock implementations, and
//!   the run client facade
//! - [`core`] - Domain types, state locking, configuration
//! - [`ui`] - Progress views and prompts
//!
//! # Correctness Invariants
//!
//! Stratus maintains the following invariants:
//!
//! 1. Nothing remote is created before an operation passes validation
//! 2. The state lock taken for an operation is released on every exit path
//! 3. Policy evaluation precedes confirmation, confirmation precedes apply
//! 4. Run status is only ever learned by polling

pub mod cli;
pub mod core;
pub mod engine;
pub mod runs;
pub mod ui;
