//! engine
//!
//! Orchestrates remote plan and apply operations.
//!
//! # Architecture
//!
//! One operation is one tokio task. [`Engine::start`] computes the route
//! once, spawns the task and returns an [`OperationHandle`] immediately:
//!
//! 1. **Validate**: version check, API feature check, configuration archive
//! 2. **Lock**: take the state lock through [`crate::core::lock::StateLocker`]
//! 3. **Run**: upload, create the run, stream the plan, gate on policy,
//!    confirm, apply
//! 4. **Release**: unlock, then resolve the handle with a [`RunResult`]
//!
//! ```text
//! Created -> ConfigUploading -> RunCreated -> Planning -> PlanReady
//!         -> PolicyPending -> Confirming -> Applying -> Applied
//! ```
//!
//! Any live phase may end in `Errored` or `Canceled`. Plans end in
//! `Planned`; local execution ends in `Delegated`.
//!
//! # Invariants
//!
//! - Nothing remote is mutated before validation passes
//! - The state lock is released before the handle reports done
//! - Every wait is raced against the stop signals
//! - Policy evaluation precedes confirmation, confirmation precedes apply
//!
//! # Example
//!
//! ```ignore
//! use stratus::engine::{Engine, EngineSettings};
//!
//! let engine = Engine::new(client, EngineSettings::new("acme"));
//! let handle = engine.start(op).await?;
//! let result = handle.wait().await;
//! std::process::exit(result.exit_status());
//! ```
//!
//! [`RunResult`]: crate::core::types::RunResult

pub mod confirm;
pub mod handle;
pub mod local;
pub mod logs;
pub mod operation;
pub mod phase;
pub mod policy;
pub mod version;

pub use confirm::{Confirmation, ConfirmRequest};
pub use handle::{OperationHandle, StopReason, StopSignals};
pub use local::{CommandExecution, LocalExecution, LocalOutcome, ScriptedExecution};
pub use logs::{LogParser, LogStream};
pub use operation::{Engine, OperationError, StartError};
pub use phase::{EntryFlags, Phase, Route};
pub use policy::{PolicyGate, PolicyOutcome};
pub use version::{check_version, LocalVersion, VersionError, VersionVerdict};

/// Settings shared by every operation an [`Engine`] starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub organization: String,
    pub local_version: LocalVersion,
    /// Run locally even when the workspace runs operations remotely.
    pub force_local: bool,
    /// Downgrade a version mismatch to a warning.
    pub ignore_version_conflict: bool,
}

impl EngineSettings {
    pub fn new(organization: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            local_version: LocalVersion::default(),
            force_local: false,
            ignore_version_conflict: false,
        }
    }

    pub fn with_local_version(mut self, version: LocalVersion) -> Self {
        self.local_version = version;
        self
    }

    pub fn with_force_local(mut self, force_local: bool) -> Self {
        self.force_local = force_local;
        self
    }

    pub fn with_ignore_version_conflict(mut self, ignore: bool) -> Self {
        self.ignore_version_conflict = ignore;
        self
    }
}
