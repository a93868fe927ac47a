//! core::types
//!
//! Strong types for the operation a caller submits.
//!
//! # Types
//!
//! - [`WorkspaceName`] - Validated remote workspace name
//! - [`Operation`] - A plan or apply request, read-only once submitted
//! - [`PlanMode`] - Normal, destroy, or refresh-only planning
//! - [`PlanFile`] - A saved plan (local file or remote bookmark)
//! - [`Variable`] - A run variable binding
//! - [`Phase`] - Where an operation is in its lifecycle
//! - [`RunResult`] - What an operation reports when it finishes
//!
//! # Examples
//!
//! ```
//! use stratus::core::types::{Operation, WorkspaceName};
//!
//! let ws = WorkspaceName::new("prod").unwrap();
//! let op = Operation::apply(ws, "./infra");
//! assert_eq!(op.parallelism, stratus::core::types::DEFAULT_PARALLELISM);
//! assert!(!op.auto_approve);
//!
//! assert!(WorkspaceName::new("has space").is_err());
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::deplocks::DependencyLocks;
use super::state::StateSnapshot;

/// Parallelism the remote service always uses.
pub const DEFAULT_PARALLELISM: u32 = 10;

/// Errors from type validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid workspace name: {0}")]
    InvalidWorkspaceName(String),

    #[error("invalid variable binding: {0}")]
    InvalidVariable(String),

    #[error("Invalid options: -target and -exclude are mutually exclusive")]
    TargetsAndExcludes,
}

/// A validated workspace name.
///
/// Names are non-empty and consist of ASCII letters, digits, `-` and `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkspaceName(String);

impl WorkspaceName {
    pub fn new(name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(name))
        } else {
            Err(TypeError::InvalidWorkspaceName(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for WorkspaceName {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<WorkspaceName> for String {
    fn from(value: WorkspaceName) -> Self {
        value.0
    }
}

/// What the caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Plan,
    Apply,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Plan => write!(f, "plan"),
            OperationKind::Apply => write!(f, "apply"),
        }
    }
}

/// How the plan is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanMode {
    #[default]
    Normal,
    Destroy,
    RefreshOnly,
}

/// A run variable binding (`name=value`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: String,
}

impl Variable {
    /// Parse a `name=value` binding.
    pub fn parse(binding: &str) -> Result<Self, TypeError> {
        match binding.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => Ok(Self {
                name: name.trim().to_string(),
                value: value.to_string(),
            }),
            _ => Err(TypeError::InvalidVariable(binding.to_string())),
        }
    }
}

/// Pointer to a plan that was saved on the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudPlanBookmark {
    pub run_id: String,
    pub hostname: String,
}

impl CloudPlanBookmark {
    /// Load a bookmark from a JSON file.
    ///
    /// Returns `None` if the file is not a bookmark (e.g. a local plan file).
    pub fn load(path: &Path) -> Option<Self> {
        let contents = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok()
    }
}

/// A previously saved plan supplied to an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanFile {
    /// A plan file produced by a local run.
    Local(PathBuf),
    /// A bookmark to a remote run that already has a plan.
    Cloud(CloudPlanBookmark),
}

impl PlanFile {
    /// Classify a plan path: bookmarks become `Cloud`, anything else `Local`.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match CloudPlanBookmark::load(&path) {
            Some(bookmark) => PlanFile::Cloud(bookmark),
            None => PlanFile::Local(path),
        }
    }
}

/// A plan or apply request.
///
/// Constructed by the caller and shared read-only with the engine once
/// submitted. Optional knobs are plain public fields so callers can use
/// struct update syntax over [`Operation::plan`] / [`Operation::apply`].
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OperationKind,
    pub workspace: WorkspaceName,
    /// Directory holding the configuration to upload.
    pub config_dir: PathBuf,
    pub plan_mode: PlanMode,
    /// When false, the plan skips refreshing state.
    pub refresh: bool,
    pub targets: Vec<String>,
    pub excludes: Vec<String>,
    pub replace: Vec<String>,
    pub variables: Vec<Variable>,
    pub auto_approve: bool,
    /// When false, the state lock is not taken.
    pub lock_state: bool,
    pub lock_timeout: Duration,
    pub parallelism: u32,
    pub plan_file: Option<PlanFile>,
    pub plan_out: Option<PathBuf>,
    pub generate_config_out: Option<PathBuf>,
    pub dependency_locks: DependencyLocks,
}

impl Operation {
    fn new(kind: OperationKind, workspace: WorkspaceName, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            workspace,
            config_dir: config_dir.into(),
            plan_mode: PlanMode::Normal,
            refresh: true,
            targets: Vec::new(),
            excludes: Vec::new(),
            replace: Vec::new(),
            variables: Vec::new(),
            auto_approve: false,
            lock_state: true,
            lock_timeout: Duration::ZERO,
            parallelism: DEFAULT_PARALLELISM,
            plan_file: None,
            plan_out: None,
            generate_config_out: None,
            dependency_locks: DependencyLocks::default(),
        }
    }

    /// A plan-only operation with default settings.
    pub fn plan(workspace: WorkspaceName, config_dir: impl Into<PathBuf>) -> Self {
        Self::new(OperationKind::Plan, workspace, config_dir)
    }

    /// An apply operation with default settings.
    pub fn apply(workspace: WorkspaceName, config_dir: impl Into<PathBuf>) -> Self {
        Self::new(OperationKind::Apply, workspace, config_dir)
    }

    /// Checks that hold whichever route runs the operation.
    pub fn validate(&self) -> Result<(), TypeError> {
        if !self.targets.is_empty() && !self.excludes.is_empty() {
            return Err(TypeError::TargetsAndExcludes);
        }
        Ok(())
    }

    pub fn is_destroy(&self) -> bool {
        self.plan_mode == PlanMode::Destroy
    }

    pub fn is_refresh_only(&self) -> bool {
        self.plan_mode == PlanMode::RefreshOnly
    }

    /// Name used in lock info and run messages ("plan", "apply", "destroy").
    pub fn verb(&self) -> &'static str {
        match (self.kind, self.plan_mode) {
            (OperationKind::Apply, PlanMode::Destroy) => "destroy",
            (OperationKind::Apply, _) => "apply",
            (OperationKind::Plan, _) => "plan",
        }
    }

    /// The saved remote plan this operation applies, if any.
    pub fn cloud_plan(&self) -> Option<&CloudPlanBookmark> {
        match &self.plan_file {
            Some(PlanFile::Cloud(bookmark)) => Some(bookmark),
            _ => None,
        }
    }
}

/// Lifecycle phase of an operation.
///
/// Transition rules live in `engine::phase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Created,
    ConfigUploading,
    RunCreated,
    Planning,
    PlanReady,
    PolicyPending,
    Confirming,
    Applying,
    Applied,
    /// Plan finished and nothing further will happen.
    Planned,
    Discarded,
    Errored,
    Canceled,
    /// Handed to local execution.
    Delegated,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Applied
                | Phase::Planned
                | Phase::Discarded
                | Phase::Errored
                | Phase::Canceled
                | Phase::Delegated
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Created => "created",
            Phase::ConfigUploading => "config_uploading",
            Phase::RunCreated => "run_created",
            Phase::Planning => "planning",
            Phase::PlanReady => "plan_ready",
            Phase::PolicyPending => "policy_pending",
            Phase::Confirming => "confirming",
            Phase::Applying => "applying",
            Phase::Applied => "applied",
            Phase::Planned => "planned",
            Phase::Discarded => "discarded",
            Phase::Errored => "errored",
            Phase::Canceled => "canceled",
            Phase::Delegated => "delegated",
        };
        f.write_str(s)
    }
}

/// Overall outcome of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationResult {
    Success,
    Failure,
}

/// Classification of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Rejected locally before any remote mutation.
    Validation,
    PermissionDenied,
    LockTimeout,
    LockFailed,
    PolicyHardFailed,
    PolicySoftFailed,
    /// Confirmation declined, or the run was discarded elsewhere.
    Discarded,
    /// The remote plan or apply reported errors.
    RemoteErrored,
    Canceled,
    /// Transport or service failure.
    Remote,
    /// Local execution failed.
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Final report of an operation. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub result: OperationResult,
    /// No changes were computed, or no work was attempted.
    pub plan_empty: bool,
    pub failure: Option<Failure>,
    /// State after the operation, when one was read back.
    pub state: Option<StateSnapshot>,
    pub run_id: Option<String>,
    pub phase: Phase,
}

impl RunResult {
    pub fn success(phase: Phase, plan_empty: bool) -> Self {
        Self {
            result: OperationResult::Success,
            plan_empty,
            failure: None,
            state: None,
            run_id: None,
            phase,
        }
    }

    pub fn failure(phase: Phase, plan_empty: bool, failure: Failure) -> Self {
        Self {
            result: OperationResult::Failure,
            plan_empty,
            failure: Some(failure),
            state: None,
            run_id: None,
            phase,
        }
    }

    pub fn with_run_id(mut self, run_id: Option<String>) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_state(mut self, state: Option<StateSnapshot>) -> Self {
        self.state = state;
        self
    }

    pub fn is_success(&self) -> bool {
        self.result == OperationResult::Success
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    /// Process exit status: 0 on success, 1 on any failure.
    pub fn exit_status(&self) -> i32 {
        match self.result {
            OperationResult::Success => 0,
            OperationResult::Failure => 1,
        }
    }
}
