//! runs::traits
//!
//! The runs API trait and the data it exchanges.
//!
//! # Design
//!
//! The `RunsApi` trait is async because every call is network I/O. It is a
//! thin mirror of the remote service: it does not validate operations or
//! sequence runs. Validation lives in [`super::facade::RunClient`] and
//! sequencing lives in [`crate::engine`].
//!
//! Polling is the only observation mechanism. Nothing here pushes updates.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::state::StateSnapshot;

/// Errors from runs API calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// No token is configured.
    #[error("authentication required")]
    AuthRequired,

    /// The token was rejected or lacks permissions.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The resource is in a state that does not allow the request.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Rate limit exceeded.
    #[error("rate limited")]
    RateLimited,

    /// The API returned an error.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Network or connection error.
    #[error("network error: {0}")]
    Network(String),

    /// The service does not implement the request.
    #[error("not implemented: {0}")]
    NotImplemented(String),
}

/// API version advertised by the service (`major.minor`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse `"2.6"`. A missing minor component is treated as `0`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().splitn(2, '.');
        let major = parts.next()?.parse().ok()?;
        let minor = match parts.next() {
            Some(m) => m.parse().ok()?,
            None => 0,
        };
        Some(Self { major, minor })
    }

    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        *self >= Self::new(major, minor)
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Where a workspace's runs execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Remote,
    Local,
    Agent,
}

impl ExecutionMode {
    /// Whether runs for this workspace execute on the service.
    pub fn runs_remotely(&self) -> bool {
        !matches!(self, ExecutionMode::Local)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspacePermissions {
    pub can_queue_run: bool,
    pub can_queue_apply: bool,
    pub can_queue_destroy: bool,
    pub can_lock: bool,
}

impl Default for WorkspacePermissions {
    fn default() -> Self {
        Self {
            can_queue_run: true,
            can_queue_apply: true,
            can_queue_destroy: true,
            can_lock: true,
        }
    }
}

/// A remote workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub organization: String,
    pub execution_mode: ExecutionMode,
    pub auto_apply: bool,
    /// Connected VCS repository, if any.
    pub vcs_repo: Option<String>,
    pub working_directory: Option<String>,
    /// Tool version the workspace pins (`"latest"` or a semver string).
    pub tool_version: String,
    pub locked: bool,
    pub permissions: WorkspacePermissions,
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    PlanQueued,
    Planning,
    Planned,
    CostEstimating,
    CostEstimated,
    PolicyChecking,
    PolicyOverride,
    PolicySoftFailed,
    PolicyChecked,
    Confirmed,
    PlannedAndFinished,
    ApplyQueued,
    Applying,
    Applied,
    Discarded,
    Errored,
    Canceled,
    ForceCanceled,
}

impl RunStatus {
    /// No further transitions will happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Applied
                | RunStatus::Discarded
                | RunStatus::Errored
                | RunStatus::Canceled
                | RunStatus::ForceCanceled
                | RunStatus::PlannedAndFinished
        )
    }

    /// Waiting in the queue; no work has started.
    pub fn is_queued(&self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::PlanQueued)
    }

    /// Planning work (including post-plan checks) is still running.
    pub fn is_planning(&self) -> bool {
        matches!(
            self,
            RunStatus::Pending
                | RunStatus::PlanQueued
                | RunStatus::Planning
                | RunStatus::CostEstimating
                | RunStatus::PolicyChecking
        )
    }

    /// Apply has been confirmed and is running.
    pub fn is_applying(&self) -> bool {
        matches!(
            self,
            RunStatus::Confirmed | RunStatus::ApplyQueued | RunStatus::Applying
        )
    }

    /// Run is parked waiting for someone to confirm, override or discard.
    pub fn awaits_decision(&self) -> bool {
        matches!(
            self,
            RunStatus::Planned
                | RunStatus::CostEstimated
                | RunStatus::PolicyChecked
                | RunStatus::PolicyOverride
                | RunStatus::PolicySoftFailed
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunPermissions {
    pub can_apply: bool,
    pub can_discard: bool,
    pub can_cancel: bool,
}

/// A remote run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub workspace_id: String,
    pub status: RunStatus,
    pub message: String,
    pub is_destroy: bool,
    pub refresh: bool,
    pub refresh_only: bool,
    pub plan_only: bool,
    pub target_addrs: Vec<String>,
    pub exclude_addrs: Vec<String>,
    pub replace_addrs: Vec<String>,
    pub has_changes: bool,
    pub auto_apply: bool,
    pub permissions: RunPermissions,
    pub cost_estimate_id: Option<String>,
    pub policy_check_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A run variable sent with creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunVariable {
    pub key: String,
    pub value: String,
}

/// Parameters for creating a run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreateRunRequest {
    pub workspace_id: String,
    pub configuration_version_id: Option<String>,
    pub message: String,
    pub is_destroy: bool,
    pub refresh: bool,
    pub refresh_only: bool,
    pub plan_only: bool,
    pub target_addrs: Vec<String>,
    pub replace_addrs: Vec<String>,
    pub variables: Vec<RunVariable>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigurationStatus {
    Pending,
    Uploaded,
    Errored,
}

/// A configuration version awaiting or holding an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationVersion {
    pub id: String,
    pub upload_url: String,
    pub status: ConfigurationStatus,
    pub speculative: bool,
}

/// Which log a [`LogChunk`] belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogSource {
    Plan,
    Apply,
    PolicyCheck(String),
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::Plan => write!(f, "plan"),
            LogSource::Apply => write!(f, "apply"),
            LogSource::PolicyCheck(id) => write!(f, "policy-check {}", id),
        }
    }
}

/// A slice of log output starting at the requested byte offset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogChunk {
    pub data: String,
    /// The source has finished and `data` reaches its end.
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostEstimateStatus {
    Pending,
    Queued,
    Finished,
    Errored,
    Canceled,
    SkippedDueToTargeting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub id: String,
    pub status: CostEstimateStatus,
    pub matched_resources: u32,
    pub resources: u32,
    pub prior_monthly_cost: String,
    pub proposed_monthly_cost: String,
    pub delta_monthly_cost: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    Pending,
    Queued,
    Passed,
    SoftFailed,
    HardFailed,
    Overridden,
    Errored,
    Canceled,
}

impl PolicyStatus {
    pub fn is_settled(&self) -> bool {
        !matches!(self, PolicyStatus::Pending | PolicyStatus::Queued)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyScope {
    Organization,
    Workspace,
}

impl fmt::Display for PolicyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyScope::Organization => write!(f, "Organization"),
            PolicyScope::Workspace => write!(f, "Workspace"),
        }
    }
}

/// Result of one policy check on a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyCheck {
    pub id: String,
    pub status: PolicyStatus,
    pub scope: PolicyScope,
    /// The failure may be overridden at all.
    pub overridable: bool,
    /// The current token may perform the override.
    pub can_override: bool,
}

/// The runs API.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the engine shares one client
/// between the operation task and its status watchers.
///
/// # Error Handling
///
/// All methods return `Result<T, ApiError>`. The engine passes these
/// through to the caller with minimal reinterpretation.
#[async_trait]
pub trait RunsApi: Send + Sync {
    /// Implementation name for diagnostics (e.g. "http", "mock").
    fn name(&self) -> &'static str;

    /// Hostname of the service.
    fn hostname(&self) -> &str;

    async fn api_version(&self) -> Result<ApiVersion, ApiError>;

    async fn read_workspace(&self, organization: &str, name: &str) -> Result<Workspace, ApiError>;

    async fn create_configuration_version(
        &self,
        workspace_id: &str,
        speculative: bool,
    ) -> Result<ConfigurationVersion, ApiError>;

    async fn upload_configuration(
        &self,
        cv: &ConfigurationVersion,
        archive: Vec<u8>,
    ) -> Result<(), ApiError>;

    async fn read_configuration_version(&self, id: &str) -> Result<ConfigurationVersion, ApiError>;

    async fn create_run(&self, request: CreateRunRequest) -> Result<Run, ApiError>;

    async fn read_run(&self, run_id: &str) -> Result<Run, ApiError>;

    /// Runs in a workspace, newest first.
    async fn list_runs(&self, workspace_id: &str) -> Result<Vec<Run>, ApiError>;

    async fn apply_run(&self, run_id: &str, comment: Option<&str>) -> Result<(), ApiError>;

    async fn discard_run(&self, run_id: &str, comment: Option<&str>) -> Result<(), ApiError>;

    async fn cancel_run(&self, run_id: &str, comment: Option<&str>) -> Result<(), ApiError>;

    async fn read_logs(
        &self,
        run_id: &str,
        source: &LogSource,
        offset: usize,
    ) -> Result<LogChunk, ApiError>;

    async fn read_cost_estimate(&self, id: &str) -> Result<CostEstimate, ApiError>;

    async fn read_policy_check(&self, id: &str) -> Result<PolicyCheck, ApiError>;

    async fn override_policy_check(&self, id: &str) -> Result<PolicyCheck, ApiError>;

    /// Lock a workspace. Fails with [`ApiError::Conflict`] if already locked.
    async fn lock_workspace(&self, workspace_id: &str, reason: &str) -> Result<(), ApiError>;

    async fn unlock_workspace(&self, workspace_id: &str) -> Result<(), ApiError>;

    async fn read_current_state(&self, workspace_id: &str)
        -> Result<Option<StateSnapshot>, ApiError>;
}
