//! runs::mock
//!
//! In-memory runs API for deterministic testing.
//!
//! # Design
//!
//! The mock stores workspaces, runs, policy checks and state in memory.
//! Each run follows a [`RunScript`] that decides its logs and outcome. A run
//! advances one status step per `read_run`, and log reads advance it while
//! its phase is running, so a polling client always makes progress without
//! timers. Runs that await a decision stay put until `apply_run`,
//! `discard_run`, `cancel_run` or a policy override.
//!
//! Non-speculative runs queue behind earlier unfinished runs in the same
//! workspace, like the real service.
//!
//! # Example
//!
//! ```
//! use stratus::runs::mock::{MockRunsApi, RunScript};
//! use stratus::runs::{CreateRunRequest, RunStatus, RunsApi};
//!
//! # tokio_test::block_on(async {
//! let api = MockRunsApi::new();
//! let ws = api.add_workspace("acme", "prod");
//! api.set_script(RunScript::one_resource_add());
//!
//! let run = api.create_run(CreateRunRequest {
//!     workspace_id: ws.id.clone(),
//!     plan_only: true,
//!     ..Default::default()
//! }).await.unwrap();
//! assert_eq!(run.status, RunStatus::Pending);
//!
//! let run = api.read_run(&run.id).await.unwrap();
//! assert_eq!(run.status, RunStatus::Planning);
//! # });
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use super::traits::{
    ApiError, ApiVersion, ConfigurationStatus, ConfigurationVersion, CostEstimate,
    CostEstimateStatus, CreateRunRequest, ExecutionMode, LogChunk, LogSource, PolicyCheck,
    PolicyScope, PolicyStatus, Run, RunPermissions, RunStatus, RunsApi, Workspace,
    WorkspacePermissions,
};
use crate::core::state::StateSnapshot;

/// API version the mock advertises unless told otherwise.
pub const MOCK_API_VERSION: ApiVersion = ApiVersion::new(2, 6);

/// Tool version new workspaces pin.
pub const MOCK_TOOL_VERSION: &str = "1.6.0";

pub const PLAN_ONE_RESOURCE_ADD: &str = "\
stratus v1.6.0

Configuring remote state backend...
Initializing configuration...
Refreshing state in-memory prior to plan...

An execution plan has been generated and is shown below.
Resource actions are indicated with the following symbols:
  + create

Stratus will perform the following actions:

  # null_resource.hello will be created
  + resource \"null_resource\" \"hello\" {
      + id = (known after apply)
    }

Plan: 1 to add, 0 to change, 0 to destroy.
";

pub const PLAN_NO_CHANGES: &str = "\
stratus v1.6.0

Configuring remote state backend...
Initializing configuration...
Refreshing state in-memory prior to plan...

No changes. Infrastructure is up-to-date.
";

pub const PLAN_DESTROY: &str = "\
stratus v1.6.0

Configuring remote state backend...
Initializing configuration...
Refreshing state in-memory prior to plan...

Stratus will perform the following actions:

  # null_resource.hello will be destroyed
  - resource \"null_resource\" \"hello\" {
      - id = \"8657651096157629581\" -> null
    }

Plan: 0 to add, 0 to change, 1 to destroy.
";

pub const PLAN_WITH_ERROR: &str = "\
stratus v1.6.0

Configuring remote state backend...
Initializing configuration...

Error: Unsupported block type

  on main.tf line 1:
   1: resouce \"null_resource\" \"foo\" {

Blocks of type \"resouce\" are not expected here.
";

pub const APPLY_ONE_RESOURCE_ADDED: &str = "\
stratus v1.6.0

Initializing plugins and modules...
null_resource.hello: Creating...
null_resource.hello: Creation complete after 0s (ID: 8657651096157629581)

Apply complete! Resources: 1 added, 0 changed, 0 destroyed.
";

pub const APPLY_DESTROYED: &str = "\
stratus v1.6.0

Initializing plugins and modules...
null_resource.hello: Destroying... (ID: 8657651096157629581)
null_resource.hello: Destruction complete after 0s

Apply complete! Resources: 0 added, 0 changed, 1 destroyed.
";

pub const APPLY_WITH_ERROR: &str = "\
stratus v1.6.0

Initializing plugins and modules...
null_resource.foo: Creating...

Error: null_resource.foo: 1 error occurred:
	* null_resource.foo: exit status 1
";

pub const POLICY_PASSED_LOG: &str = "\
Policy Result: true

This result means that all policies passed and the protected
behavior is allowed.

1 policies evaluated.
";

pub const POLICY_FAILED_LOG: &str = "\
Policy Result: false

This result means that one or more policies failed. The
protected behavior is not allowed.

1 policies evaluated.
";

/// How a run's policy check should resolve.
#[derive(Debug, Clone)]
pub struct PolicyScript {
    pub status: PolicyStatus,
    pub overridable: bool,
    pub can_override: bool,
    pub log: String,
}

impl PolicyScript {
    pub fn passed() -> Self {
        Self {
            status: PolicyStatus::Passed,
            overridable: false,
            can_override: false,
            log: POLICY_PASSED_LOG.to_string(),
        }
    }

    /// Soft failure that the current token may override.
    pub fn soft_failed() -> Self {
        Self {
            status: PolicyStatus::SoftFailed,
            overridable: true,
            can_override: true,
            log: POLICY_FAILED_LOG.to_string(),
        }
    }

    pub fn hard_failed() -> Self {
        Self {
            status: PolicyStatus::HardFailed,
            overridable: false,
            can_override: false,
            log: POLICY_FAILED_LOG.to_string(),
        }
    }
}

/// Scripted behavior of a run.
#[derive(Debug, Clone)]
pub struct RunScript {
    pub plan_log: String,
    pub apply_log: String,
    pub has_changes: bool,
    pub plan_errors: bool,
    pub apply_errors: bool,
    pub cost_estimate: bool,
    pub policy: Option<PolicyScript>,
    /// Resource addresses in state after a successful apply.
    pub resources: Vec<String>,
}

impl RunScript {
    pub fn one_resource_add() -> Self {
        Self {
            plan_log: PLAN_ONE_RESOURCE_ADD.to_string(),
            apply_log: APPLY_ONE_RESOURCE_ADDED.to_string(),
            has_changes: true,
            plan_errors: false,
            apply_errors: false,
            cost_estimate: false,
            policy: None,
            resources: vec!["null_resource.hello".to_string()],
        }
    }

    pub fn no_changes() -> Self {
        Self {
            plan_log: PLAN_NO_CHANGES.to_string(),
            apply_log: String::new(),
            has_changes: false,
            resources: Vec::new(),
            ..Self::one_resource_add()
        }
    }

    pub fn destroy() -> Self {
        Self {
            plan_log: PLAN_DESTROY.to_string(),
            apply_log: APPLY_DESTROYED.to_string(),
            resources: Vec::new(),
            ..Self::one_resource_add()
        }
    }

    pub fn plan_error() -> Self {
        Self {
            plan_log: PLAN_WITH_ERROR.to_string(),
            plan_errors: true,
            ..Self::one_resource_add()
        }
    }

    pub fn apply_error() -> Self {
        Self {
            apply_log: APPLY_WITH_ERROR.to_string(),
            apply_errors: true,
            resources: Vec::new(),
            ..Self::one_resource_add()
        }
    }

    pub fn with_policy(mut self, policy: PolicyScript) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_cost_estimate(mut self) -> Self {
        self.cost_estimate = true;
        self
    }
}

impl Default for RunScript {
    fn default() -> Self {
        Self::one_resource_add()
    }
}

/// Configuration for which operation should fail.
#[derive(Debug, Clone)]
pub enum FailOn {
    ApiVersion(ApiError),
    ReadWorkspace(ApiError),
    CreateConfigurationVersion(ApiError),
    UploadConfiguration(ApiError),
    CreateRun(ApiError),
    ReadRun(ApiError),
    ApplyRun(ApiError),
    ReadLogs(ApiError),
    LockWorkspace(ApiError),
    ReadCurrentState(ApiError),
}

/// Recorded mutating operation for test verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOperation {
    ReadWorkspace { name: String },
    CreateConfigurationVersion { workspace_id: String },
    UploadConfiguration { cv_id: String, bytes: usize },
    CreateRun { request: CreateRunRequest },
    ApplyRun { run_id: String },
    DiscardRun { run_id: String },
    CancelRun { run_id: String },
    OverridePolicyCheck { id: String },
    LockWorkspace { workspace_id: String },
    UnlockWorkspace { workspace_id: String },
}

#[derive(Debug)]
struct MockRun {
    run: Run,
    script: RunScript,
    path: VecDeque<RunStatus>,
    plan_finished: bool,
    apply_started: bool,
}

impl MockRun {
    fn apply_done(&self) -> bool {
        self.apply_started && self.run.status.is_terminal()
    }

    fn set_apply_path(&mut self) {
        let end = if self.script.apply_errors {
            RunStatus::Errored
        } else {
            RunStatus::Applied
        };
        self.path = VecDeque::from(vec![RunStatus::ApplyQueued, RunStatus::Applying, end]);
    }
}

#[derive(Debug)]
struct MockPolicy {
    run_id: String,
    check: PolicyCheck,
    log: String,
}

#[derive(Debug)]
struct MockRunsInner {
    api_version: ApiVersion,
    workspaces: HashMap<String, Workspace>,
    config_versions: HashMap<String, ConfigurationVersion>,
    runs: Vec<MockRun>,
    policies: HashMap<String, MockPolicy>,
    cost_estimates: HashMap<String, CostEstimate>,
    states: HashMap<String, StateSnapshot>,
    script: RunScript,
    chunk_size: usize,
    next_id: u64,
    fail_on: Option<FailOn>,
    operations: Vec<MockOperation>,
}

impl MockRunsInner {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn run_index(&self, run_id: &str) -> Result<usize, ApiError> {
        self.runs
            .iter()
            .position(|r| r.run.id == run_id)
            .ok_or_else(|| ApiError::NotFound(format!("run {}", run_id)))
    }

    fn workspace_by_id(&self, id: &str) -> Option<&Workspace> {
        self.workspaces.values().find(|w| w.id == id)
    }

    fn workspace_by_id_mut(&mut self, id: &str) -> Option<&mut Workspace> {
        self.workspaces.values_mut().find(|w| w.id == id)
    }

    /// A run waits for earlier unfinished non-speculative runs in its
    /// workspace. Speculative runs never hold up the queue.
    fn is_blocked(&self, idx: usize) -> bool {
        let run = &self.runs[idx].run;
        self.runs[..idx].iter().any(|earlier| {
            earlier.run.workspace_id == run.workspace_id
                && !earlier.run.plan_only
                && !earlier.run.status.is_terminal()
        })
    }

    fn advance(&mut self, idx: usize) {
        if self.runs[idx].run.status == RunStatus::Pending && self.is_blocked(idx) {
            return;
        }
        let entry = &mut self.runs[idx];
        let Some(next) = entry.path.pop_front() else {
            return;
        };
        if entry.run.status == RunStatus::Planning {
            entry.plan_finished = true;
        }
        if next == RunStatus::ApplyQueued {
            entry.apply_started = true;
        }
        entry.run.status = next;
        tracing::trace!(run_id = %entry.run.id, status = %next, "mock run advanced");
        if next == RunStatus::Applied {
            self.record_applied_state(idx);
        }
    }

    fn record_applied_state(&mut self, idx: usize) {
        let ws_id = self.runs[idx].run.workspace_id.clone();
        let resources = self.runs[idx].script.resources.clone();
        let state = self.states.entry(ws_id).or_insert_with(|| StateSnapshot {
            serial: 0,
            lineage: "mock-lineage".to_string(),
            resources: Vec::new(),
        });
        state.serial += 1;
        state.resources = resources;
    }

    fn check_fail(&self, expected: &str) -> Result<(), ApiError> {
        let err = match (&self.fail_on, expected) {
            (Some(FailOn::ApiVersion(e)), "api_version") => e,
            (Some(FailOn::ReadWorkspace(e)), "read_workspace") => e,
            (Some(FailOn::CreateConfigurationVersion(e)), "create_configuration_version") => e,
            (Some(FailOn::UploadConfiguration(e)), "upload_configuration") => e,
            (Some(FailOn::CreateRun(e)), "create_run") => e,
            (Some(FailOn::ReadRun(e)), "read_run") => e,
            (Some(FailOn::ApplyRun(e)), "apply_run") => e,
            (Some(FailOn::ReadLogs(e)), "read_logs") => e,
            (Some(FailOn::LockWorkspace(e)), "lock_workspace") => e,
            (Some(FailOn::ReadCurrentState(e)), "read_current_state") => e,
            _ => return Ok(()),
        };
        Err(err.clone())
    }
}

/// Mock runs API for testing.
///
/// Thread-safe via internal `Arc<Mutex<...>>` wrapping; clones share state.
#[derive(Debug, Clone)]
pub struct MockRunsApi {
    hostname: String,
    inner: Arc<Mutex<MockRunsInner>>,
}

impl MockRunsApi {
    /// Create an empty mock service.
    pub fn new() -> Self {
        Self {
            hostname: crate::core::config::DEFAULT_HOSTNAME.to_string(),
            inner: Arc::new(Mutex::new(MockRunsInner {
                api_version: MOCK_API_VERSION,
                workspaces: HashMap::new(),
                config_versions: HashMap::new(),
                runs: Vec::new(),
                policies: HashMap::new(),
                cost_estimates: HashMap::new(),
                states: HashMap::new(),
                script: RunScript::default(),
                chunk_size: usize::MAX,
                next_id: 0,
                fail_on: None,
                operations: Vec::new(),
            })),
        }
    }

    /// Advertise a different API version.
    pub fn with_api_version(self, version: ApiVersion) -> Self {
        self.inner.lock().unwrap().api_version = version;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Serve logs in chunks of at most `size` bytes.
    pub fn with_chunk_size(self, size: usize) -> Self {
        self.inner.lock().unwrap().chunk_size = size.max(1);
        self
    }

    /// Configure the mock to fail on a specific operation.
    pub fn fail_on(self, fail_on: FailOn) -> Self {
        self.inner.lock().unwrap().fail_on = Some(fail_on);
        self
    }

    pub fn clear_fail_on(&self) {
        self.inner.lock().unwrap().fail_on = None;
    }

    /// Script used for runs created from now on.
    pub fn set_script(&self, script: RunScript) {
        self.inner.lock().unwrap().script = script;
    }

    /// Create a remote-execution workspace with default permissions.
    pub fn add_workspace(&self, organization: &str, name: &str) -> Workspace {
        let mut inner = self.inner.lock().unwrap();
        let ws = Workspace {
            id: format!("ws-{}", name),
            name: name.to_string(),
            organization: organization.to_string(),
            execution_mode: ExecutionMode::Remote,
            auto_apply: false,
            vcs_repo: None,
            working_directory: None,
            tool_version: MOCK_TOOL_VERSION.to_string(),
            locked: false,
            permissions: WorkspacePermissions::default(),
        };
        inner.workspaces.insert(name.to_string(), ws.clone());
        ws
    }

    /// Mutate a workspace in place.
    pub fn update_workspace(&self, name: &str, f: impl FnOnce(&mut Workspace)) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ws) = inner.workspaces.get_mut(name) {
            f(ws);
        }
    }

    pub fn workspace(&self, name: &str) -> Option<Workspace> {
        self.inner.lock().unwrap().workspaces.get(name).cloned()
    }

    /// Current view of a run without advancing it.
    pub fn peek_run(&self, run_id: &str) -> Option<Run> {
        let inner = self.inner.lock().unwrap();
        inner
            .runs
            .iter()
            .find(|r| r.run.id == run_id)
            .map(|r| r.run.clone())
    }

    /// All runs, oldest first, without advancing them.
    pub fn all_runs(&self) -> Vec<Run> {
        let inner = self.inner.lock().unwrap();
        inner.runs.iter().map(|r| r.run.clone()).collect()
    }

    pub fn run_count(&self) -> usize {
        self.inner.lock().unwrap().runs.len()
    }

    pub fn set_state(&self, workspace_id: &str, state: StateSnapshot) {
        self.inner
            .lock()
            .unwrap()
            .states
            .insert(workspace_id.to_string(), state);
    }

    /// Get all recorded operations.
    pub fn operations(&self) -> Vec<MockOperation> {
        self.inner.lock().unwrap().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.inner.lock().unwrap().operations.clear();
    }

    fn record(inner: &mut MockRunsInner, op: MockOperation) {
        inner.operations.push(op);
    }

    fn plan_path(script: &RunScript, plan_only: bool, auto_apply: bool) -> VecDeque<RunStatus> {
        let mut path = VecDeque::from(vec![RunStatus::Planning]);
        if script.plan_errors {
            path.push_back(RunStatus::Errored);
            return path;
        }
        if script.cost_estimate {
            path.push_back(RunStatus::CostEstimating);
            path.push_back(RunStatus::CostEstimated);
        }
        let mut soft_failed = false;
        if let Some(policy) = &script.policy {
            path.push_back(RunStatus::PolicyChecking);
            match policy.status {
                PolicyStatus::HardFailed | PolicyStatus::Errored => {
                    path.push_back(RunStatus::Errored);
                    return path;
                }
                PolicyStatus::SoftFailed => {
                    soft_failed = true;
                    path.push_back(RunStatus::PolicyOverride);
                }
                _ => path.push_back(RunStatus::PolicyChecked),
            }
        }
        if !script.has_changes || plan_only {
            path.push_back(RunStatus::PlannedAndFinished);
            return path;
        }
        if soft_failed {
            return path;
        }
        if auto_apply {
            path.push_back(RunStatus::ApplyQueued);
            path.push_back(RunStatus::Applying);
            path.push_back(if script.apply_errors {
                RunStatus::Errored
            } else {
                RunStatus::Applied
            });
            return path;
        }
        if !script.cost_estimate && script.policy.is_none() {
            path.push_back(RunStatus::Planned);
        }
        path
    }
}

impl Default for MockRunsApi {
    fn default() -> Self {
        Self::new()
    }
}

fn slice_log(log: &str, offset: usize, chunk_size: usize) -> &str {
    if offset >= log.len() {
        return "";
    }
    let mut end = offset.saturating_add(chunk_size).min(log.len());
    while !log.is_char_boundary(end) {
        end += 1;
    }
    &log[offset..end]
}

#[async_trait]
impl RunsApi for MockRunsApi {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn api_version(&self) -> Result<ApiVersion, ApiError> {
        let inner = self.inner.lock().unwrap();
        inner.check_fail("api_version")?;
        Ok(inner.api_version)
    }

    async fn read_workspace(&self, organization: &str, name: &str) -> Result<Workspace, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_fail("read_workspace")?;
        Self::record(
            &mut inner,
            MockOperation::ReadWorkspace {
                name: name.to_string(),
            },
        );
        inner
            .workspaces
            .get(name)
            .filter(|w| w.organization == organization)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("workspace {}/{}", organization, name)))
    }

    async fn create_configuration_version(
        &self,
        workspace_id: &str,
        speculative: bool,
    ) -> Result<ConfigurationVersion, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_fail("create_configuration_version")?;
        if inner.workspace_by_id(workspace_id).is_none() {
            return Err(ApiError::NotFound(format!("workspace {}", workspace_id)));
        }
        let id = inner.next_id("cv");
        let cv = ConfigurationVersion {
            upload_url: format!("https://archivist.stratus.dev/{}", id),
            id: id.clone(),
            status: ConfigurationStatus::Pending,
            speculative,
        };
        inner.config_versions.insert(id, cv.clone());
        Self::record(
            &mut inner,
            MockOperation::CreateConfigurationVersion {
                workspace_id: workspace_id.to_string(),
            },
        );
        Ok(cv)
    }

    async fn upload_configuration(
        &self,
        cv: &ConfigurationVersion,
        archive: Vec<u8>,
    ) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_fail("upload_configuration")?;
        let stored = inner
            .config_versions
            .get_mut(&cv.id)
            .ok_or_else(|| ApiError::NotFound(format!("configuration version {}", cv.id)))?;
        stored.status = ConfigurationStatus::Uploaded;
        Self::record(
            &mut inner,
            MockOperation::UploadConfiguration {
                cv_id: cv.id.clone(),
                bytes: archive.len(),
            },
        );
        Ok(())
    }

    async fn read_configuration_version(&self, id: &str) -> Result<ConfigurationVersion, ApiError> {
        let inner = self.inner.lock().unwrap();
        inner
            .config_versions
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("configuration version {}", id)))
    }

    async fn create_run(&self, request: CreateRunRequest) -> Result<Run, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_fail("create_run")?;
        let ws = inner
            .workspace_by_id(&request.workspace_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("workspace {}", request.workspace_id)))?;
        if let Some(cv_id) = &request.configuration_version_id {
            match inner.config_versions.get(cv_id) {
                Some(cv) if cv.status == ConfigurationStatus::Uploaded => {}
                Some(_) => {
                    return Err(ApiError::Conflict(format!(
                        "configuration version {} has not been uploaded",
                        cv_id
                    )))
                }
                None => return Err(ApiError::NotFound(format!("configuration version {}", cv_id))),
            }
        }

        let script = inner.script.clone();
        let id = inner.next_id("run");

        let cost_estimate_id = if script.cost_estimate {
            let ce_id = inner.next_id("ce");
            let status = if request.target_addrs.is_empty() {
                CostEstimateStatus::Finished
            } else {
                CostEstimateStatus::SkippedDueToTargeting
            };
            inner.cost_estimates.insert(
                ce_id.clone(),
                CostEstimate {
                    id: ce_id.clone(),
                    status,
                    matched_resources: 1,
                    resources: 1,
                    prior_monthly_cost: "0.0".to_string(),
                    proposed_monthly_cost: "25.488".to_string(),
                    delta_monthly_cost: "25.488".to_string(),
                    error_message: None,
                },
            );
            Some(ce_id)
        } else {
            None
        };

        let mut policy_check_ids = Vec::new();
        if let Some(policy) = &script.policy {
            let pc_id = inner.next_id("pol");
            inner.policies.insert(
                pc_id.clone(),
                MockPolicy {
                    run_id: id.clone(),
                    check: PolicyCheck {
                        id: pc_id.clone(),
                        status: policy.status,
                        scope: PolicyScope::Organization,
                        overridable: policy.overridable,
                        can_override: policy.can_override,
                    },
                    log: policy.log.clone(),
                },
            );
            policy_check_ids.push(pc_id);
        }

        let run = Run {
            id: id.clone(),
            workspace_id: ws.id.clone(),
            status: RunStatus::Pending,
            message: request.message.clone(),
            is_destroy: request.is_destroy,
            refresh: request.refresh,
            refresh_only: request.refresh_only,
            plan_only: request.plan_only,
            target_addrs: request.target_addrs.clone(),
            exclude_addrs: Vec::new(),
            replace_addrs: request.replace_addrs.clone(),
            has_changes: script.has_changes && !script.plan_errors,
            auto_apply: ws.auto_apply,
            permissions: RunPermissions {
                can_apply: ws.permissions.can_queue_apply,
                can_discard: true,
                can_cancel: true,
            },
            cost_estimate_id,
            policy_check_ids,
            created_at: Utc::now(),
        };
        let path = Self::plan_path(&script, request.plan_only, ws.auto_apply);
        inner.runs.push(MockRun {
            run: run.clone(),
            script,
            path,
            plan_finished: false,
            apply_started: false,
        });
        Self::record(&mut inner, MockOperation::CreateRun { request });
        Ok(run)
    }

    async fn read_run(&self, run_id: &str) -> Result<Run, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_fail("read_run")?;
        let idx = inner.run_index(run_id)?;
        inner.advance(idx);
        Ok(inner.runs[idx].run.clone())
    }

    async fn list_runs(&self, workspace_id: &str) -> Result<Vec<Run>, ApiError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .runs
            .iter()
            .rev()
            .filter(|r| r.run.workspace_id == workspace_id)
            .map(|r| r.run.clone())
            .collect())
    }

    async fn apply_run(&self, run_id: &str, _comment: Option<&str>) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_fail("apply_run")?;
        let idx = inner.run_index(run_id)?;
        let entry = &mut inner.runs[idx];
        let status = entry.run.status;
        let confirmable = status.awaits_decision()
            && !matches!(status, RunStatus::PolicyOverride | RunStatus::PolicySoftFailed);
        if !confirmable {
            return Err(ApiError::Conflict(format!(
                "run {} cannot be applied while {}",
                run_id, status
            )));
        }
        entry.run.status = RunStatus::Confirmed;
        entry.set_apply_path();
        Self::record(
            &mut inner,
            MockOperation::ApplyRun {
                run_id: run_id.to_string(),
            },
        );
        Ok(())
    }

    async fn discard_run(&self, run_id: &str, _comment: Option<&str>) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.run_index(run_id)?;
        let entry = &mut inner.runs[idx];
        if !entry.run.status.awaits_decision() {
            return Err(ApiError::Conflict(format!(
                "run {} cannot be discarded while {}",
                run_id, entry.run.status
            )));
        }
        entry.run.status = RunStatus::Discarded;
        entry.path.clear();
        Self::record(
            &mut inner,
            MockOperation::DiscardRun {
                run_id: run_id.to_string(),
            },
        );
        Ok(())
    }

    async fn cancel_run(&self, run_id: &str, _comment: Option<&str>) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.run_index(run_id)?;
        let entry = &mut inner.runs[idx];
        if entry.run.status.is_terminal() {
            return Err(ApiError::Conflict(format!(
                "run {} cannot be canceled while {}",
                run_id, entry.run.status
            )));
        }
        entry.run.status = RunStatus::Canceled;
        entry.plan_finished = true;
        entry.path.clear();
        Self::record(
            &mut inner,
            MockOperation::CancelRun {
                run_id: run_id.to_string(),
            },
        );
        Ok(())
    }

    async fn read_logs(
        &self,
        run_id: &str,
        source: &LogSource,
        offset: usize,
    ) -> Result<LogChunk, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_fail("read_logs")?;
        let chunk_size = inner.chunk_size;

        let (log, finished) = match source {
            LogSource::Plan => {
                let idx = inner.run_index(run_id)?;
                if inner.runs[idx].run.status == RunStatus::Planning {
                    inner.advance(idx);
                }
                let entry = &inner.runs[idx];
                if !entry.plan_finished {
                    return Ok(LogChunk::default());
                }
                (entry.script.plan_log.clone(), true)
            }
            LogSource::Apply => {
                let idx = inner.run_index(run_id)?;
                if matches!(
                    inner.runs[idx].run.status,
                    RunStatus::Confirmed | RunStatus::ApplyQueued | RunStatus::Applying
                ) {
                    inner.advance(idx);
                }
                let entry = &inner.runs[idx];
                if !entry.apply_done() {
                    return Ok(LogChunk::default());
                }
                (entry.script.apply_log.clone(), true)
            }
            LogSource::PolicyCheck(id) => {
                let policy = inner
                    .policies
                    .get(id)
                    .ok_or_else(|| ApiError::NotFound(format!("policy check {}", id)))?;
                (policy.log.clone(), true)
            }
        };

        let data = slice_log(&log, offset, chunk_size).to_string();
        let complete = finished && offset + data.len() >= log.len();
        Ok(LogChunk { data, complete })
    }

    async fn read_cost_estimate(&self, id: &str) -> Result<CostEstimate, ApiError> {
        let inner = self.inner.lock().unwrap();
        inner
            .cost_estimates
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("cost estimate {}", id)))
    }

    async fn read_policy_check(&self, id: &str) -> Result<PolicyCheck, ApiError> {
        let inner = self.inner.lock().unwrap();
        let policy = inner
            .policies
            .get(id)
            .ok_or_else(|| ApiError::NotFound(format!("policy check {}", id)))?;
        let run_status = inner
            .runs
            .iter()
            .find(|r| r.run.id == policy.run_id)
            .map(|r| r.run.status);
        let mut check = policy.check.clone();
        if run_status.is_some_and(|s| s.is_planning()) {
            check.status = PolicyStatus::Pending;
        }
        Ok(check)
    }

    async fn override_policy_check(&self, id: &str) -> Result<PolicyCheck, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        let (run_id, check) = {
            let policy = inner
                .policies
                .get_mut(id)
                .ok_or_else(|| ApiError::NotFound(format!("policy check {}", id)))?;
            if policy.check.status != PolicyStatus::SoftFailed {
                return Err(ApiError::Conflict(format!(
                    "policy check {} is not soft-failed",
                    id
                )));
            }
            if !policy.check.can_override {
                return Err(ApiError::AuthFailed(
                    "not permitted to override policy checks".into(),
                ));
            }
            policy.check.status = PolicyStatus::Overridden;
            (policy.run_id.clone(), policy.check.clone())
        };

        let idx = inner.run_index(&run_id)?;
        let entry = &mut inner.runs[idx];
        if entry.run.status == RunStatus::PolicyOverride {
            if entry.run.auto_apply {
                entry.run.status = RunStatus::Confirmed;
                entry.set_apply_path();
            } else {
                entry.run.status = RunStatus::PolicyChecked;
            }
        }
        Self::record(
            &mut inner,
            MockOperation::OverridePolicyCheck { id: id.to_string() },
        );
        Ok(check)
    }

    async fn lock_workspace(&self, workspace_id: &str, _reason: &str) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_fail("lock_workspace")?;
        let ws = inner
            .workspace_by_id_mut(workspace_id)
            .ok_or_else(|| ApiError::NotFound(format!("workspace {}", workspace_id)))?;
        if ws.locked {
            return Err(ApiError::Conflict(format!(
                "workspace {} is already locked",
                workspace_id
            )));
        }
        ws.locked = true;
        Self::record(
            &mut inner,
            MockOperation::LockWorkspace {
                workspace_id: workspace_id.to_string(),
            },
        );
        Ok(())
    }

    async fn unlock_workspace(&self, workspace_id: &str) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        let ws = inner
            .workspace_by_id_mut(workspace_id)
            .ok_or_else(|| ApiError::NotFound(format!("workspace {}", workspace_id)))?;
        if !ws.locked {
            return Err(ApiError::Conflict(format!(
                "workspace {} is not locked",
                workspace_id
            )));
        }
        ws.locked = false;
        Self::record(
            &mut inner,
            MockOperation::UnlockWorkspace {
                workspace_id: workspace_id.to_string(),
            },
        );
        Ok(())
    }

    async fn read_current_state(
        &self,
        workspace_id: &str,
    ) -> Result<Option<StateSnapshot>, ApiError> {
        let inner = self.inner.lock().unwrap();
        inner.check_fail("read_current_state")?;
        Ok(inner.states.get(workspace_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (MockRunsApi, Workspace) {
        let api = MockRunsApi::new();
        let ws = api.add_workspace("acme", "prod");
        (api, ws)
    }

    async fn create(api: &MockRunsApi, ws: &Workspace, plan_only: bool) -> Run {
        api.create_run(CreateRunRequest {
            workspace_id: ws.id.clone(),
            plan_only,
            refresh: true,
            ..Default::default()
        })
        .await
        .unwrap()
    }

    async fn drive_to_rest(api: &MockRunsApi, run_id: &str) -> Run {
        let mut run = api.read_run(run_id).await.unwrap();
        for _ in 0..20 {
            if run.status.is_terminal() || run.status.awaits_decision() {
                break;
            }
            run = api.read_run(run_id).await.unwrap();
        }
        run
    }

    #[tokio::test]
    async fn plan_only_run_finishes() {
        let (api, ws) = setup();
        let run = create(&api, &ws, true).await;
        let run = drive_to_rest(&api, &run.id).await;
        assert_eq!(run.status, RunStatus::PlannedAndFinished);
        assert!(run.has_changes);
    }

    #[tokio::test]
    async fn apply_run_waits_for_confirmation() {
        let (api, ws) = setup();
        let run = create(&api, &ws, false).await;
        let run = drive_to_rest(&api, &run.id).await;
        assert_eq!(run.status, RunStatus::Planned);

        api.apply_run(&run.id, None).await.unwrap();
        let run = drive_to_rest(&api, &run.id).await;
        assert_eq!(run.status, RunStatus::Applied);

        let state = api.read_current_state(&ws.id).await.unwrap().unwrap();
        assert_eq!(state.resources, vec!["null_resource.hello".to_string()]);
    }

    #[tokio::test]
    async fn second_run_queues_behind_first() {
        let (api, ws) = setup();
        let first = create(&api, &ws, false).await;
        let second = create(&api, &ws, false).await;

        drive_to_rest(&api, &first.id).await;
        let blocked = api.read_run(&second.id).await.unwrap();
        assert_eq!(blocked.status, RunStatus::Pending);

        api.discard_run(&first.id, None).await.unwrap();
        let moving = api.read_run(&second.id).await.unwrap();
        assert_eq!(moving.status, RunStatus::Planning);
    }

    #[tokio::test]
    async fn speculative_runs_do_not_block_the_queue() {
        let (api, ws) = setup();
        let _spec = create(&api, &ws, true).await;
        let apply = create(&api, &ws, false).await;
        let run = api.read_run(&apply.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Planning);

        let late_spec = create(&api, &ws, true).await;
        let run = api.read_run(&late_spec.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn plan_logs_served_in_chunks() {
        let api = MockRunsApi::new().with_chunk_size(16);
        let ws = api.add_workspace("acme", "prod");
        let run = create(&api, &ws, true).await;
        api.read_run(&run.id).await.unwrap();

        let mut offset = 0;
        let mut collected = String::new();
        for _ in 0..200 {
            let chunk = api.read_logs(&run.id, &LogSource::Plan, offset).await.unwrap();
            offset += chunk.data.len();
            collected.push_str(&chunk.data);
            if chunk.complete {
                break;
            }
        }
        assert_eq!(collected, PLAN_ONE_RESOURCE_ADD);
    }

    #[tokio::test]
    async fn hard_failed_policy_errors_run() {
        let (api, ws) = setup();
        api.set_script(RunScript::one_resource_add().with_policy(PolicyScript::hard_failed()));
        let run = create(&api, &ws, false).await;
        let run = drive_to_rest(&api, &run.id).await;
        assert_eq!(run.status, RunStatus::Errored);

        let pc = api.read_policy_check(&run.policy_check_ids[0]).await.unwrap();
        assert_eq!(pc.status, PolicyStatus::HardFailed);
    }

    #[tokio::test]
    async fn soft_failed_policy_override_unblocks_apply() {
        let (api, ws) = setup();
        api.set_script(RunScript::one_resource_add().with_policy(PolicyScript::soft_failed()));
        let run = create(&api, &ws, false).await;
        let run = drive_to_rest(&api, &run.id).await;
        assert_eq!(run.status, RunStatus::PolicyOverride);
        assert!(api.apply_run(&run.id, None).await.is_err());

        api.override_policy_check(&run.policy_check_ids[0])
            .await
            .unwrap();
        let run = api.read_run(&run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::PolicyChecked);
        api.apply_run(&run.id, None).await.unwrap();
    }

    #[tokio::test]
    async fn cost_estimate_skipped_for_targeted_runs() {
        let (api, ws) = setup();
        api.set_script(RunScript::one_resource_add().with_cost_estimate());
        let run = api
            .create_run(CreateRunRequest {
                workspace_id: ws.id.clone(),
                target_addrs: vec!["null_resource.hello".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        let ce = api
            .read_cost_estimate(run.cost_estimate_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(ce.status, CostEstimateStatus::SkippedDueToTargeting);
    }

    #[tokio::test]
    async fn workspace_lock_conflicts() {
        let (api, ws) = setup();
        api.lock_workspace(&ws.id, "test").await.unwrap();
        let err = api.lock_workspace(&ws.id, "test").await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
        api.unlock_workspace(&ws.id).await.unwrap();
        assert!(api.unlock_workspace(&ws.id).await.is_err());
    }

    #[tokio::test]
    async fn fail_on_returns_error() {
        let api = MockRunsApi::new().fail_on(FailOn::ReadWorkspace(ApiError::RateLimited));
        api.add_workspace("acme", "prod");
        let err = api.read_workspace("acme", "prod").await.unwrap_err();
        assert_eq!(err, ApiError::RateLimited);

        api.clear_fail_on();
        assert!(api.read_workspace("acme", "prod").await.is_ok());
    }

    #[tokio::test]
    async fn operations_are_recorded() {
        let (api, ws) = setup();
        let run = create(&api, &ws, false).await;
        drive_to_rest(&api, &run.id).await;
        api.cancel_run(&run.id, None).await.unwrap();

        let ops = api.operations();
        assert!(matches!(ops[0], MockOperation::CreateRun { .. }));
        assert_eq!(
            ops[1],
            MockOperation::CancelRun {
                run_id: run.id.clone()
            }
        );
    }
}
