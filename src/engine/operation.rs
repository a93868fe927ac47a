//! engine::operation
//!
//! The operation state machine.
//!
//! # Architecture
//!
//! [`Engine::start`] reads the workspace, computes the route once and
//! spawns an [`OperationTask`]. The task:
//!
//! 1. validates everything it can locally (no remote mutation yet)
//! 2. takes the state lock; the lock timeout then bounds each queue and
//!    confirmation wait from the moment that wait begins
//! 3. runs the remote or local branch
//! 4. releases the lock, then reports its [`RunResult`]
//!
//! # Invariants
//!
//! - Validation and permission failures never create a run
//! - The lock is released on every exit path before the handle resolves
//! - Only this task moves the phase; only the facade's poll reads status
//! - Policy evaluation precedes confirmation, confirmation precedes apply

use std::sync::Arc;

use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use super::confirm::{confirm, ConfirmError, ConfirmRequest, Confirmation};
use super::handle::{OperationHandle, StopReason, StopSignals};
use super::local::{CommandExecution, LocalError, LocalExecution};
use super::logs::{LogError, LogParser, LogStream};
use super::phase::{EntryFlags, Phase, PhaseTracker, Route};
use super::policy::{PolicyError, PolicyGate, PolicyOutcome};
use super::version::{check_version, VersionError, VersionVerdict};
use super::EngineSettings;
use crate::core::configdir::{ConfigDir, ConfigDirError};
use crate::core::lock::{HeldLock, LockError, StateLocker};
use crate::core::state::{LockInfo, StateError, StateManager, StateSnapshot};
use crate::core::types::{
    CloudPlanBookmark, Failure, FailureKind, Operation, OperationKind, RunResult,
};
use crate::runs::facade::run_url;
use crate::runs::{
    ApiError, CostEstimateStatus, LogSource, Rejection, RemoteStateManager, Run, RunClient,
    RunError, RunStatus, Workspace,
};
use crate::ui::human::HumanView;
use crate::ui::output::Verbosity;
use crate::ui::prompts::{PromptRequest, Prompter, TerminalPrompter};
use crate::ui::view::{View, ViewEvent};

/// Errors returned before an operation task exists.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("Failed to read workspace {name}: {source}")]
    Workspace {
        name: String,
        #[source]
        source: ApiError,
    },
}

/// Everything that can end an operation early.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error(transparent)]
    ConfigDir(#[from] ConfigDirError),

    #[error(transparent)]
    Version(VersionError),

    #[error(
        "Apply requires confirmation but input is disabled; \
         use -auto-approve to apply without confirmation"
    )]
    ConfirmationRequired,

    #[error("Saved plan {run_id} can no longer be applied (run is {status})")]
    SavedPlanStale { run_id: String, status: RunStatus },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("{0}")]
    Api(#[from] ApiError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Confirm(#[from] ConfirmError),

    #[error("Failed to read state: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Local(#[from] LocalError),

    #[error("operation canceled")]
    Canceled,
}

impl From<RunError> for OperationError {
    fn from(e: RunError) -> Self {
        match e {
            RunError::Rejected(r) => OperationError::Rejected(r),
            RunError::Api(e) => OperationError::Api(e),
            RunError::Canceled => OperationError::Canceled,
        }
    }
}

impl OperationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            OperationError::Rejected(r) if r.is_permission() => FailureKind::PermissionDenied,
            OperationError::Rejected(_)
            | OperationError::ConfigDir(_)
            | OperationError::Version(_)
            | OperationError::ConfirmationRequired
            | OperationError::SavedPlanStale { .. } => FailureKind::Validation,
            OperationError::Lock(LockError::Timeout { .. }) => FailureKind::LockTimeout,
            OperationError::Lock(LockError::Canceled) => FailureKind::Canceled,
            OperationError::Lock(_) => FailureKind::LockFailed,
            OperationError::Log(LogError::Canceled) | OperationError::Canceled => {
                FailureKind::Canceled
            }
            OperationError::Local(LocalError::Canceled) => FailureKind::Canceled,
            OperationError::Local(_) => FailureKind::Local,
            OperationError::Confirm(ConfirmError::Prompt(_)) => FailureKind::Local,
            OperationError::Api(_)
            | OperationError::Log(_)
            | OperationError::Policy(_)
            | OperationError::Confirm(_)
            | OperationError::State(_) => FailureKind::Remote,
        }
    }
}

/// Result of one step that may be interrupted.
enum Step<T> {
    Done(T),
    Stopped(StopReason),
}

/// What the plan log showed.
#[derive(Debug, Default, Clone, Copy)]
struct PlanLog {
    saw_summary: bool,
}

/// Drives plan and apply operations.
///
/// # Example
///
/// ```ignore
/// let client = RunClient::connect(api, PollSettings::default()).await?;
/// let engine = Engine::new(client, EngineSettings::new("acme"))
///     .with_view(Arc::new(RecordingView::new()));
/// let handle = engine.start(Operation::plan(workspace, "./infra")).await?;
/// let result = handle.wait().await;
/// ```
#[derive(Clone)]
pub struct Engine {
    client: RunClient,
    settings: EngineSettings,
    view: Arc<dyn View>,
    prompter: Arc<dyn Prompter>,
    local: Arc<dyn LocalExecution>,
    /// Overrides the workspace lock on the remote service.
    state: Option<Arc<dyn StateManager>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("client", &self.client)
            .field("settings", &self.settings)
            .field("local", &self.local.name())
            .finish()
    }
}

impl Engine {
    pub fn new(client: RunClient, settings: EngineSettings) -> Self {
        Self {
            client,
            settings,
            view: Arc::new(HumanView::new(Verbosity::Normal)),
            prompter: Arc::new(TerminalPrompter::new(false)),
            local: Arc::new(CommandExecution::new(
                crate::core::config::DEFAULT_LOCAL_PROGRAM,
            )),
            state: None,
        }
    }

    pub fn with_view(mut self, view: Arc<dyn View>) -> Self {
        self.view = view;
        self
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    pub fn with_local(mut self, local: Arc<dyn LocalExecution>) -> Self {
        self.local = local;
        self
    }

    /// Lock and read state through `state` instead of the workspace.
    pub fn with_state_manager(mut self, state: Arc<dyn StateManager>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn client(&self) -> &RunClient {
        &self.client
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Start `op` and return its handle without waiting for it.
    ///
    /// # Errors
    ///
    /// [`StartError::Workspace`] if the workspace cannot be read.
    pub async fn start(&self, op: Operation) -> Result<OperationHandle, StartError> {
        let workspace = self
            .client
            .api()
            .read_workspace(&self.settings.organization, op.workspace.as_str())
            .await
            .map_err(|source| StartError::Workspace {
                name: op.workspace.to_string(),
                source,
            })?;

        let verdict = check_version(
            &self.settings.local_version,
            &workspace,
            self.settings.force_local,
            self.settings.ignore_version_conflict,
        );
        let flags = EntryFlags {
            force_local: self.settings.force_local,
            remote_operations: workspace.execution_mode.runs_remotely(),
            version_rejected: verdict.is_reject(),
        };
        let route = flags.route();

        let id = Uuid::new_v4();
        let signals = StopSignals::new();
        let span = tracing::info_span!(
            "operation",
            operation_id = %id,
            kind = op.verb(),
            workspace = %op.workspace,
            route = ?route,
        );
        let state: Arc<dyn StateManager> = match &self.state {
            Some(state) => Arc::clone(state),
            None => Arc::new(RemoteStateManager::new(
                Arc::clone(self.client.api()),
                workspace.id.clone(),
            )),
        };

        let task = OperationTask {
            op: Arc::new(op),
            workspace,
            route,
            verdict,
            client: self.client.clone(),
            settings: self.settings.clone(),
            view: Arc::clone(&self.view),
            prompter: Arc::clone(&self.prompter),
            local: Arc::clone(&self.local),
            state,
            signals: signals.clone(),
            phase: PhaseTracker::new(id),
            plan_empty: true,
            run_id: None,
        };
        let join = tokio::spawn(task.run().instrument(span));
        Ok(OperationHandle::new(id, signals, join))
    }
}

/// One operation in flight.
struct OperationTask {
    op: Arc<Operation>,
    workspace: Workspace,
    route: Route,
    verdict: VersionVerdict,
    client: RunClient,
    settings: EngineSettings,
    view: Arc<dyn View>,
    prompter: Arc<dyn Prompter>,
    local: Arc<dyn LocalExecution>,
    state: Arc<dyn StateManager>,
    signals: StopSignals,
    phase: PhaseTracker,
    plan_empty: bool,
    run_id: Option<String>,
}

impl OperationTask {
    async fn run(mut self) -> RunResult {
        tracing::info!("operation started");
        let result = match self.execute().await {
            Ok(result) => result,
            Err(e) => {
                let kind = e.kind();
                let to = if kind == FailureKind::Canceled {
                    Phase::Canceled
                } else {
                    Phase::Errored
                };
                self.fail(to, kind, e.to_string())
            }
        };
        if let Some(failure) = &result.failure {
            self.view.error(&failure.message);
        }
        tracing::info!(
            phase = %result.phase,
            success = result.is_success(),
            plan_empty = result.plan_empty,
            "operation finished"
        );
        result.with_run_id(self.run_id.take())
    }

    async fn execute(&mut self) -> Result<RunResult, OperationError> {
        self.op.validate().map_err(Rejection::from)?;
        match &self.verdict {
            VersionVerdict::Reject(e) => return Err(OperationError::Version(e.clone())),
            VersionVerdict::Warn(e) => self.view.warning(&e.to_string()),
            VersionVerdict::Proceed => {}
        }

        let archive = match self.route {
            Route::Remote => self.prepare_remote()?,
            Route::Local | Route::Reject => None,
        };

        let held = self.acquire_lock().await?;
        self.signals.set_wait_timeout(self.op.lock_timeout);

        let result = match self.route {
            Route::Remote => self.remote(archive).await,
            Route::Local | Route::Reject => self.local().await,
        };

        let released = match held {
            Some(held) => self.release_lock(held).await,
            None => Ok(()),
        };
        match (result, released) {
            (Ok(result), Ok(())) => Ok(result),
            (Ok(result), Err(e)) if result.is_success() => Err(e.into()),
            (Ok(result), Err(e)) => {
                tracing::error!(error = %e, "failed to release state lock");
                Ok(result)
            }
            (Err(e), Err(unlock)) => {
                tracing::error!(error = %unlock, "failed to release state lock");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    /// Local checks before anything remote changes. Returns the upload
    /// archive, if one is needed.
    fn prepare_remote(&self) -> Result<Option<Vec<u8>>, OperationError> {
        let op = &self.op;
        self.client.validate(op, &self.workspace)?;

        let needs_confirmation = op.kind == OperationKind::Apply
            && !op.auto_approve
            && !self.workspace.auto_apply
            && op.cloud_plan().is_none();
        if needs_confirmation && !self.prompter.is_interactive() {
            return Err(OperationError::ConfirmationRequired);
        }

        if op.cloud_plan().is_some() {
            return Ok(None);
        }
        let dir = ConfigDir::open(&op.config_dir, !op.is_destroy())?;
        let root = dir.upload_root(self.workspace.working_directory.as_deref())?;
        let archive = ConfigDir::archive(&root)?;
        tracing::debug!(root = %root.display(), bytes = archive.len(), "configuration archived");
        Ok(Some(archive))
    }

    async fn acquire_lock(&self) -> Result<Option<HeldLock>, OperationError> {
        if !self.op.lock_state {
            return Ok(None);
        }
        let poll = self.client.poll_settings();
        let locker = StateLocker::new(self.op.lock_timeout)
            .with_backoff(poll.min_interval, poll.max_interval);
        let info = LockInfo::new(
            self.op.verb(),
            format!("{}/{}", self.workspace.organization, self.workspace.name),
        );
        let held = locker
            .lock(self.state.as_ref(), info, self.signals.stop_token())
            .await?;
        Ok(Some(held))
    }

    async fn release_lock(&self, held: HeldLock) -> Result<(), LockError> {
        StateLocker::new(self.op.lock_timeout)
            .unlock(self.state.as_ref(), held)
            .await
    }

    fn fail(&mut self, to: Phase, kind: FailureKind, message: impl Into<String>) -> RunResult {
        self.phase.advance(to);
        RunResult::failure(self.phase.current(), self.plan_empty, Failure::new(kind, message))
    }

    fn succeed(&mut self, to: Phase) -> RunResult {
        self.phase.advance(to);
        RunResult::success(self.phase.current(), self.plan_empty)
    }

    // Local branch

    async fn local(&mut self) -> Result<RunResult, OperationError> {
        tracing::info!(local = self.local.name(), "delegating to local execution");
        let outcome = self
            .local
            .execute(&self.op, self.view.as_ref(), self.signals.stop_token())
            .await?;
        self.plan_empty = outcome.plan_empty;
        Ok(self.succeed(Phase::Delegated).with_state(outcome.state))
    }

    // Remote branch

    async fn remote(&mut self, archive: Option<Vec<u8>>) -> Result<RunResult, OperationError> {
        if let Some(bookmark) = self.op.cloud_plan().cloned() {
            return self.apply_saved_plan(&bookmark).await;
        }

        let overridden = self.op.dependency_locks.overridden();
        if !overridden.is_empty() {
            let names: Vec<String> = overridden.iter().map(|a| a.to_string()).collect();
            self.view.warning(&format!(
                "Provider development overrides are in effect for {}. \
                 The remote run cannot use them and will install the locked versions.",
                names.join(", ")
            ));
        }
        if let Some(dir) = self
            .workspace
            .working_directory
            .clone()
            .filter(|d| !d.trim().is_empty())
        {
            self.view.emit(ViewEvent::WorkingDirectory { dir });
        }

        self.phase.advance(Phase::ConfigUploading);
        let speculative = self.op.kind == OperationKind::Plan;
        let cv = self
            .client
            .upload(&self.workspace, archive.unwrap_or_default(), speculative)
            .await?;

        let run = self
            .client
            .create_run(&self.op, &self.workspace, Some(&cv))
            .await?;
        self.run_id = Some(run.id.clone());
        self.phase.advance(Phase::RunCreated);
        self.header(&run);

        let run = match self.wait_in_queue(&run).await? {
            Step::Done(run) => run,
            Step::Stopped(reason) => return self.stopped(reason).await,
        };
        self.phase.advance(Phase::Planning);

        let plan_log = match self.stream_plan(&run).await? {
            Step::Done(log) => log,
            Step::Stopped(reason) => return self.stopped(reason).await,
        };
        let run = match self.wait_for(&run.id, plan_settled).await? {
            Step::Done(run) => run,
            Step::Stopped(reason) => return self.stopped(reason).await,
        };
        self.after_plan(run, plan_log).await
    }

    fn header(&self, run: &Run) {
        let url = run_url(
            self.client.hostname(),
            &self.workspace.organization,
            &self.workspace.name,
            &run.id,
        );
        self.view.emit(ViewEvent::Header {
            verb: self.op.verb().to_string(),
            run_url: Some(url),
        });
    }

    async fn apply_saved_plan(
        &mut self,
        bookmark: &CloudPlanBookmark,
    ) -> Result<RunResult, OperationError> {
        let run = self.client.poll(&bookmark.run_id).await?;
        self.run_id = Some(run.id.clone());
        self.phase.advance(Phase::RunCreated);
        self.header(&run);

        if !run.status.awaits_decision() {
            return Err(OperationError::SavedPlanStale {
                run_id: run.id,
                status: run.status,
            });
        }
        self.phase.advance(Phase::PlanReady);
        self.client.apply(&run.id, None).await?;
        self.view.emit(ViewEvent::ApplyStarted);
        self.apply(&run).await
    }

    /// Wait for the run to leave the queue, reporting how many runs are ahead.
    async fn wait_in_queue(&self, run: &Run) -> Result<Step<Run>, OperationError> {
        let deadline = self.signals.deadline();
        let mut backoff = self.client.poll_settings().backoff();
        let mut last_reported = None;
        loop {
            let current = self.client.poll(&run.id).await?;
            if !current.status.is_queued() {
                return Ok(Step::Done(current));
            }

            let ahead = self.runs_ahead(&current).await?;
            if ahead > 0 && last_reported != Some(ahead) {
                self.view.emit(ViewEvent::QueueWait { runs_ahead: ahead });
                last_reported = Some(ahead);
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff.next_delay()) => {}
                reason = self.signals.interrupted(deadline) => return Ok(Step::Stopped(reason)),
            }
        }
    }

    async fn runs_ahead(&self, run: &Run) -> Result<usize, OperationError> {
        let runs = self.client.api().list_runs(&run.workspace_id).await?;
        // Newest first: everything after ours is older.
        let ahead = runs
            .iter()
            .skip_while(|r| r.id != run.id)
            .skip(1)
            .filter(|r| !r.plan_only && !r.status.is_terminal())
            .count();
        Ok(ahead)
    }

    async fn wait_for(
        &self,
        run_id: &str,
        done: fn(&Run) -> bool,
    ) -> Result<Step<Run>, OperationError> {
        let wait = self
            .client
            .poll_until(run_id, self.signals.cancel_token(), done, |_| {});
        tokio::select! {
            run = wait => Ok(Step::Done(run?)),
            reason = self.signals.interrupted(None) => Ok(Step::Stopped(reason)),
        }
    }

    /// Stream a log to the view. Returns whether a change summary was seen.
    async fn stream(&self, run: &Run, source: LogSource) -> Result<Step<bool>, OperationError> {
        let mut stream = LogStream::new(
            Arc::clone(self.client.api()),
            &run.id,
            source,
            self.client.poll_settings(),
        );
        let parser = LogParser::new();
        let mut saw_summary = false;
        loop {
            tokio::select! {
                line = stream.next_line(self.signals.cancel_token()) => match line? {
                    Some(line) => {
                        let event = parser.parse(&line.text);
                        saw_summary |= matches!(
                            event,
                            ViewEvent::PlanSummary(_) | ViewEvent::ApplySummary(_) | ViewEvent::NoChanges
                        );
                        self.view.emit(event);
                    }
                    None => return Ok(Step::Done(saw_summary)),
                },
                reason = self.signals.interrupted(None) => return Ok(Step::Stopped(reason)),
            }
        }
    }

    async fn stream_plan(&self, run: &Run) -> Result<Step<PlanLog>, OperationError> {
        Ok(match self.stream(run, LogSource::Plan).await? {
            Step::Done(saw_summary) => Step::Done(PlanLog { saw_summary }),
            Step::Stopped(reason) => Step::Stopped(reason),
        })
    }

    async fn after_plan(&mut self, run: Run, plan_log: PlanLog) -> Result<RunResult, OperationError> {
        if matches!(run.status, RunStatus::Canceled | RunStatus::ForceCanceled) {
            return Ok(self.fail(Phase::Canceled, FailureKind::Canceled, "The remote run was canceled."));
        }
        if run.status == RunStatus::Errored
            && (run.policy_check_ids.is_empty() || !plan_log.saw_summary)
        {
            return Ok(self.remote_plan_failed());
        }
        self.phase.advance(Phase::PlanReady);

        if let Some(ce_id) = run.cost_estimate_id.clone() {
            if let Step::Stopped(reason) = self.show_cost_estimate(&ce_id).await? {
                return self.stopped(reason).await;
            }
        }

        let mut run = run;
        if !run.policy_check_ids.is_empty() {
            self.phase.advance(Phase::PolicyPending);
            let gate = PolicyGate::new(&self.client, self.view.as_ref(), &self.prompter, &self.signals);
            match gate.evaluate(&self.op, &run).await? {
                PolicyOutcome::Passed => {}
                PolicyOutcome::HardFailed(message) => {
                    return Ok(self.fail(Phase::Errored, FailureKind::PolicyHardFailed, message))
                }
                PolicyOutcome::SoftFailed(message) => {
                    self.plan_empty = false;
                    return Ok(self.fail(Phase::Errored, FailureKind::PolicySoftFailed, message));
                }
                PolicyOutcome::ExternallyResolved(resolved) => {
                    self.plan_empty = false;
                    return self.externally_resolved(resolved).await;
                }
                PolicyOutcome::Stopped(reason) => return self.stopped(reason).await,
            }
            run = self.client.poll(&run.id).await?;
        }

        if self.op.kind == OperationKind::Plan {
            self.plan_empty = !run.has_changes;
            return Ok(self.succeed(Phase::Planned));
        }
        if run.status == RunStatus::Errored {
            return Ok(self.remote_plan_failed());
        }
        if !run.has_changes || run.status == RunStatus::PlannedAndFinished {
            return Ok(self.succeed(Phase::Planned));
        }
        if run.status.is_applying() || run.status == RunStatus::Applied {
            if !run.auto_apply {
                self.view.emit(ViewEvent::ExternallyResolved { approved: true });
            }
            return self.apply(&run).await;
        }
        if !run.status.awaits_decision() {
            return self.externally_resolved(run).await;
        }

        if self.op.auto_approve {
            self.client.apply(&run.id, None).await?;
            self.view.emit(ViewEvent::ApplyStarted);
            return self.apply(&run).await;
        }

        self.phase.advance(Phase::Confirming);
        let request = ConfirmRequest::apply(&run, &self.workspace.name, self.op.is_destroy());
        match confirm(&self.client, &self.prompter, request, &self.signals).await? {
            Confirmation::Approved => {
                self.client.apply(&run.id, None).await?;
                self.view.emit(ViewEvent::ApplyStarted);
                self.apply(&run).await
            }
            Confirmation::Declined => {
                self.client.discard(&run.id, None).await?;
                Ok(self.fail(Phase::Discarded, FailureKind::Discarded, "Apply discarded."))
            }
            Confirmation::ExternallyResolved(resolved) => self.externally_resolved(resolved).await,
            Confirmation::Stopped(reason) => self.stopped(reason).await,
        }
    }

    fn remote_plan_failed(&mut self) -> RunResult {
        self.plan_empty = false;
        self.fail(
            Phase::Errored,
            FailureKind::RemoteErrored,
            "The remote plan failed; see the output above.",
        )
    }

    async fn show_cost_estimate(&self, id: &str) -> Result<Step<()>, OperationError> {
        let mut backoff = self.client.poll_settings().backoff();
        loop {
            let estimate = self.client.api().read_cost_estimate(id).await?;
            if !matches!(
                estimate.status,
                CostEstimateStatus::Pending | CostEstimateStatus::Queued
            ) {
                self.view.emit(ViewEvent::CostEstimate(estimate));
                return Ok(Step::Done(()));
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff.next_delay()) => {}
                reason = self.signals.interrupted(None) => return Ok(Step::Stopped(reason)),
            }
        }
    }

    /// The run moved on without a local decision.
    async fn externally_resolved(&mut self, run: Run) -> Result<RunResult, OperationError> {
        tracing::info!(run_id = %run.id, status = %run.status, "run resolved elsewhere");
        match run.status {
            RunStatus::Discarded => {
                self.view.emit(ViewEvent::ExternallyResolved { approved: false });
                Ok(self.fail(Phase::Discarded, FailureKind::Discarded, "Apply discarded."))
            }
            s if s.is_applying() || s == RunStatus::Applied => {
                self.view.emit(ViewEvent::ExternallyResolved { approved: true });
                self.apply(&run).await
            }
            RunStatus::Canceled | RunStatus::ForceCanceled => Ok(self.fail(
                Phase::Canceled,
                FailureKind::Canceled,
                "The remote run was canceled.",
            )),
            RunStatus::Errored => Ok(self.remote_plan_failed()),
            RunStatus::PlannedAndFinished => Ok(self.succeed(Phase::Planned)),
            other => Ok(self.fail(
                Phase::Errored,
                FailureKind::Remote,
                format!("Unexpected run status: {}", other),
            )),
        }
    }

    async fn apply(&mut self, run: &Run) -> Result<RunResult, OperationError> {
        self.plan_empty = false;
        self.phase.advance(Phase::Applying);

        if let Step::Stopped(reason) = self.stream(run, LogSource::Apply).await? {
            return self.stopped(reason).await;
        }
        let done = match self.wait_for(&run.id, |r| r.status.is_terminal()).await? {
            Step::Done(run) => run,
            Step::Stopped(reason) => return self.stopped(reason).await,
        };

        match done.status {
            RunStatus::Applied => {
                let state = self.read_state().await?;
                Ok(self.succeed(Phase::Applied).with_state(state))
            }
            RunStatus::Canceled | RunStatus::ForceCanceled => Ok(self.fail(
                Phase::Canceled,
                FailureKind::Canceled,
                "The remote run was canceled.",
            )),
            RunStatus::Discarded => {
                Ok(self.fail(Phase::Errored, FailureKind::Discarded, "Apply discarded."))
            }
            _ => Ok(self.fail(
                Phase::Errored,
                FailureKind::RemoteErrored,
                "The remote apply failed; see the output above.",
            )),
        }
    }

    async fn read_state(&self) -> Result<Option<StateSnapshot>, OperationError> {
        Ok(self.state.read_state().await?)
    }

    /// Leave the normal path: decide whether to cancel the remote run,
    /// then report the stop.
    async fn stopped(&mut self, reason: StopReason) -> Result<RunResult, OperationError> {
        tracing::info!(?reason, "operation stopping");
        let mut remote_canceled = None;

        if let Some(run_id) = self.run_id.clone() {
            let run = self.client.poll(&run_id).await.ok();
            let cancelable = run
                .as_ref()
                .map(|r| !r.status.is_terminal() && r.permissions.can_cancel)
                .unwrap_or(false);
            if cancelable {
                let cancel = match reason {
                    StopReason::Cancel | StopReason::LockTimeout => true,
                    StopReason::Interrupt => self.confirm_cancel().await,
                };
                if cancel {
                    match self.client.cancel(&run_id, None).await {
                        Ok(()) => remote_canceled = Some(true),
                        Err(e) => {
                            tracing::warn!(run_id, error = %e, "failed to cancel remote run");
                            remote_canceled = Some(false);
                        }
                    }
                } else {
                    remote_canceled = Some(false);
                }
            }
        }

        let message = match (reason, remote_canceled) {
            (StopReason::LockTimeout, _) => {
                return Ok(self.fail(Phase::Canceled, FailureKind::LockTimeout, "Lock timeout exceeded"))
            }
            (_, Some(true)) => "The remote operation was canceled.",
            (_, Some(false)) => "Stopped waiting; the remote operation was not canceled.",
            (_, None) => "Operation canceled.",
        };
        Ok(self.fail(Phase::Canceled, FailureKind::Canceled, message))
    }

    async fn confirm_cancel(&self) -> bool {
        if self.op.auto_approve || !self.prompter.is_interactive() {
            return true;
        }
        let request = PromptRequest::new(
            "cancel",
            "\nDo you want to cancel the remote operation?",
            "Only 'yes' will be accepted to cancel.",
        );
        tokio::select! {
            answer = self.prompter.ask(&request) => matches!(answer.as_deref(), Ok("yes")),
            _ = self.signals.cancel_token().cancelled() => true,
        }
    }
}

/// Planning, cost estimation and policy checks are all done.
fn plan_settled(run: &Run) -> bool {
    match run.status {
        s if s.is_planning() => false,
        // Policy checks still to come.
        RunStatus::Planned | RunStatus::CostEstimated => run.policy_check_ids.is_empty(),
        _ => true,
    }
}
