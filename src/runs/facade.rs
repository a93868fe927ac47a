//! runs::facade
//!
//! Run client facade: validation, creation, polling and run actions.
//!
//! # Design
//!
//! [`RunClient`] wraps a shared [`RunsApi`] together with the API version
//! the service advertised when the client connected. Everything the engine
//! does to a remote run goes through here.
//!
//! Validation happens before any remote call. An operation the service
//! cannot honor is turned into a named [`Rejection`] so that no partial
//! remote state (configuration versions, queued runs) is ever left behind.
//!
//! Polling is the only way to observe a run. [`RunClient::poll_until`]
//! polls with bounded exponential backoff and gives up as soon as the
//! cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::traits::{
    ApiError, ApiVersion, ConfigurationVersion, CreateRunRequest, Run, RunVariable, RunsApi,
    Workspace,
};
use crate::core::types::{
    Operation, OperationKind, PlanFile, PlanMode, TypeError, DEFAULT_PARALLELISM,
};

/// Message attached to runs created by this client.
pub const RUN_MESSAGE: &str = "Queued manually using Stratus";

/// An operation the service cannot run, detected locally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error(transparent)]
    Invalid(#[from] TypeError),

    #[error("Resource exclusion is not supported: the -exclude option is not supported by the remote service")]
    ExcludesUnsupported,

    #[error("Insufficient rights to generate a plan: the provided credentials have insufficient rights to generate a plan")]
    InsufficientPlanRights,

    #[error("Insufficient rights to apply changes: the provided credentials have insufficient rights to apply changes")]
    InsufficientApplyRights,

    #[error("Insufficient rights to destroy: the provided credentials have insufficient rights to queue a destroy plan")]
    InsufficientDestroyRights,

    #[error("Apply not allowed for workspaces with a VCS connection: a workspace that is connected to a VCS requires the VCS-driven workflow")]
    VcsConnected,

    #[error("Custom parallelism values are currently not supported: the remote service manages its own concurrency")]
    Parallelism,

    #[error("Applying a saved local plan is not supported: only saved remote plans can be applied")]
    SavedLocalPlan,

    #[error("Displaying a saved plan is currently not supported")]
    SavedPlanDisplay,

    #[error("Saving a generated plan is currently not supported")]
    GeneratedPlanOutput,

    #[error("Generating configuration is not currently supported")]
    GeneratedConfigOutput,

    #[error("Resource targeting is not supported: the service API version {0} does not support resource targeting")]
    TargetingUnsupported(ApiVersion),

    #[error("Planning without refresh is not supported: the service API version {0} does not support this option")]
    NoRefreshUnsupported(ApiVersion),

    #[error("Refresh-only mode is not supported: the service API version {0} does not support this mode")]
    RefreshOnlyUnsupported(ApiVersion),

    #[error("Planning resource replacements is not supported: the service API version {0} does not support this option")]
    ReplaceUnsupported(ApiVersion),

    #[error("Run variables are currently not supported: the service API version {0} does not support setting variables for a run")]
    VariablesUnsupported(ApiVersion),

    #[error("Saved plan is for a different hostname: the plan was created on {plan} but this client targets {client}")]
    SavedPlanHostMismatch { plan: String, client: String },
}

impl Rejection {
    /// The rejection is about credentials rather than the operation.
    pub fn is_permission(&self) -> bool {
        matches!(
            self,
            Rejection::InsufficientPlanRights
                | Rejection::InsufficientApplyRights
                | Rejection::InsufficientDestroyRights
        )
    }
}

/// Errors from facade calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("polling canceled")]
    Canceled,
}

/// Bounds for the polling backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub min_interval: Duration,
    pub max_interval: Duration,
}

impl PollSettings {
    pub fn new(min_interval: Duration, max_interval: Duration) -> Self {
        Self {
            min_interval,
            max_interval: max_interval.max(min_interval),
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.min_interval,
            max: self.max_interval,
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::new(
            crate::core::config::DEFAULT_POLL_MIN,
            crate::core::config::DEFAULT_POLL_MAX,
        )
    }
}

/// Doubling delay sequence capped at a maximum.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self, min: Duration) {
        self.next = min;
    }
}

/// Sleep for `delay` unless `cancel` fires first. Returns `false` if canceled.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Browser URL of a run.
pub fn run_url(hostname: &str, organization: &str, workspace: &str, run_id: &str) -> String {
    format!(
        "https://{}/app/{}/{}/runs/{}",
        hostname, organization, workspace, run_id
    )
}

/// Facade over the runs API for one service.
#[derive(Clone)]
pub struct RunClient {
    api: Arc<dyn RunsApi>,
    api_version: ApiVersion,
    poll: PollSettings,
}

impl std::fmt::Debug for RunClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunClient")
            .field("api", &self.api.name())
            .field("api_version", &self.api_version)
            .field("poll", &self.poll)
            .finish()
    }
}

impl RunClient {
    pub fn new(api: Arc<dyn RunsApi>, api_version: ApiVersion, poll: PollSettings) -> Self {
        Self {
            api,
            api_version,
            poll,
        }
    }

    /// Ask the service for its API version and build a client.
    pub async fn connect(api: Arc<dyn RunsApi>, poll: PollSettings) -> Result<Self, ApiError> {
        let api_version = api.api_version().await?;
        tracing::debug!(api = api.name(), %api_version, "connected to runs API");
        Ok(Self::new(api, api_version, poll))
    }

    pub fn api(&self) -> &Arc<dyn RunsApi> {
        &self.api
    }

    pub fn api_version(&self) -> ApiVersion {
        self.api_version
    }

    pub fn poll_settings(&self) -> PollSettings {
        self.poll
    }

    pub fn hostname(&self) -> &str {
        self.api.hostname()
    }

    /// Check that the service can run `op` against `workspace`.
    ///
    /// Performs no remote calls.
    pub fn validate(&self, op: &Operation, workspace: &Workspace) -> Result<(), Rejection> {
        op.validate()?;
        if !op.excludes.is_empty() {
            return Err(Rejection::ExcludesUnsupported);
        }

        let perms = &workspace.permissions;
        match op.kind {
            OperationKind::Plan => {
                if !perms.can_queue_run {
                    return Err(Rejection::InsufficientPlanRights);
                }
            }
            OperationKind::Apply => {
                if op.is_destroy() && !perms.can_queue_destroy {
                    return Err(Rejection::InsufficientDestroyRights);
                }
                if !perms.can_queue_apply {
                    return Err(Rejection::InsufficientApplyRights);
                }
                if workspace.vcs_repo.is_some() {
                    return Err(Rejection::VcsConnected);
                }
            }
        }

        if op.parallelism != DEFAULT_PARALLELISM {
            return Err(Rejection::Parallelism);
        }

        match (&op.plan_file, op.kind) {
            (Some(PlanFile::Local(_)), OperationKind::Apply) => {
                return Err(Rejection::SavedLocalPlan)
            }
            (Some(_), OperationKind::Plan) => return Err(Rejection::SavedPlanDisplay),
            (Some(PlanFile::Cloud(bookmark)), OperationKind::Apply) => {
                if bookmark.hostname != self.hostname() {
                    return Err(Rejection::SavedPlanHostMismatch {
                        plan: bookmark.hostname.clone(),
                        client: self.hostname().to_string(),
                    });
                }
            }
            (None, _) => {}
        }
        if op.plan_out.is_some() {
            return Err(Rejection::GeneratedPlanOutput);
        }
        if op.generate_config_out.is_some() {
            return Err(Rejection::GeneratedConfigOutput);
        }

        let v = self.api_version;
        if !op.targets.is_empty() && !v.at_least(2, 3) {
            return Err(Rejection::TargetingUnsupported(v));
        }
        if !op.refresh && !v.at_least(2, 4) {
            return Err(Rejection::NoRefreshUnsupported(v));
        }
        if op.is_refresh_only() && !v.at_least(2, 4) {
            return Err(Rejection::RefreshOnlyUnsupported(v));
        }
        if !op.replace.is_empty() && !v.at_least(2, 4) {
            return Err(Rejection::ReplaceUnsupported(v));
        }
        if !op.variables.is_empty() && !v.at_least(2, 6) {
            return Err(Rejection::VariablesUnsupported(v));
        }

        Ok(())
    }

    /// Create a configuration version and upload `archive` into it.
    pub async fn upload(
        &self,
        workspace: &Workspace,
        archive: Vec<u8>,
        speculative: bool,
    ) -> Result<ConfigurationVersion, RunError> {
        let cv = self
            .api
            .create_configuration_version(&workspace.id, speculative)
            .await?;
        tracing::debug!(cv_id = %cv.id, bytes = archive.len(), "configuration version created");
        self.api.upload_configuration(&cv, archive).await?;
        Ok(cv)
    }

    /// Validate `op` and create its run.
    pub async fn create_run(
        &self,
        op: &Operation,
        workspace: &Workspace,
        cv: Option<&ConfigurationVersion>,
    ) -> Result<Run, RunError> {
        self.validate(op, workspace)?;

        let request = CreateRunRequest {
            workspace_id: workspace.id.clone(),
            configuration_version_id: cv.map(|c| c.id.clone()),
            message: RUN_MESSAGE.to_string(),
            is_destroy: op.plan_mode == PlanMode::Destroy,
            refresh: op.refresh,
            refresh_only: op.plan_mode == PlanMode::RefreshOnly,
            plan_only: op.kind == OperationKind::Plan,
            target_addrs: op.targets.clone(),
            replace_addrs: op.replace.clone(),
            variables: op
                .variables
                .iter()
                .map(|v| RunVariable {
                    key: v.name.clone(),
                    value: v.value.clone(),
                })
                .collect(),
        };
        let run = self.api.create_run(request).await?;
        tracing::info!(run_id = %run.id, workspace = %workspace.name, "run created");
        Ok(run)
    }

    pub async fn poll(&self, run_id: &str) -> Result<Run, ApiError> {
        let run = self.api.read_run(run_id).await?;
        tracing::debug!(run_id, status = %run.status, "polled run");
        Ok(run)
    }

    /// Poll until `done` holds for the run, backing off between polls.
    ///
    /// `on_poll` sees every intermediate run, e.g. to report queue position.
    pub async fn poll_until<F, P>(
        &self,
        run_id: &str,
        cancel: &CancellationToken,
        mut done: F,
        mut on_poll: P,
    ) -> Result<Run, RunError>
    where
        F: FnMut(&Run) -> bool,
        P: FnMut(&Run),
    {
        let mut backoff = self.poll.backoff();
        loop {
            if cancel.is_cancelled() {
                return Err(RunError::Canceled);
            }
            let run = self.poll(run_id).await?;
            if done(&run) {
                return Ok(run);
            }
            on_poll(&run);
            if !sleep_or_cancel(backoff.next_delay(), cancel).await {
                return Err(RunError::Canceled);
            }
        }
    }

    pub async fn apply(&self, run_id: &str, comment: Option<&str>) -> Result<(), ApiError> {
        tracing::info!(run_id, "confirming run");
        self.api.apply_run(run_id, comment).await
    }

    pub async fn discard(&self, run_id: &str, comment: Option<&str>) -> Result<(), ApiError> {
        tracing::info!(run_id, "discarding run");
        self.api.discard_run(run_id, comment).await
    }

    pub async fn cancel(&self, run_id: &str, comment: Option<&str>) -> Result<(), ApiError> {
        tracing::info!(run_id, "canceling run");
        self.api.cancel_run(run_id, comment).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{CloudPlanBookmark, Variable, WorkspaceName};
    use crate::runs::mock::{MockOperation, MockRunsApi};
    use crate::runs::RunStatus;

    fn client(version: ApiVersion) -> (MockRunsApi, RunClient, Workspace) {
        let mock = MockRunsApi::new();
        let ws = mock.add_workspace("acme", "prod");
        let client = RunClient::new(
            Arc::new(mock.clone()),
            version,
            PollSettings::new(Duration::from_millis(1), Duration::from_millis(4)),
        );
        (mock, client, ws)
    }

    fn plan_op() -> Operation {
        Operation::plan(WorkspaceName::new("prod").unwrap(), "/tmp/config")
    }

    fn apply_op() -> Operation {
        Operation::apply(WorkspaceName::new("prod").unwrap(), "/tmp/config")
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let mut b = PollSettings::new(Duration::from_millis(100), Duration::from_millis(300)).backoff();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(300));
        assert_eq!(b.next_delay(), Duration::from_millis(300));
    }

    #[test]
    fn targets_and_excludes_checked_first() {
        let (_, client, mut ws) = client(ApiVersion::new(2, 0));
        ws.permissions.can_queue_run = false;
        let mut op = plan_op();
        op.targets = vec!["null_resource.a".into()];
        op.excludes = vec!["null_resource.b".into()];
        assert_eq!(
            client.validate(&op, &ws),
            Err(Rejection::Invalid(TypeError::TargetsAndExcludes))
        );
    }

    #[test]
    fn excludes_never_supported() {
        let (_, client, ws) = client(ApiVersion::new(9, 9));
        let mut op = apply_op();
        op.excludes = vec!["null_resource.b".into()];
        let err = client.validate(&op, &ws).unwrap_err();
        assert!(err.to_string().contains("-exclude option is not supported"));
    }

    #[test]
    fn version_gates() {
        let (_, old, ws) = client(ApiVersion::new(2, 2));
        let mut op = plan_op();
        op.targets = vec!["null_resource.a".into()];
        assert!(matches!(
            old.validate(&op, &ws),
            Err(Rejection::TargetingUnsupported(_))
        ));

        let (_, v23, ws) = client(ApiVersion::new(2, 3));
        assert!(v23.validate(&op, &ws).is_ok());

        let mut op = plan_op();
        op.refresh = false;
        assert!(matches!(
            v23.validate(&op, &ws),
            Err(Rejection::NoRefreshUnsupported(_))
        ));

        let mut op = plan_op();
        op.plan_mode = PlanMode::RefreshOnly;
        let err = v23.validate(&op, &ws).unwrap_err();
        assert!(err.to_string().contains("Refresh-only mode is not supported"));

        let mut op = plan_op();
        op.replace = vec!["null_resource.a".into()];
        assert!(matches!(
            v23.validate(&op, &ws),
            Err(Rejection::ReplaceUnsupported(_))
        ));

        let (_, v25, ws) = client(ApiVersion::new(2, 5));
        let mut op = plan_op();
        op.variables = vec![Variable::parse("foo=bar").unwrap()];
        let err = v25.validate(&op, &ws).unwrap_err();
        assert!(err.to_string().contains("variables are currently not supported"));
    }

    #[test]
    fn local_only_features_rejected() {
        let (_, client, ws) = client(ApiVersion::new(2, 6));

        let mut op = plan_op();
        op.parallelism = 3;
        let err = client.validate(&op, &ws).unwrap_err();
        assert!(err.to_string().contains("parallelism values are currently not supported"));

        let mut op = apply_op();
        op.plan_file = Some(PlanFile::Local("saved.plan".into()));
        assert_eq!(client.validate(&op, &ws), Err(Rejection::SavedLocalPlan));

        let mut op = plan_op();
        op.plan_file = Some(PlanFile::Local("saved.plan".into()));
        assert_eq!(client.validate(&op, &ws), Err(Rejection::SavedPlanDisplay));

        let mut op = plan_op();
        op.plan_out = Some("out.plan".into());
        let err = client.validate(&op, &ws).unwrap_err();
        assert!(err.to_string().contains("generated plan is currently not supported"));

        let mut op = plan_op();
        op.generate_config_out = Some("generated.tf".into());
        assert_eq!(client.validate(&op, &ws), Err(Rejection::GeneratedConfigOutput));
    }

    #[test]
    fn permissions_and_vcs() {
        let (_, client, mut ws) = self::client(ApiVersion::new(2, 6));
        ws.permissions.can_queue_run = false;
        let err = client.validate(&plan_op(), &ws).unwrap_err();
        assert!(err.is_permission());
        assert!(err.to_string().contains("Insufficient rights to generate a plan"));

        let (_, client, mut ws) = self::client(ApiVersion::new(2, 6));
        ws.permissions.can_queue_apply = false;
        let err = client.validate(&apply_op(), &ws).unwrap_err();
        assert!(err.to_string().contains("Insufficient rights to apply changes"));

        let (_, client, mut ws) = self::client(ApiVersion::new(2, 6));
        ws.vcs_repo = Some("acme/infra".into());
        let err = client.validate(&apply_op(), &ws).unwrap_err();
        assert!(!err.is_permission());
        assert!(err.to_string().contains("not allowed for workspaces with a VCS"));
    }

    #[test]
    fn cloud_plan_host_must_match() {
        let (_, client, ws) = client(ApiVersion::new(2, 6));
        let mut op = apply_op();
        op.plan_file = Some(PlanFile::Cloud(CloudPlanBookmark {
            run_id: "run-1".into(),
            hostname: "other.example.com".into(),
        }));
        assert!(matches!(
            client.validate(&op, &ws),
            Err(Rejection::SavedPlanHostMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn rejected_run_makes_no_remote_calls() {
        let (mock, client, ws) = client(ApiVersion::new(2, 6));
        let mut op = plan_op();
        op.parallelism = 1;
        let err = client.create_run(&op, &ws, None).await.unwrap_err();
        assert!(matches!(err, RunError::Rejected(Rejection::Parallelism)));
        assert!(mock.operations().is_empty());
        assert_eq!(mock.run_count(), 0);
    }

    #[tokio::test]
    async fn create_run_maps_operation() {
        let (mock, client, ws) = client(ApiVersion::new(2, 6));
        let mut op = apply_op();
        op.plan_mode = PlanMode::Destroy;
        op.targets = vec!["null_resource.a".into()];
        op.variables = vec![Variable::parse("region=eu").unwrap()];

        let cv = client.upload(&ws, vec![0u8; 8], false).await.unwrap();
        let run = client.create_run(&op, &ws, Some(&cv)).await.unwrap();
        assert!(run.is_destroy);
        assert!(!run.plan_only);
        assert_eq!(run.target_addrs, vec!["null_resource.a".to_string()]);

        let ops = mock.operations();
        let request = ops
            .iter()
            .find_map(|o| match o {
                MockOperation::CreateRun { request } => Some(request.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(request.configuration_version_id.as_deref(), Some(cv.id.as_str()));
        assert_eq!(request.variables[0].key, "region");
        assert_eq!(request.message, RUN_MESSAGE);
    }

    #[tokio::test]
    async fn poll_until_reaches_status() {
        let (_, client, ws) = client(ApiVersion::new(2, 6));
        let cv = client.upload(&ws, Vec::new(), true).await.unwrap();
        let run = client.create_run(&plan_op(), &ws, Some(&cv)).await.unwrap();
        let cancel = CancellationToken::new();
        let mut seen = 0;
        let run = client
            .poll_until(&run.id, &cancel, |r| r.status.is_terminal(), |_| seen += 1)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::PlannedAndFinished);
        assert!(seen > 0);
    }

    #[tokio::test]
    async fn poll_until_honors_cancel() {
        let (_, client, ws) = client(ApiVersion::new(2, 6));
        let run = client.create_run(&apply_op(), &ws, None).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .poll_until(&run.id, &cancel, |_| false, |_| {})
            .await
            .unwrap_err();
        assert_eq!(err, RunError::Canceled);
    }

    #[test]
    fn run_url_format() {
        assert_eq!(
            run_url("app.stratus.dev", "acme", "prod", "run-1"),
            "https://app.stratus.dev/app/acme/prod/runs/run-1"
        );
    }
}
