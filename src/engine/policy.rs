//! engine::policy
//!
//! Policy check evaluation and the soft-fail override flow.
//!
//! # States
//!
//! ```text
//! pending -> passed       proceed
//! pending -> hard failed  fail, whatever the approval flags say
//! pending -> soft failed  override (auto-approve or "override" answer),
//!                         otherwise fail with the plan kept
//! ```
//!
//! Plan-only operations never override: a soft failure fails them.

use std::sync::Arc;

use thiserror::Error;

use super::confirm::{confirm, ConfirmError, ConfirmRequest, Confirmation};
use super::handle::{StopReason, StopSignals};
use super::logs::{LogError, LogStream};
use crate::core::types::{Operation, OperationKind};
use crate::runs::{ApiError, LogSource, PolicyCheck, PolicyStatus, Run, RunClient, RunStatus};
use crate::ui::prompts::Prompter;
use crate::ui::view::{View, ViewEvent};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("Failed to read policy check: {0}")]
    Api(#[from] ApiError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Confirm(#[from] ConfirmError),
}

/// Result of evaluating every policy check on a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOutcome {
    /// All checks passed or were overridden.
    Passed,
    HardFailed(String),
    SoftFailed(String),
    /// The run was discarded or otherwise finished while we asked.
    ExternallyResolved(Run),
    Stopped(StopReason),
}

/// Evaluates a run's policy checks in order.
pub struct PolicyGate<'a> {
    client: &'a RunClient,
    view: &'a dyn View,
    prompter: &'a Arc<dyn Prompter>,
    signals: &'a StopSignals,
}

impl<'a> PolicyGate<'a> {
    pub fn new(
        client: &'a RunClient,
        view: &'a dyn View,
        prompter: &'a Arc<dyn Prompter>,
        signals: &'a StopSignals,
    ) -> Self {
        Self {
            client,
            view,
            prompter,
            signals,
        }
    }

    pub async fn evaluate(&self, op: &Operation, run: &Run) -> Result<PolicyOutcome, PolicyError> {
        let total = run.policy_check_ids.len();
        for (index, id) in run.policy_check_ids.iter().enumerate() {
            let check = match self.settled(id).await? {
                Ok(check) => check,
                Err(reason) => return Ok(PolicyOutcome::Stopped(reason)),
            };
            tracing::debug!(run_id = %run.id, policy_check = %id, status = ?check.status, "policy check settled");

            self.view.emit(ViewEvent::PolicyCheckHeader {
                scope: check.scope,
                index,
                total,
            });
            if let Some(reason) = self.show_log(run, id).await? {
                return Ok(PolicyOutcome::Stopped(reason));
            }
            self.view.emit(ViewEvent::PolicyResult {
                scope: check.scope,
                status: check.status,
            });

            match check.status {
                PolicyStatus::Passed | PolicyStatus::Overridden => {}
                PolicyStatus::SoftFailed => match self.soft_failed(op, run, &check).await? {
                    PolicyOutcome::Passed => {}
                    other => return Ok(other),
                },
                PolicyStatus::Errored => {
                    return Ok(PolicyOutcome::HardFailed(format!(
                        "{} policy check errored.",
                        check.scope
                    )))
                }
                _ => {
                    return Ok(PolicyOutcome::HardFailed(format!(
                        "{} policy check hard failed.",
                        check.scope
                    )))
                }
            }
        }
        Ok(PolicyOutcome::Passed)
    }

    /// Poll a check until it has a result.
    async fn settled(&self, id: &str) -> Result<Result<PolicyCheck, StopReason>, PolicyError> {
        let mut backoff = self.client.poll_settings().backoff();
        loop {
            let check = self.client.api().read_policy_check(id).await?;
            if check.status.is_settled() {
                return Ok(Ok(check));
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff.next_delay()) => {}
                reason = self.signals.interrupted(None) => return Ok(Err(reason)),
            }
        }
    }

    async fn show_log(&self, run: &Run, id: &str) -> Result<Option<StopReason>, PolicyError> {
        let mut stream = LogStream::new(
            Arc::clone(self.client.api()),
            &run.id,
            LogSource::PolicyCheck(id.to_string()),
            self.client.poll_settings(),
        );
        loop {
            tokio::select! {
                line = stream.next_line(self.signals.cancel_token()) => match line {
                    Ok(Some(line)) => self.view.emit(ViewEvent::Output { line: line.text }),
                    Ok(None) => return Ok(None),
                    Err(LogError::Canceled) => return Ok(Some(StopReason::Cancel)),
                    Err(e) => return Err(e.into()),
                },
                reason = self.signals.interrupted(None) => return Ok(Some(reason)),
            }
        }
    }

    async fn soft_failed(
        &self,
        op: &Operation,
        run: &Run,
        check: &PolicyCheck,
    ) -> Result<PolicyOutcome, PolicyError> {
        let failed = || PolicyOutcome::SoftFailed(format!("{} policy check soft failed.", check.scope));

        if op.kind == OperationKind::Plan || !(check.overridable && check.can_override) {
            return Ok(failed());
        }

        if op.auto_approve {
            self.override_check(check).await?;
            return Ok(PolicyOutcome::Passed);
        }

        if !self.prompter.is_interactive() {
            return Ok(failed());
        }

        // Ask against the run's current status so an override made
        // elsewhere is noticed.
        let parked = self.client.poll(&run.id).await?;
        let request = ConfirmRequest::policy_override(&parked);
        match confirm(self.client, self.prompter, request, self.signals).await? {
            Confirmation::Approved => {
                self.override_check(check).await?;
                Ok(PolicyOutcome::Passed)
            }
            Confirmation::Declined => Ok(failed()),
            Confirmation::ExternallyResolved(run) => match run.status {
                RunStatus::Discarded | RunStatus::Canceled | RunStatus::ForceCanceled | RunStatus::Errored => {
                    Ok(PolicyOutcome::ExternallyResolved(run))
                }
                _ => {
                    tracing::info!(run_id = %run.id, status = %run.status, "policy check overridden elsewhere");
                    self.view.emit(ViewEvent::PolicyOverridden);
                    Ok(PolicyOutcome::Passed)
                }
            },
            Confirmation::Stopped(reason) => Ok(PolicyOutcome::Stopped(reason)),
        }
    }

    async fn override_check(&self, check: &PolicyCheck) -> Result<(), PolicyError> {
        tracing::info!(policy_check = %check.id, "overriding soft failed policy check");
        self.client.api().override_policy_check(&check.id).await?;
        self.view.emit(ViewEvent::PolicyOverridden);
        Ok(())
    }
}
