//! engine::confirm
//!
//! Asking for a decision while the run can still be decided elsewhere.
//!
//! # Architecture
//!
//! [`confirm`] spawns two tasks:
//!
//! 1. a prompt task that asks the [`Prompter`] and sends the answer on a
//!    oneshot channel
//! 2. a watch task that polls the run and sends it on a second oneshot as
//!    soon as its status moves away from the status it was parked in
//!
//! Both channels are raced against the stop signals (including the
//! lock-timeout deadline). Whichever resolves first wins and both tasks are
//! aborted before returning, so an abandoned prompt never answers later.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;

use super::handle::{StopReason, StopSignals};
use crate::runs::{ApiError, Run, RunClient, RunError, RunStatus};
use crate::ui::prompts::{PromptError, PromptRequest, Prompter};

/// Outcome of a confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// The accepted answer was given.
    Approved,
    /// Any other answer.
    Declined,
    /// The run moved on without us; carries the run as last seen.
    ExternallyResolved(Run),
    Stopped(StopReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfirmError {
    #[error("Failed asking for confirmation: {0}")]
    Prompt(#[from] PromptError),

    #[error("Failed watching the run: {0}")]
    Api(#[from] ApiError),
}

/// A question about a parked run.
#[derive(Debug, Clone)]
pub struct ConfirmRequest {
    pub prompt: PromptRequest,
    /// The only answer that approves.
    pub accept: &'static str,
    pub run_id: String,
    /// Status the run is parked in while we ask.
    pub parked: RunStatus,
}

impl ConfirmRequest {
    /// Approval before applying a plan.
    pub fn apply(run: &Run, workspace: &str, destroy: bool) -> Self {
        let query = if destroy {
            format!(
                "\nDo you really want to destroy all resources in workspace \"{}\"?",
                workspace
            )
        } else {
            format!("\nDo you want to perform these actions in workspace \"{}\"?", workspace)
        };
        let description = if destroy {
            "Stratus will destroy all your managed infrastructure, as shown above.\n\
             There is no undo. Only 'yes' will be accepted to confirm."
        } else {
            "Stratus will perform the actions described above.\n\
             Only 'yes' will be accepted to approve."
        };
        Self {
            prompt: PromptRequest::new("approve", query, description),
            accept: "yes",
            run_id: run.id.clone(),
            parked: run.status,
        }
    }

    /// Override of a soft-failed policy check.
    pub fn policy_override(run: &Run) -> Self {
        Self {
            prompt: PromptRequest::new(
                "override",
                "\nDo you want to override the soft failed policy check?",
                "Only 'override' will be accepted to override.",
            ),
            accept: "override",
            run_id: run.id.clone(),
            parked: run.status,
        }
    }
}

/// Ask `request`, racing the answer against the run changing elsewhere
/// and against the stop signals.
///
/// The lock timeout counts from when the question is asked.
pub async fn confirm(
    client: &RunClient,
    prompter: &Arc<dyn Prompter>,
    request: ConfirmRequest,
    signals: &StopSignals,
) -> Result<Confirmation, ConfirmError> {
    let deadline = signals.deadline();
    let (answer_tx, answer_rx) = oneshot::channel();
    let prompt_task = {
        let prompter = Arc::clone(prompter);
        let prompt = request.prompt.clone();
        tokio::spawn(async move {
            let _ = answer_tx.send(prompter.ask(&prompt).await);
        })
    };

    let (status_tx, status_rx) = oneshot::channel();
    let watch_task = {
        let client = client.clone();
        let run_id = request.run_id.clone();
        let parked = request.parked;
        let cancel = signals.cancel_token().child_token();
        tokio::spawn(async move {
            let result = client
                .poll_until(&run_id, &cancel, |run| run.status != parked, |_| {})
                .await;
            let _ = status_tx.send(result);
        })
    };

    tracing::debug!(prompt = %request.prompt.id, run_id = %request.run_id, "waiting for confirmation");
    let outcome = tokio::select! {
        answer = answer_rx => match answer {
            Ok(Ok(text)) if text.trim() == request.accept => Ok(Confirmation::Approved),
            Ok(Ok(_)) => Ok(Confirmation::Declined),
            Ok(Err(e)) => Err(ConfirmError::Prompt(e)),
            Err(_) => Err(ConfirmError::Prompt(PromptError::Cancelled)),
        },
        status = status_rx => match status {
            Ok(Ok(run)) => Ok(Confirmation::ExternallyResolved(run)),
            Ok(Err(RunError::Api(e))) => Err(ConfirmError::Api(e)),
            Ok(Err(_)) | Err(_) => Ok(Confirmation::Stopped(StopReason::Cancel)),
        },
        reason = signals.interrupted(deadline) => Ok(Confirmation::Stopped(reason)),
    };

    prompt_task.abort();
    watch_task.abort();
    tracing::debug!(prompt = %request.prompt.id, outcome = ?outcome, "confirmation resolved");
    outcome
}
