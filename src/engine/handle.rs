//! engine::handle
//!
//! The caller's side of a running operation.
//!
//! # Design
//!
//! [`crate::engine::Engine::start`] spawns one task per operation and hands
//! back an [`OperationHandle`] immediately. The handle can ask the task to
//! stop (graceful: the user may still be asked whether to cancel the remote
//! run) or to cancel (hard: the remote run is canceled without asking), and
//! `wait()` resolves with the final [`RunResult`] once the task has released
//! its state lock.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::types::{Failure, FailureKind, Phase, RunResult};

/// Why an operation left its normal path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Graceful stop requested by the user.
    Interrupt,
    /// Hard cancel requested by the user.
    Cancel,
    /// The lock timeout elapsed while waiting on the remote run.
    LockTimeout,
}

/// Stop and cancel tokens plus the optional lock timeout for timed waits.
///
/// Cloned into every wait inside the operation task.
#[derive(Debug, Clone, Default)]
pub struct StopSignals {
    stop: CancellationToken,
    cancel: CancellationToken,
    wait_timeout: Option<Duration>,
}

impl StopSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the queue and confirmation waits. A zero timeout never expires.
    pub fn set_wait_timeout(&mut self, timeout: Duration) {
        self.wait_timeout = (!timeout.is_zero()).then_some(timeout);
    }

    /// Deadline for a timed wait starting now.
    pub fn deadline(&self) -> Option<Instant> {
        self.wait_timeout.map(|timeout| Instant::now() + timeout)
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Hard cancel. Also counts as a stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.stop.cancel();
    }

    /// Token that fires on any stop, graceful or hard.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Token that fires on hard cancel only.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolve when the operation should leave its current wait.
    ///
    /// `deadline` comes from [`StopSignals::deadline`] taken when the wait
    /// began; untimed waits pass `None`.
    pub async fn interrupted(&self, deadline: Option<Instant>) -> StopReason {
        let deadline = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => StopReason::Cancel,
            _ = self.stop.cancelled() => StopReason::Interrupt,
            _ = deadline => StopReason::LockTimeout,
        }
    }
}

/// Handle to a running operation.
#[derive(Debug)]
pub struct OperationHandle {
    id: Uuid,
    signals: StopSignals,
    task: JoinHandle<RunResult>,
}

impl OperationHandle {
    pub(crate) fn new(id: Uuid, signals: StopSignals, task: JoinHandle<RunResult>) -> Self {
        Self { id, signals, task }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Ask the operation to stop. Interactive operations may ask whether
    /// to cancel the remote run.
    pub fn stop(&self) {
        tracing::debug!(operation_id = %self.id, "stop requested");
        self.signals.stop();
    }

    /// Cancel the operation and its remote run without asking.
    pub fn cancel(&self) {
        tracing::debug!(operation_id = %self.id, "cancel requested");
        self.signals.cancel();
    }

    /// Signals that outlive [`OperationHandle::wait`], for interrupt handlers.
    pub fn signals(&self) -> StopSignals {
        self.signals.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the final result.
    pub async fn wait(self) -> RunResult {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(operation_id = %self.id, error = %e, "operation task failed");
                RunResult::failure(
                    Phase::Errored,
                    true,
                    Failure::new(FailureKind::Local, format!("operation task failed: {}", e)),
                )
            }
        }
    }
}
