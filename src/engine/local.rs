//! engine::local
//!
//! The local execution branch.
//!
//! When a workspace does not run operations remotely, or local execution
//! is forced, the engine hands the operation to a [`LocalExecution`]. The
//! engine still holds the state lock around it; the local tool is told not
//! to lock again.

use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::logs::LogParser;
use crate::core::state::StateSnapshot;
use crate::core::types::{Operation, OperationKind, PlanMode, DEFAULT_PARALLELISM};
use crate::ui::view::{View, ViewEvent};

#[derive(Debug, Error)]
pub enum LocalError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed reading {program} output: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {code}")]
    Failed { program: String, code: i32 },

    #[error("local execution canceled")]
    Canceled,
}

/// What a local run reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalOutcome {
    pub plan_empty: bool,
    pub state: Option<StateSnapshot>,
}

/// Runs an operation on this machine.
#[async_trait]
pub trait LocalExecution: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        op: &Operation,
        view: &dyn View,
        cancel: &CancellationToken,
    ) -> Result<LocalOutcome, LocalError>;
}

/// Tracks whether streamed output reported any changes.
#[derive(Debug, Default)]
struct ChangeTracker {
    has_changes: bool,
}

impl ChangeTracker {
    fn observe(&mut self, event: &ViewEvent) {
        if let ViewEvent::PlanSummary(s) | ViewEvent::ApplySummary(s) = event {
            self.has_changes |= s.add + s.change + s.destroy + s.import.unwrap_or(0) > 0;
        }
    }

    fn plan_empty(&self) -> bool {
        !self.has_changes
    }
}

/// Runs the local tool binary.
#[derive(Debug, Clone)]
pub struct CommandExecution {
    program: String,
}

impl CommandExecution {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Command-line arguments for `op`.
    pub fn args(op: &Operation) -> Vec<String> {
        let mut args = vec![match op.kind {
            OperationKind::Plan => "plan".to_string(),
            OperationKind::Apply => "apply".to_string(),
        }];
        args.push("-input=false".to_string());
        args.push("-lock=false".to_string());
        match op.plan_mode {
            PlanMode::Destroy => args.push("-destroy".to_string()),
            PlanMode::RefreshOnly => args.push("-refresh-only".to_string()),
            PlanMode::Normal => {}
        }
        if !op.refresh {
            args.push("-refresh=false".to_string());
        }
        if op.kind == OperationKind::Apply && op.auto_approve {
            args.push("-auto-approve".to_string());
        }
        if op.parallelism != DEFAULT_PARALLELISM {
            args.push(format!("-parallelism={}", op.parallelism));
        }
        args.extend(op.targets.iter().map(|t| format!("-target={}", t)));
        args.extend(op.excludes.iter().map(|e| format!("-exclude={}", e)));
        args.extend(op.replace.iter().map(|r| format!("-replace={}", r)));
        for var in &op.variables {
            args.push("-var".to_string());
            args.push(format!("{}={}", var.name, var.value));
        }
        args
    }
}

#[async_trait]
impl LocalExecution for CommandExecution {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn execute(
        &self,
        op: &Operation,
        view: &dyn View,
        cancel: &CancellationToken,
    ) -> Result<LocalOutcome, LocalError> {
        let args = Self::args(op);
        tracing::info!(program = %self.program, ?args, dir = %op.config_dir.display(), "running locally");

        let mut child = Command::new(&self.program)
            .args(&args)
            .current_dir(&op.config_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LocalError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let parser = LogParser::new();
        let mut tracker = ChangeTracker::default();
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = tokio::select! {
                    line = lines.next_line() => line.map_err(|source| LocalError::Io {
                        program: self.program.clone(),
                        source,
                    })?,
                    _ = cancel.cancelled() => {
                        let _ = child.kill().await;
                        return Err(LocalError::Canceled);
                    }
                };
                let Some(line) = line else { break };
                let event = parser.parse(&line);
                tracker.observe(&event);
                view.emit(event);
            }
        }

        let status = tokio::select! {
            status = child.wait() => status.map_err(|source| LocalError::Io {
                program: self.program.clone(),
                source,
            })?,
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(LocalError::Canceled);
            }
        };
        if !status.success() {
            return Err(LocalError::Failed {
                program: self.program.clone(),
                code: status.code().unwrap_or(-1),
            });
        }
        Ok(LocalOutcome {
            plan_empty: tracker.plan_empty(),
            state: None,
        })
    }
}

/// Local execution that replays fixed output.
///
/// Clones share the call record.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecution {
    output: Vec<String>,
    state: Option<StateSnapshot>,
    fail_with: Option<i32>,
    calls: Arc<Mutex<Vec<OperationKind>>>,
}

impl ScriptedExecution {
    pub fn new<'a>(output: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            output: output.into_iter().map(str::to_string).collect(),
            ..Default::default()
        }
    }

    pub fn with_state(mut self, state: StateSnapshot) -> Self {
        self.state = Some(state);
        self
    }

    pub fn failing(mut self, code: i32) -> Self {
        self.fail_with = Some(code);
        self
    }

    /// Operation kinds executed so far.
    pub fn calls(&self) -> Vec<OperationKind> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LocalExecution for ScriptedExecution {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn execute(
        &self,
        op: &Operation,
        view: &dyn View,
        cancel: &CancellationToken,
    ) -> Result<LocalOutcome, LocalError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(op.kind);
        }
        let parser = LogParser::new();
        let mut tracker = ChangeTracker::default();
        for line in &self.output {
            if cancel.is_cancelled() {
                return Err(LocalError::Canceled);
            }
            let event = parser.parse(line);
            tracker.observe(&event);
            view.emit(event);
        }
        if let Some(code) = self.fail_with {
            return Err(LocalError::Failed {
                program: "scripted".to_string(),
                code,
            });
        }
        let state = match op.kind {
            OperationKind::Apply => self.state.clone(),
            OperationKind::Plan => None,
        };
        Ok(LocalOutcome {
            plan_empty: tracker.plan_empty(),
            state,
        })
    }
}
