//! ui::view
//!
//! Structured progress events and the renderers that consume them.
//!
//! # Design
//!
//! The engine never writes to a terminal. It emits [`ViewEvent`]s into a
//! [`View`], and the view decides how they look:
//! - [`crate::ui::human::HumanView`] - terminal text
//! - [`crate::ui::json::JsonView`] - one JSON object per line
//! - [`RecordingView`] - keeps events in memory for tests

use std::sync::{Arc, Mutex};

use serde::Serialize;

use super::human;
use crate::runs::{CostEstimate, PolicyScope, PolicyStatus};

/// Resource counts from a plan or apply summary line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ChangeSummary {
    pub add: u32,
    pub change: u32,
    pub destroy: u32,
    /// Only present in plan summaries that import resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import: Option<u32>,
}

/// Severity of a structured log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Progress event emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewEvent {
    /// A remote operation is starting.
    Header {
        verb: String,
        run_url: Option<String>,
    },
    /// The run is queued behind other runs.
    QueueWait { runs_ahead: usize },
    /// The workspace uploads from a working directory.
    WorkingDirectory { dir: String },
    /// A plain log line from the remote run.
    Output { line: String },
    PlanSummary(ChangeSummary),
    ApplySummary(ChangeSummary),
    NoChanges,
    /// A record from a machine-readable log stream.
    Structured {
        kind: String,
        severity: Severity,
        message: String,
    },
    CostEstimate(CostEstimate),
    PolicyCheckHeader {
        scope: PolicyScope,
        index: usize,
        total: usize,
    },
    PolicyResult {
        scope: PolicyScope,
        status: PolicyStatus,
    },
    /// A soft-failed policy check was overridden.
    PolicyOverridden,
    /// The run was confirmed or discarded outside this client.
    ExternallyResolved { approved: bool },
    /// The apply was confirmed here.
    ApplyStarted,
    Warning { message: String },
    Error { message: String },
}

/// Receiver of engine progress events.
///
/// # Thread Safety
///
/// Views are shared between the operation task and the caller, so they
/// must be `Send + Sync` and use interior mutability.
pub trait View: Send + Sync {
    fn emit(&self, event: ViewEvent);

    fn warning(&self, message: &str) {
        self.emit(ViewEvent::Warning {
            message: message.to_string(),
        });
    }

    fn error(&self, message: &str) {
        self.emit(ViewEvent::Error {
            message: message.to_string(),
        });
    }
}

/// A view that records every event.
///
/// Rendered text is available through [`RecordingView::stdout`] and
/// [`RecordingView::stderr`], using the same formatting as the terminal.
#[derive(Debug, Clone, Default)]
pub struct RecordingView {
    events: Arc<Mutex<Vec<ViewEvent>>>,
}

impl RecordingView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ViewEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn stdout(&self) -> String {
        self.render(false)
    }

    pub fn stderr(&self) -> String {
        self.render(true)
    }

    /// Everything rendered, stdout and stderr interleaved in emit order.
    pub fn output(&self) -> String {
        self.events()
            .iter()
            .map(|event| human::render(event).text)
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.output().contains(needle)
    }

    fn render(&self, to_stderr: bool) -> String {
        self.events()
            .iter()
            .map(human::render)
            .filter(|rendered| rendered.to_stderr == to_stderr)
            .map(|rendered| rendered.text)
            .collect()
    }
}

impl View for RecordingView {
    fn emit(&self, event: ViewEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
