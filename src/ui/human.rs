//! ui::human
//!
//! Terminal rendering of view events.

use std::io::Write;

use super::output::Verbosity;
use super::view::{ChangeSummary, Severity, View, ViewEvent};
use crate::runs::{CostEstimate, CostEstimateStatus, PolicyStatus};

const RULE: &str = "------------------------------------------------------------------------";

/// Rendered text for one event and the stream it belongs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    pub to_stderr: bool,
}

impl Rendered {
    fn out(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            to_stderr: false,
        }
    }

    fn err(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            to_stderr: true,
        }
    }
}

fn plan_summary(s: &ChangeSummary) -> String {
    match s.import {
        Some(import) => format!(
            "Plan: {} to import, {} to add, {} to change, {} to destroy.\n",
            import, s.add, s.change, s.destroy
        ),
        None => format!(
            "Plan: {} to add, {} to change, {} to destroy.\n",
            s.add, s.change, s.destroy
        ),
    }
}

fn cost_estimate(ce: &CostEstimate) -> String {
    let mut text = format!("\n{}\n\nCost Estimation:\n\n", RULE);
    match ce.status {
        CostEstimateStatus::Finished => {
            let sign = if ce.delta_monthly_cost.starts_with('-') {
                ""
            } else {
                "+"
            };
            text.push_str(&format!(
                "Resources: {} of {} estimated\n           ${}/mo {}${}\n",
                ce.matched_resources,
                ce.resources,
                ce.proposed_monthly_cost,
                sign,
                ce.delta_monthly_cost
            ));
        }
        CostEstimateStatus::SkippedDueToTargeting => text.push_str(
            "Not available for this plan, because it was created with the -target option.\n",
        ),
        CostEstimateStatus::Errored => text.push_str(&format!(
            "Cost estimation errored: {}\n",
            ce.error_message.as_deref().unwrap_or("unknown error")
        )),
        CostEstimateStatus::Canceled => text.push_str("Cost estimation canceled.\n"),
        CostEstimateStatus::Pending | CostEstimateStatus::Queued => {
            text.push_str("Waiting for cost estimate to complete...\n")
        }
    }
    text
}

fn policy_status_text(status: PolicyStatus) -> &'static str {
    match status {
        PolicyStatus::Pending => "pending",
        PolicyStatus::Queued => "queued",
        PolicyStatus::Passed => "passed",
        PolicyStatus::SoftFailed => "soft failed",
        PolicyStatus::HardFailed => "hard failed",
        PolicyStatus::Overridden => "overridden",
        PolicyStatus::Errored => "errored",
        PolicyStatus::Canceled => "canceled",
    }
}

/// Render one event the way the terminal shows it.
pub fn render(event: &ViewEvent) -> Rendered {
    match event {
        ViewEvent::Header { verb, run_url } => {
            let mut text = format!(
                "Running {verb} in the remote backend. Output will stream here. Pressing Ctrl-C\n\
                 will stop streaming the logs, but will not stop the {verb} running remotely.\n\n\
                 Preparing the remote {verb}...\n"
            );
            if let Some(url) = run_url {
                text.push_str(&format!("\nTo view this run in a browser, visit:\n{}\n\n", url));
            }
            Rendered::out(text)
        }
        ViewEvent::QueueWait { runs_ahead } => Rendered::out(format!(
            "Waiting for {} run(s) to finish before being queued...\n",
            runs_ahead
        )),
        ViewEvent::WorkingDirectory { dir } => Rendered::out(format!(
            "The remote workspace is configured to work with configuration at\n\
             {dir} relative to the target repository.\n\n\
             Stratus will upload the repository root and run from {dir}.\n\n"
        )),
        ViewEvent::Output { line } => Rendered::out(format!("{}\n", line)),
        ViewEvent::PlanSummary(summary) => Rendered::out(plan_summary(summary)),
        ViewEvent::ApplySummary(s) => Rendered::out(format!(
            "Apply complete! Resources: {} added, {} changed, {} destroyed.\n",
            s.add, s.change, s.destroy
        )),
        ViewEvent::NoChanges => Rendered::out("No changes. Infrastructure is up-to-date.\n"),
        ViewEvent::Structured {
            severity: Severity::Error,
            message,
            ..
        } => Rendered::err(format!("Error: {}\n", message)),
        ViewEvent::Structured {
            severity: Severity::Warning,
            message,
            ..
        } => Rendered::err(format!("Warning: {}\n", message)),
        ViewEvent::Structured { message, .. } => Rendered::out(format!("{}\n", message)),
        ViewEvent::CostEstimate(ce) => Rendered::out(cost_estimate(ce)),
        ViewEvent::PolicyCheckHeader {
            scope,
            index,
            total,
        } => {
            let title = if *total > 1 {
                format!("{} policy check #{}:", scope, index + 1)
            } else {
                format!("{} policy check:", scope)
            };
            Rendered::out(format!("\n{}\n\n{}\n", RULE, title))
        }
        ViewEvent::PolicyResult { scope, status } => match status {
            PolicyStatus::Passed => Rendered::out(""),
            PolicyStatus::SoftFailed => {
                Rendered::out(format!("\n{} policy check soft failed.\n", scope))
            }
            other => Rendered::out(format!(
                "\n{} policy check status: {}\n",
                scope,
                policy_status_text(*other)
            )),
        },
        ViewEvent::PolicyOverridden => Rendered::out("\nPolicy check overridden.\n"),
        ViewEvent::ExternallyResolved { approved: true } => {
            Rendered::out("\nRun approved using the UI or API.\n")
        }
        ViewEvent::ExternallyResolved { approved: false } => {
            Rendered::out("\nRun discarded using the UI or API.\n")
        }
        ViewEvent::ApplyStarted => Rendered::out(format!("\n{}\n\n", RULE)),
        ViewEvent::Warning { message } => Rendered::err(format!("\nWarning: {}\n", message)),
        ViewEvent::Error { message } => Rendered::err(format!("\nError: {}\n", message)),
    }
}

/// Terminal view.
#[derive(Debug, Clone, Copy)]
pub struct HumanView {
    verbosity: Verbosity,
}

impl HumanView {
    pub fn new(verbosity: Verbosity) -> Self {
        Self { verbosity }
    }
}

impl View for HumanView {
    fn emit(&self, event: ViewEvent) {
        let rendered = render(&event);
        if rendered.text.is_empty() {
            return;
        }
        // Write errors are ignored: a closed pipe must not fail the operation.
        if rendered.to_stderr {
            let _ = std::io::stderr().write_all(rendered.text.as_bytes());
        } else if self.verbosity != Verbosity::Quiet {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(rendered.text.as_bytes());
            let _ = out.flush();
        }
    }
}
