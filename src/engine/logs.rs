//! engine::logs
//!
//! Incremental consumption of remote run logs.
//!
//! # Design
//!
//! A [`LogStream`] reads one log (plan, apply or a policy check) from a
//! byte offset, splits it into lines and hands them out one at a time. It
//! is finite: once the service reports the log complete and every line has
//! been handed out, [`LogStream::next_line`] returns `Ok(None)`.
//!
//! Readiness is decided here and nowhere else. An unterminated trailing
//! line, or fewer lines than the stream's preamble, means "poll again",
//! never an error. Whether the run itself has finished is the caller's
//! business.
//!
//! [`LogParser`] turns raw lines into [`ViewEvent`]s: change summaries,
//! "No changes.", machine-readable JSON records, or plain output.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::runs::facade::{sleep_or_cancel, Backoff};
use crate::runs::{ApiError, LogSource, PollSettings, RunsApi};
use crate::ui::view::{ChangeSummary, Severity, ViewEvent};

/// Lines at the top of an apply log that repeat the plan preamble.
pub const APPLY_PREAMBLE_LINES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("failed to read {source_name} log: {error}")]
    Api { source_name: String, error: ApiError },

    #[error("log streaming canceled")]
    Canceled,
}

/// One complete line of log output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub text: String,
    /// Byte offset just past this line; a stream restarted here resumes
    /// with the next line.
    pub end_offset: usize,
}

/// Lazy, restartable reader over one remote log.
pub struct LogStream {
    api: Arc<dyn RunsApi>,
    run_id: String,
    source: LogSource,
    /// Bytes fetched so far.
    fetched: usize,
    /// Bytes handed out (or skipped) so far.
    consumed: usize,
    buffer: String,
    pending: VecDeque<String>,
    skip: usize,
    complete: bool,
    poll: PollSettings,
    backoff: Backoff,
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStream")
            .field("run_id", &self.run_id)
            .field("source", &self.source)
            .field("fetched", &self.fetched)
            .field("consumed", &self.consumed)
            .field("complete", &self.complete)
            .finish()
    }
}

impl LogStream {
    /// Read `source` from the start. Apply logs drop their preamble.
    pub fn new(api: Arc<dyn RunsApi>, run_id: &str, source: LogSource, poll: PollSettings) -> Self {
        let skip = match source {
            LogSource::Apply => APPLY_PREAMBLE_LINES,
            _ => 0,
        };
        Self::build(api, run_id, source, poll, 0, skip)
    }

    /// Resume `source` at a byte offset returned by an earlier stream.
    pub fn from_offset(
        api: Arc<dyn RunsApi>,
        run_id: &str,
        source: LogSource,
        poll: PollSettings,
        offset: usize,
    ) -> Self {
        if offset == 0 {
            return Self::new(api, run_id, source, poll);
        }
        Self::build(api, run_id, source, poll, offset, 0)
    }

    fn build(
        api: Arc<dyn RunsApi>,
        run_id: &str,
        source: LogSource,
        poll: PollSettings,
        offset: usize,
        skip: usize,
    ) -> Self {
        Self {
            api,
            run_id: run_id.to_string(),
            source,
            fetched: offset,
            consumed: offset,
            buffer: String::new(),
            pending: VecDeque::new(),
            skip,
            complete: false,
            backoff: poll.backoff(),
            poll,
        }
    }

    /// Byte offset of the next line to be handed out.
    pub fn offset(&self) -> usize {
        self.consumed
    }

    /// Next complete line, or `None` once the log has ended.
    pub async fn next_line(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<LogLine>, LogError> {
        loop {
            if let Some(line) = self.ready_line() {
                return Ok(Some(line));
            }
            if self.complete {
                return Ok(None);
            }
            if cancel.is_cancelled() {
                return Err(LogError::Canceled);
            }

            let chunk = self
                .api
                .read_logs(&self.run_id, &self.source, self.fetched)
                .await
                .map_err(|error| LogError::Api {
                    source_name: self.source.to_string(),
                    error,
                })?;
            let got_data = !chunk.data.is_empty();
            self.fetched += chunk.data.len();
            self.buffer.push_str(&chunk.data);
            self.split_lines();
            if chunk.complete {
                self.complete = true;
                if !self.buffer.is_empty() {
                    let tail = std::mem::take(&mut self.buffer);
                    self.pending.push_back(tail);
                }
            }

            if got_data || self.complete {
                self.backoff.reset(self.poll.min_interval);
                continue;
            }
            tracing::trace!(run_id = %self.run_id, source = %self.source, offset = self.fetched, "log not ready");
            if !sleep_or_cancel(self.backoff.next_delay(), cancel).await {
                return Err(LogError::Canceled);
            }
        }
    }

    /// Drain the rest of the log.
    pub async fn collect(&mut self, cancel: &CancellationToken) -> Result<Vec<String>, LogError> {
        let mut lines = Vec::new();
        while let Some(line) = self.next_line(cancel).await? {
            lines.push(line.text);
        }
        Ok(lines)
    }

    fn split_lines(&mut self) {
        while let Some(pos) = self.buffer.find('\n') {
            let rest = self.buffer.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buffer, rest);
            line.pop();
            self.pending.push_back(line);
        }
    }

    fn ready_line(&mut self) -> Option<LogLine> {
        if self.skip > 0 {
            if self.pending.len() < self.skip && !self.complete {
                return None;
            }
            let n = self.skip.min(self.pending.len());
            for line in self.pending.drain(..n) {
                self.consumed += line_bytes(&line);
            }
            self.skip = 0;
        }
        let text = self.pending.pop_front()?;
        self.consumed = (self.consumed + line_bytes(&text)).min(self.fetched);
        Some(LogLine {
            text: text.trim_end_matches('\r').to_string(),
            end_offset: self.consumed,
        })
    }
}

fn line_bytes(line: &str) -> usize {
    line.len() + 1
}

fn plan_summary_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^Plan: (?:(\d+) to import, )?(\d+) to add, (\d+) to change, (\d+) to destroy\.",
        )
        .expect("plan summary pattern is valid")
    })
}

fn apply_summary_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^Apply complete! Resources: (?:(\d+) imported, )?(\d+) added, (\d+) changed, (\d+) destroyed\.",
        )
        .expect("apply summary pattern is valid")
    })
}

fn count(caps: &regex::Captures<'_>, i: usize) -> u32 {
    caps.get(i)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// A machine-readable log record.
#[derive(Debug, Deserialize)]
struct JsonRecord {
    #[serde(rename = "@level", default)]
    level: String,
    #[serde(rename = "@message", default)]
    message: String,
    #[serde(rename = "type", default)]
    kind: String,
    changes: Option<JsonChanges>,
    diagnostic: Option<JsonDiagnostic>,
}

#[derive(Debug, Deserialize)]
struct JsonChanges {
    #[serde(default)]
    add: u32,
    #[serde(default)]
    change: u32,
    #[serde(default)]
    remove: u32,
    #[serde(default)]
    import: u32,
    #[serde(default)]
    operation: String,
}

#[derive(Debug, Deserialize)]
struct JsonDiagnostic {
    severity: String,
    summary: String,
    #[serde(default)]
    detail: String,
}

fn severity(level: &str) -> Severity {
    match level {
        "error" => Severity::Error,
        "warn" | "warning" => Severity::Warning,
        _ => Severity::Info,
    }
}

/// Converts raw log lines into view events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogParser;

impl LogParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, line: &str) -> ViewEvent {
        let trimmed = line.trim_start();
        if trimmed.starts_with('{') {
            if let Ok(record) = serde_json::from_str::<JsonRecord>(trimmed) {
                return self.structured(record);
            }
        }

        if let Some(caps) = plan_summary_re().captures(trimmed) {
            return ViewEvent::PlanSummary(ChangeSummary {
                import: caps.get(1).map(|_| count(&caps, 1)),
                add: count(&caps, 2),
                change: count(&caps, 3),
                destroy: count(&caps, 4),
            });
        }
        if let Some(caps) = apply_summary_re().captures(trimmed) {
            return ViewEvent::ApplySummary(ChangeSummary {
                import: caps.get(1).map(|_| count(&caps, 1)),
                add: count(&caps, 2),
                change: count(&caps, 3),
                destroy: count(&caps, 4),
            });
        }
        if trimmed.starts_with("No changes.") {
            return ViewEvent::NoChanges;
        }
        ViewEvent::Output {
            line: line.to_string(),
        }
    }

    fn structured(&self, record: JsonRecord) -> ViewEvent {
        if let Some(changes) = record.changes.filter(|_| record.kind == "change_summary") {
            let summary = ChangeSummary {
                add: changes.add,
                change: changes.change,
                destroy: changes.remove,
                import: (changes.import > 0).then_some(changes.import),
            };
            return if changes.operation == "apply" {
                ViewEvent::ApplySummary(summary)
            } else {
                ViewEvent::PlanSummary(summary)
            };
        }
        if let Some(diag) = record.diagnostic {
            let message = if diag.detail.is_empty() {
                diag.summary
            } else {
                format!("{}: {}", diag.summary, diag.detail)
            };
            return ViewEvent::Structured {
                kind: "diagnostic".to_string(),
                severity: severity(&diag.severity),
                message,
            };
        }
        ViewEvent::Structured {
            kind: record.kind,
            severity: severity(&record.level),
            message: record.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::mock::{
        MockRunsApi, APPLY_ONE_RESOURCE_ADDED, PLAN_ONE_RESOURCE_ADD,
    };
    use crate::runs::{CreateRunRequest, RunsApi};
    use proptest::prelude::*;
    use std::time::Duration;

    fn fast() -> PollSettings {
        PollSettings::new(Duration::from_millis(1), Duration::from_millis(5))
    }

    async fn planned_run(api: &MockRunsApi, plan_only: bool) -> String {
        let ws = api.add_workspace("acme", "prod");
        let run = api
            .create_run(CreateRunRequest {
                workspace_id: ws.id,
                plan_only,
                refresh: true,
                ..Default::default()
            })
            .await
            .unwrap();
        api.read_run(&run.id).await.unwrap();
        run.id
    }

    mod stream {
        use super::*;

        #[tokio::test]
        async fn reads_whole_plan_log_in_small_chunks() {
            let mock = MockRunsApi::new().with_chunk_size(7);
            let run_id = planned_run(&mock, true).await;
            let mut stream = LogStream::new(Arc::new(mock), &run_id, LogSource::Plan, fast());

            let lines = stream.collect(&CancellationToken::new()).await.unwrap();
            let expected: Vec<&str> = PLAN_ONE_RESOURCE_ADD.lines().collect();
            assert_eq!(lines, expected);
            assert_eq!(stream.offset(), PLAN_ONE_RESOURCE_ADD.len());
        }

        #[tokio::test]
        async fn apply_log_skips_preamble() {
            let mock = MockRunsApi::new();
            let run_id = planned_run(&mock, false).await;
            // Move the run to Planned, then confirm it.
            let api: Arc<dyn RunsApi> = Arc::new(mock.clone());
            let mut plan = LogStream::new(api.clone(), &run_id, LogSource::Plan, fast());
            plan.collect(&CancellationToken::new()).await.unwrap();
            while !mock.peek_run(&run_id).unwrap().status.awaits_decision() {
                api.read_run(&run_id).await.unwrap();
            }
            api.apply_run(&run_id, None).await.unwrap();

            let mut apply = LogStream::new(api, &run_id, LogSource::Apply, fast());
            let lines = apply.collect(&CancellationToken::new()).await.unwrap();
            let expected: Vec<&str> = APPLY_ONE_RESOURCE_ADDED
                .lines()
                .skip(APPLY_PREAMBLE_LINES)
                .collect();
            assert_eq!(lines, expected);
        }

        #[tokio::test]
        async fn resumes_from_offset() {
            let mock = MockRunsApi::new().with_chunk_size(5);
            let run_id = planned_run(&mock, true).await;
            let api: Arc<dyn RunsApi> = Arc::new(mock);
            let cancel = CancellationToken::new();

            let mut first = LogStream::new(api.clone(), &run_id, LogSource::Plan, fast());
            let one = first.next_line(&cancel).await.unwrap().unwrap();
            let two = first.next_line(&cancel).await.unwrap().unwrap();

            let mut resumed = LogStream::from_offset(
                api,
                &run_id,
                LogSource::Plan,
                fast(),
                one.end_offset,
            );
            let again = resumed.next_line(&cancel).await.unwrap().unwrap();
            assert_eq!(again.text, two.text);
        }

        #[tokio::test]
        async fn canceled_while_waiting() {
            let mock = MockRunsApi::new();
            let ws = mock.add_workspace("acme", "prod");
            // Never advanced: the plan log stays empty.
            let run = mock
                .create_run(CreateRunRequest {
                    workspace_id: ws.id,
                    plan_only: true,
                    ..Default::default()
                })
                .await
                .unwrap();
            let cancel = CancellationToken::new();
            let mut stream = LogStream::new(Arc::new(mock), &run.id, LogSource::Plan, fast());
            let waiter = {
                let cancel = cancel.clone();
                tokio::spawn(async move { stream.next_line(&cancel).await })
            };
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
            assert_eq!(waiter.await.unwrap(), Err(LogError::Canceled));
        }

        #[tokio::test]
        async fn read_errors_are_reported() {
            let mock = MockRunsApi::new()
                .fail_on(crate::runs::mock::FailOn::ReadLogs(ApiError::Network("reset".into())));
            let mut stream = LogStream::new(Arc::new(mock), "run-x", LogSource::Plan, fast());
            let err = stream.next_line(&CancellationToken::new()).await.unwrap_err();
            assert!(matches!(err, LogError::Api { .. }));
        }
    }

    mod parser {
        use super::*;

        #[test]
        fn plan_summary() {
            let event = LogParser::new().parse("Plan: 1 to add, 0 to change, 0 to destroy.");
            assert_eq!(
                event,
                ViewEvent::PlanSummary(ChangeSummary {
                    add: 1,
                    change: 0,
                    destroy: 0,
                    import: None,
                })
            );
        }

        #[test]
        fn plan_summary_with_import() {
            let event =
                LogParser::new().parse("Plan: 2 to import, 1 to add, 0 to change, 0 to destroy.");
            assert!(matches!(
                event,
                ViewEvent::PlanSummary(ChangeSummary { import: Some(2), add: 1, .. })
            ));
        }

        #[test]
        fn apply_summary() {
            let event =
                LogParser::new().parse("Apply complete! Resources: 0 added, 0 changed, 1 destroyed.");
            assert!(matches!(
                event,
                ViewEvent::ApplySummary(ChangeSummary { destroy: 1, add: 0, .. })
            ));
        }

        #[test]
        fn no_changes() {
            let parser = LogParser::new();
            assert_eq!(
                parser.parse("No changes. Infrastructure is up-to-date."),
                ViewEvent::NoChanges
            );
            assert_eq!(
                parser.parse("No changes. Your infrastructure matches the configuration."),
                ViewEvent::NoChanges
            );
        }

        #[test]
        fn plain_lines_pass_through() {
            let event = LogParser::new().parse("  + resource \"null_resource\" \"hello\" {");
            assert_eq!(
                event,
                ViewEvent::Output {
                    line: "  + resource \"null_resource\" \"hello\" {".into()
                }
            );
        }

        #[test]
        fn structured_change_summary() {
            let line = r#"{"@level":"info","@message":"Apply complete! Resources: 1 added, 0 changed, 0 destroyed.","type":"change_summary","changes":{"add":1,"change":0,"remove":0,"operation":"apply"}}"#;
            assert!(matches!(
                LogParser::new().parse(line),
                ViewEvent::ApplySummary(ChangeSummary { add: 1, .. })
            ));
        }

        #[test]
        fn structured_diagnostic() {
            let line = r#"{"@level":"error","@message":"Error: Unsupported block type","type":"diagnostic","diagnostic":{"severity":"error","summary":"Unsupported block type","detail":"Blocks of type \"foo\" are not expected here."}}"#;
            match LogParser::new().parse(line) {
                ViewEvent::Structured {
                    kind,
                    severity,
                    message,
                } => {
                    assert_eq!(kind, "diagnostic");
                    assert_eq!(severity, Severity::Error);
                    assert!(message.starts_with("Unsupported block type: Blocks"));
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        #[test]
        fn structured_provisioner_output() {
            let line = r#"{"@level":"info","@message":"null_resource.hello: (local-exec): hi","type":"provision_progress"}"#;
            assert_eq!(
                LogParser::new().parse(line),
                ViewEvent::Structured {
                    kind: "provision_progress".into(),
                    severity: Severity::Info,
                    message: "null_resource.hello: (local-exec): hi".into(),
                }
            );
        }

        #[test]
        fn broken_json_is_plain_output() {
            let event = LogParser::new().parse("{not json");
            assert!(matches!(event, ViewEvent::Output { .. }));
        }
    }

    proptest! {
        #[test]
        fn plan_summary_counts_round_trip(add in 0u32..10_000, change in 0u32..10_000, destroy in 0u32..10_000) {
            let line = format!("Plan: {} to add, {} to change, {} to destroy.", add, change, destroy);
            let event = LogParser::new().parse(&line);
            prop_assert_eq!(event, ViewEvent::PlanSummary(ChangeSummary { add, change, destroy, import: None }));
        }

        #[test]
        fn chunk_size_does_not_change_lines(chunk in 1usize..64) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let lines = rt.block_on(async {
                let mock = MockRunsApi::new().with_chunk_size(chunk);
                let run_id = planned_run(&mock, true).await;
                let mut stream = LogStream::new(Arc::new(mock), &run_id, LogSource::Plan, fast());
                stream.collect(&CancellationToken::new()).await.unwrap()
            });
            let expected: Vec<String> = PLAN_ONE_RESOURCE_ADD.lines().map(str::to_string).collect();
            prop_assert_eq!(lines, expected);
        }
    }
}
