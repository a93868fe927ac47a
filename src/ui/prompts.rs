//! ui::prompts
//!
//! Interactive prompts and scripted answers.
//!
//! # Design
//!
//! Prompts are only shown in interactive mode. In non-interactive mode,
//! operations requiring user input must either have defaults or fail
//! with a clear error message.
//!
//! A prompt is identified by a short id ("approve", "override", "cancel")
//! so that [`ScriptedPrompter`] can answer it in tests. The answer
//! [`WAIT_FOR_EXTERNAL_UPDATE`] never resolves, which leaves the decision to
//! whoever acts on the run through the API.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Scripted answer that blocks until the prompt is abandoned.
pub const WAIT_FOR_EXTERNAL_UPDATE: &str = "wait-for-external-update";

/// Errors from prompts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromptError {
    #[error("prompt cancelled by user")]
    Cancelled,

    #[error("not in interactive mode")]
    NotInteractive,

    #[error("no scripted answer for prompt '{0}'")]
    Unexpected(String),

    #[error("IO error: {0}")]
    IoError(String),
}

/// A question for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub id: String,
    pub query: String,
    pub description: String,
}

impl PromptRequest {
    pub fn new(id: &str, query: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            query: query.into(),
            description: description.into(),
        }
    }
}

/// Source of answers to prompts.
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Whether asking can produce an answer at all.
    fn is_interactive(&self) -> bool;

    /// Ask and wait for the answer. Cancel-safe: dropping the future
    /// abandons the question.
    async fn ask(&self, request: &PromptRequest) -> Result<String, PromptError>;
}

/// Prompts on the terminal, reading answers from stdin.
#[derive(Debug, Clone, Copy)]
pub struct TerminalPrompter {
    interactive: bool,
}

impl TerminalPrompter {
    pub fn new(interactive: bool) -> Self {
        Self { interactive }
    }
}

#[async_trait]
impl Prompter for TerminalPrompter {
    fn is_interactive(&self) -> bool {
        self.interactive
    }

    async fn ask(&self, request: &PromptRequest) -> Result<String, PromptError> {
        if !self.interactive {
            return Err(PromptError::NotInteractive);
        }
        {
            let mut err = std::io::stderr().lock();
            write!(
                err,
                "\n{}\n  {}\n\n  Enter a value: ",
                request.query, request.description
            )
            .and_then(|_| err.flush())
            .map_err(|e| PromptError::IoError(e.to_string()))?;
        }

        // The blocking read outlives an abandoned prompt; its answer is dropped.
        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|n| (n, line))
        })
        .await
        .map_err(|e| PromptError::IoError(e.to_string()))?
        .map_err(|e| PromptError::IoError(e.to_string()))?;

        match line {
            (0, _) => Err(PromptError::Cancelled),
            (_, answer) => Ok(answer.trim().to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct ScriptedInner {
    answers: HashMap<String, VecDeque<String>>,
    asked: Vec<String>,
    /// How long each answer takes to arrive.
    delay: Duration,
}

/// Answers prompts from a fixed script, keyed by prompt id.
///
/// Clones share the script, so a test can inspect which answers were
/// used after handing a clone to the engine.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPrompter {
    inner: Arc<Mutex<ScriptedInner>>,
}

impl ScriptedPrompter {
    pub fn new<'a>(answers: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut inner = ScriptedInner::default();
        for (id, answer) in answers {
            inner
                .answers
                .entry(id.to_string())
                .or_default()
                .push_back(answer.to_string());
        }
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Answer each prompt only after `delay`, like a user thinking it over.
    pub fn with_delay(self, delay: Duration) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.delay = delay;
        }
        self
    }

    /// Answers that were never consumed, as `(id, answer)` pairs.
    pub fn remaining(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut left: Vec<(String, String)> = inner
            .answers
            .iter()
            .flat_map(|(id, answers)| answers.iter().map(move |a| (id.clone(), a.clone())))
            .collect();
        left.sort();
        left
    }

    /// Prompt ids in the order they were asked.
    pub fn asked(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|inner| inner.asked.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    fn is_interactive(&self) -> bool {
        true
    }

    async fn ask(&self, request: &PromptRequest) -> Result<String, PromptError> {
        let (answer, delay) = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|e| PromptError::IoError(e.to_string()))?;
            inner.asked.push(request.id.clone());
            let answer = inner
                .answers
                .get_mut(&request.id)
                .and_then(|answers| answers.pop_front());
            (answer, inner.delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match answer {
            Some(a) if a == WAIT_FOR_EXTERNAL_UPDATE => {
                std::future::pending::<()>().await;
                Err(PromptError::Cancelled)
            }
            Some(a) => Ok(a),
            None => Err(PromptError::Unexpected(request.id.clone())),
        }
    }
}
