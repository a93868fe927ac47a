//! Shared harness for engine integration tests.
//!
//! A [`Harness`] wires an [`Engine`] to an in-memory [`MockRunsApi`], a
//! [`RecordingView`] and a [`ScriptedPrompter`], with a temporary
//! configuration directory holding one resource.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use stratus::core::types::{Operation, RunResult, WorkspaceName};
use stratus::engine::{Engine, EngineSettings, OperationHandle};
use stratus::runs::mock::{MockRunsApi, RunScript, MOCK_API_VERSION};
use stratus::runs::{ApiVersion, PollSettings, Run, RunClient, RunStatus, RunsApi};
use stratus::ui::prompts::ScriptedPrompter;
use stratus::ui::view::RecordingView;
use tempfile::TempDir;

pub const ORG: &str = "acme";
pub const WORKSPACE: &str = "prod";

pub const MAIN_TF: &str = "resource \"null_resource\" \"hello\" {}\n";

pub struct Harness {
    pub mock: MockRunsApi,
    pub view: RecordingView,
    pub prompter: ScriptedPrompter,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(script: RunScript) -> Self {
        Self::with_answers(script, &[])
    }

    pub fn with_answers(script: RunScript, answers: &[(&str, &str)]) -> Self {
        let mock = MockRunsApi::new();
        mock.set_script(script);
        mock.add_workspace(ORG, WORKSPACE);
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("main.tf"), MAIN_TF).unwrap();
        Self {
            mock,
            view: RecordingView::new(),
            prompter: ScriptedPrompter::new(answers.iter().copied()),
            dir,
        }
    }

    pub fn client(&self) -> RunClient {
        self.client_at(MOCK_API_VERSION)
    }

    /// A client that believes the service speaks `version`.
    pub fn client_at(&self, version: ApiVersion) -> RunClient {
        RunClient::new(
            Arc::new(self.mock.clone()),
            version,
            PollSettings::new(Duration::from_millis(1), Duration::from_millis(5)),
        )
    }

    pub fn engine(&self) -> Engine {
        self.engine_with(EngineSettings::new(ORG))
    }

    pub fn engine_with(&self, settings: EngineSettings) -> Engine {
        self.engine_from(self.client(), settings)
    }

    pub fn engine_from(&self, client: RunClient, settings: EngineSettings) -> Engine {
        Engine::new(client, settings)
            .with_view(Arc::new(self.view.clone()))
            .with_prompter(Arc::new(self.prompter.clone()))
    }

    pub fn plan(&self) -> Operation {
        Operation::plan(WorkspaceName::new(WORKSPACE).unwrap(), self.dir.path())
    }

    pub fn apply(&self) -> Operation {
        Operation::apply(WorkspaceName::new(WORKSPACE).unwrap(), self.dir.path())
    }

    pub async fn start(&self, op: Operation) -> OperationHandle {
        self.engine().start(op).await.unwrap()
    }

    pub async fn run(&self, op: Operation) -> RunResult {
        self.start(op).await.wait().await
    }

    pub fn workspace_locked(&self) -> bool {
        self.mock.workspace(WORKSPACE).unwrap().locked
    }

    /// The lock can be taken again once an operation is done.
    pub async fn assert_lock_reacquirable(&self) {
        let ws = self.mock.workspace(WORKSPACE).unwrap();
        assert!(!ws.locked, "workspace still locked after the operation");
        self.mock.lock_workspace(&ws.id, "test").await.unwrap();
        self.mock.unlock_workspace(&ws.id).await.unwrap();
    }

    /// Wait until the newest run reaches a status satisfying `f`.
    pub async fn wait_for_run(&self, f: impl Fn(&Run) -> bool) -> Run {
        for _ in 0..2000 {
            if let Some(run) = self.mock.all_runs().last().filter(|r| f(r)).cloned() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("run never reached the expected status");
    }

    /// Wait until the newest run is parked for a decision.
    pub async fn wait_for_decision(&self) -> Run {
        self.wait_for_run(|r| r.status.awaits_decision()).await
    }

    /// Wait until the prompter has been asked `id`.
    pub async fn wait_for_prompt(&self, id: &str) {
        for _ in 0..2000 {
            if self.prompter.asked().iter().any(|asked| asked == id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("prompt {:?} was never asked", id);
    }

    /// Queue an unfinished apply run that blocks later runs.
    pub async fn queue_blocking_run(&self) -> Run {
        let ws = self.mock.workspace(WORKSPACE).unwrap();
        let cv = self
            .mock
            .create_configuration_version(&ws.id, false)
            .await
            .unwrap();
        self.mock
            .upload_configuration(&cv, Vec::new())
            .await
            .unwrap();
        let run = self
            .mock
            .create_run(stratus::runs::CreateRunRequest {
                workspace_id: ws.id,
                configuration_version_id: Some(cv.id),
                refresh: true,
                ..Default::default()
            })
            .await
            .unwrap();
        // Move it out of Pending so it holds the queue.
        let run = self.mock.read_run(&run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Planning);
        run
    }
}
