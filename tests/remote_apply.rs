//! Remote apply operations: confirmation, policy gates and external
//! decisions made while a prompt is waiting.

mod support;

use std::sync::Arc;
use std::time::Duration;

use stratus::core::config::DEFAULT_HOSTNAME;
use stratus::core::types::{
    CloudPlanBookmark, FailureKind, Operation, Phase, PlanFile, PlanMode,
};
use stratus::runs::mock::{MockOperation, PolicyScript, RunScript};
use stratus::runs::{CreateRunRequest, RunsApi};
use stratus::ui::prompts::{ScriptedPrompter, TerminalPrompter, WAIT_FOR_EXTERNAL_UPDATE};
use support::{Harness, WORKSPACE};

fn auto_approved(h: &Harness) -> Operation {
    Operation {
        auto_approve: true,
        ..h.apply()
    }
}

fn recorded(h: &Harness, f: impl Fn(&MockOperation) -> bool) -> bool {
    h.mock.operations().iter().any(f)
}

mod confirmation {
    use super::*;

    #[tokio::test]
    async fn auto_approve_applies_without_asking() {
        let h = Harness::new(RunScript::one_resource_add());
        let result = h.run(auto_approved(&h)).await;

        assert!(result.is_success(), "{:?}", result.failure);
        assert_eq!(result.phase, Phase::Applied);
        assert!(!result.plan_empty);
        assert!(h.view.contains("Apply complete! Resources: 1 added, 0 changed, 0 destroyed."));
        assert!(h.prompter.asked().is_empty());
        assert_eq!(
            result.state.unwrap().resources,
            vec!["null_resource.hello".to_string()]
        );
        h.assert_lock_reacquirable().await;
    }

    #[tokio::test]
    async fn yes_applies() {
        let h = Harness::with_answers(RunScript::one_resource_add(), &[("approve", "yes")]);
        let result = h.run(h.apply()).await;

        assert!(result.is_success(), "{:?}", result.failure);
        assert_eq!(h.prompter.asked(), vec!["approve".to_string()]);
        assert!(recorded(&h, |o| matches!(o, MockOperation::ApplyRun { .. })));
        h.assert_lock_reacquirable().await;
    }

    #[tokio::test]
    async fn anything_but_yes_discards() {
        let h = Harness::with_answers(RunScript::one_resource_add(), &[("approve", "y")]);
        let result = h.run(h.apply()).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::Discarded));
        assert!(result.plan_empty);
        assert!(recorded(&h, |o| matches!(o, MockOperation::DiscardRun { .. })));
        assert!(!recorded(&h, |o| matches!(o, MockOperation::ApplyRun { .. })));
    }

    #[tokio::test]
    async fn non_interactive_apply_needs_auto_approve() {
        let h = Harness::new(RunScript::one_resource_add());
        let engine = h
            .engine()
            .with_prompter(Arc::new(TerminalPrompter::new(false)));
        let result = engine.start(h.apply()).await.unwrap().wait().await;

        assert_eq!(result.failure_kind(), Some(FailureKind::Validation));
        assert!(result.failure.unwrap().message.contains("-auto-approve"));
        assert_eq!(h.mock.run_count(), 0);
    }

    #[tokio::test]
    async fn auto_apply_workspace_skips_the_prompt() {
        let h = Harness::new(RunScript::one_resource_add());
        h.mock.update_workspace(WORKSPACE, |ws| ws.auto_apply = true);
        let result = h.run(h.apply()).await;

        assert!(result.is_success(), "{:?}", result.failure);
        assert_eq!(result.phase, Phase::Applied);
        assert!(h.prompter.asked().is_empty());
        assert!(!h.view.contains("approved using the UI or API"));
    }

    #[tokio::test]
    async fn apply_error_is_reported() {
        let h = Harness::new(RunScript::apply_error());
        let result = h.run(auto_approved(&h)).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::RemoteErrored));
        assert!(!result.plan_empty);
        assert!(result.failure.unwrap().message.contains("remote apply failed"));
        h.assert_lock_reacquirable().await;
    }

    #[tokio::test]
    async fn vcs_connected_workspace_rejects_apply() {
        let h = Harness::new(RunScript::one_resource_add());
        h.mock.update_workspace(WORKSPACE, |ws| {
            ws.vcs_repo = Some("acme/infra".into())
        });
        let result = h.run(auto_approved(&h)).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::Validation));
        assert!(result.failure.unwrap().message.contains("VCS connection"));
        assert_eq!(h.mock.run_count(), 0);
    }
}

mod external {
    use super::*;

    #[tokio::test]
    async fn approval_elsewhere_applies() {
        let h = Harness::with_answers(
            RunScript::one_resource_add(),
            &[("approve", WAIT_FOR_EXTERNAL_UPDATE)],
        );
        let handle = h.start(h.apply()).await;

        h.wait_for_prompt("approve").await;
        let run = h.wait_for_decision().await;
        h.mock.apply_run(&run.id, None).await.unwrap();
        let result = handle.wait().await;

        assert!(result.is_success(), "{:?}", result.failure);
        assert_eq!(result.phase, Phase::Applied);
        assert!(h.view.contains("Run approved using the UI or API."));
        assert!(h.view.contains("1 added, 0 changed, 0 destroyed"));
        h.assert_lock_reacquirable().await;
    }

    #[tokio::test]
    async fn discard_elsewhere_ends_the_operation() {
        let h = Harness::with_answers(
            RunScript::one_resource_add(),
            &[("approve", WAIT_FOR_EXTERNAL_UPDATE)],
        );
        let handle = h.start(h.apply()).await;

        h.wait_for_prompt("approve").await;
        let run = h.wait_for_decision().await;
        h.mock.discard_run(&run.id, None).await.unwrap();
        let result = handle.wait().await;

        assert_eq!(result.failure_kind(), Some(FailureKind::Discarded));
        assert!(h.view.contains("Run discarded using the UI or API."));
        assert!(!recorded(&h, |o| matches!(o, MockOperation::ApplyRun { .. })));
        h.assert_lock_reacquirable().await;
    }

    #[tokio::test]
    async fn hard_cancel_while_confirming() {
        let h = Harness::with_answers(
            RunScript::one_resource_add(),
            &[("approve", WAIT_FOR_EXTERNAL_UPDATE)],
        );
        let handle = h.start(h.apply()).await;

        h.wait_for_prompt("approve").await;
        handle.cancel();
        let result = handle.wait().await;

        assert_eq!(result.failure_kind(), Some(FailureKind::Canceled));
        assert_eq!(result.phase, Phase::Canceled);
        assert_eq!(result.failure.unwrap().message, "The remote operation was canceled.");
        let run_id = result.run_id.unwrap();
        assert!(h.mock.operations().contains(&MockOperation::CancelRun { run_id }));
        h.assert_lock_reacquirable().await;
    }

    #[tokio::test]
    async fn lock_timeout_while_confirming() {
        let h = Harness::with_answers(
            RunScript::one_resource_add(),
            &[("approve", WAIT_FOR_EXTERNAL_UPDATE)],
        );
        let op = Operation {
            lock_timeout: Duration::from_millis(500),
            ..h.apply()
        };
        let result = h.run(op).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::LockTimeout));
        assert_eq!(result.failure.unwrap().message, "Lock timeout exceeded");
        h.assert_lock_reacquirable().await;
    }

    #[tokio::test]
    async fn time_in_the_queue_does_not_count_against_confirmation() {
        let h = Harness::new(RunScript::one_resource_add());
        let blocking = h.queue_blocking_run().await;
        let prompter =
            ScriptedPrompter::new([("approve", "yes")]).with_delay(Duration::from_millis(60));
        let engine = h.engine().with_prompter(Arc::new(prompter.clone()));
        let op = Operation {
            lock_timeout: Duration::from_millis(100),
            ..h.apply()
        };
        let handle = engine.start(op).await.unwrap();

        // Queued for 60 ms, then asked; the answer lands 120 ms after the
        // lock was taken but only 60 ms into the confirmation wait.
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.mock.cancel_run(&blocking.id, None).await.unwrap();
        let result = handle.wait().await;

        assert!(result.is_success(), "{:?}", result.failure);
        assert_eq!(result.phase, Phase::Applied);
        assert!(h.view.contains("Waiting for 1 run(s) to finish before being queued..."));
        assert_eq!(prompter.asked(), vec!["approve".to_string()]);
        h.assert_lock_reacquirable().await;
    }
}

mod policy {
    use super::*;

    #[tokio::test]
    async fn soft_failure_is_overridden_with_auto_approve() {
        let h = Harness::new(RunScript::one_resource_add().with_policy(PolicyScript::soft_failed()));
        let result = h.run(auto_approved(&h)).await;

        assert!(result.is_success(), "{:?}", result.failure);
        assert!(h.view.contains("Policy check overridden."));
        assert!(recorded(&h, |o| matches!(o, MockOperation::OverridePolicyCheck { .. })));
        assert!(h.view.contains("1 added, 0 changed, 0 destroyed"));
    }

    #[tokio::test]
    async fn soft_failure_override_then_confirm() {
        let h = Harness::with_answers(
            RunScript::one_resource_add().with_policy(PolicyScript::soft_failed()),
            &[("override", "override"), ("approve", "yes")],
        );
        let result = h.run(h.apply()).await;

        assert!(result.is_success(), "{:?}", result.failure);
        assert_eq!(
            h.prompter.asked(),
            vec!["override".to_string(), "approve".to_string()]
        );
    }

    #[tokio::test]
    async fn declined_override_fails() {
        let h = Harness::with_answers(
            RunScript::one_resource_add().with_policy(PolicyScript::soft_failed()),
            &[("override", "no")],
        );
        let result = h.run(h.apply()).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::PolicySoftFailed));
        assert!(!result.plan_empty);
        assert!(!recorded(&h, |o| matches!(o, MockOperation::ApplyRun { .. })));
        h.assert_lock_reacquirable().await;
    }

    #[tokio::test]
    async fn override_discarded_elsewhere_keeps_the_plan() {
        let h = Harness::with_answers(
            RunScript::one_resource_add().with_policy(PolicyScript::soft_failed()),
            &[("override", WAIT_FOR_EXTERNAL_UPDATE)],
        );
        let handle = h.start(h.apply()).await;

        h.wait_for_prompt("override").await;
        let run = h.wait_for_decision().await;
        h.mock.discard_run(&run.id, None).await.unwrap();
        let result = handle.wait().await;

        assert_eq!(result.failure_kind(), Some(FailureKind::Discarded));
        assert_eq!(result.phase, Phase::Discarded);
        assert!(!result.plan_empty);
        assert!(!recorded(&h, |o| matches!(o, MockOperation::ApplyRun { .. })));
        h.assert_lock_reacquirable().await;
    }

    #[tokio::test]
    async fn hard_failure_ignores_auto_approve() {
        let h = Harness::new(RunScript::one_resource_add().with_policy(PolicyScript::hard_failed()));
        let result = h.run(auto_approved(&h)).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::PolicyHardFailed));
        assert!(result.failure.unwrap().message.contains("hard failed"));
        assert!(!recorded(&h, |o| matches!(o, MockOperation::ApplyRun { .. })));
        assert!(!recorded(&h, |o| matches!(o, MockOperation::OverridePolicyCheck { .. })));
    }

    #[tokio::test]
    async fn passing_policy_then_confirm() {
        let h = Harness::with_answers(
            RunScript::one_resource_add().with_policy(PolicyScript::passed()),
            &[("approve", "yes")],
        );
        let result = h.run(h.apply()).await;

        assert!(result.is_success(), "{:?}", result.failure);
        assert_eq!(h.prompter.asked(), vec!["approve".to_string()]);
    }
}

mod destroy {
    use super::*;

    #[tokio::test]
    async fn destroy_runs_without_configuration() {
        let h = Harness::new(RunScript::destroy());
        std::fs::remove_file(h.dir.path().join("main.tf")).unwrap();
        let op = Operation {
            plan_mode: PlanMode::Destroy,
            ..auto_approved(&h)
        };
        let result = h.run(op).await;

        assert!(result.is_success(), "{:?}", result.failure);
        assert!(h.view.contains("0 added, 0 changed, 1 destroyed"));
        let destroy_requested = h.mock.operations().iter().any(|o| {
            matches!(o, MockOperation::CreateRun { request } if request.is_destroy)
        });
        assert!(destroy_requested);
    }

    #[tokio::test]
    async fn empty_directory_fails_a_normal_apply() {
        let h = Harness::new(RunScript::one_resource_add());
        std::fs::remove_file(h.dir.path().join("main.tf")).unwrap();
        let result = h.run(auto_approved(&h)).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::Validation));
        assert!(result.failure.unwrap().message.contains("No configuration files"));
        assert_eq!(h.mock.run_count(), 0);
    }
}

mod saved_plan {
    use super::*;

    async fn parked_run(h: &Harness) -> String {
        let ws = h.mock.workspace(WORKSPACE).unwrap();
        let run = h
            .mock
            .create_run(CreateRunRequest {
                workspace_id: ws.id,
                refresh: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let mut current = h.mock.read_run(&run.id).await.unwrap();
        while !current.status.awaits_decision() {
            current = h.mock.read_run(&run.id).await.unwrap();
        }
        current.id
    }

    fn saved(h: &Harness, run_id: String) -> Operation {
        Operation {
            plan_file: Some(PlanFile::Cloud(CloudPlanBookmark {
                run_id,
                hostname: DEFAULT_HOSTNAME.to_string(),
            })),
            ..h.apply()
        }
    }

    #[tokio::test]
    async fn bookmark_applies_the_existing_run() {
        let h = Harness::new(RunScript::one_resource_add());
        let run_id = parked_run(&h).await;
        let result = h.run(saved(&h, run_id.clone())).await;

        assert!(result.is_success(), "{:?}", result.failure);
        assert_eq!(result.run_id.as_deref(), Some(run_id.as_str()));
        assert_eq!(h.mock.run_count(), 1);
        assert!(h.prompter.asked().is_empty());
        assert!(!recorded(&h, |o| matches!(o, MockOperation::UploadConfiguration { .. })));
    }

    #[tokio::test]
    async fn discarded_bookmark_is_stale() {
        let h = Harness::new(RunScript::one_resource_add());
        let run_id = parked_run(&h).await;
        h.mock.discard_run(&run_id, None).await.unwrap();
        let result = h.run(saved(&h, run_id)).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::Validation));
        assert!(result.failure.unwrap().message.contains("can no longer be applied"));
        h.assert_lock_reacquirable().await;
    }

    #[tokio::test]
    async fn bookmark_from_another_host_is_rejected() {
        let h = Harness::new(RunScript::one_resource_add());
        let run_id = parked_run(&h).await;
        let op = Operation {
            plan_file: Some(PlanFile::Cloud(CloudPlanBookmark {
                run_id,
                hostname: "elsewhere.example.com".into(),
            })),
            ..h.apply()
        };
        let result = h.run(op).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::Validation));
        assert!(!recorded(&h, |o| matches!(o, MockOperation::ApplyRun { .. })));
    }
}
