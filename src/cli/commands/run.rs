//! plan / apply commands - Run an operation through the engine

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};

use crate::cli::args::{Cli, RunArgs};
use crate::core::config::Config;
use crate::core::deplocks::DependencyLocks;
use crate::core::types::{
    FailureKind, Operation, OperationKind, PlanFile, PlanMode, RunResult, Variable,
    WorkspaceName, DEFAULT_PARALLELISM,
};
use crate::engine::{CommandExecution, Engine, EngineSettings};
use crate::runs::{create_runs_api, PollSettings, RunClient};
use crate::ui::output::{make_view, Verbosity};
use crate::ui::prompts::TerminalPrompter;

/// Exit code for an operation stopped by the user.
pub const CANCELED_EXIT_CODE: i32 = 130;

/// Global flags a command runs with.
#[derive(Debug, Clone)]
pub struct Context {
    pub config_dir: PathBuf,
    pub verbosity: Verbosity,
    pub json: bool,
    pub interactive: bool,
}

impl Context {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            config_dir: cli.config_dir(),
            verbosity: Verbosity::from_flags(cli.quiet, cli.debug),
            json: cli.json,
            interactive: cli.interactive(),
        }
    }
}

/// Turn command-line flags and configuration into an [`Operation`].
pub fn build_operation(
    kind: OperationKind,
    args: &RunArgs,
    auto_approve: bool,
    plan_file: Option<&Path>,
    config_dir: &Path,
    config: &Config,
) -> Result<Operation> {
    let name = args
        .workspace
        .clone()
        .or_else(|| config.workspace())
        .context("No workspace selected: pass --workspace or set `workspace` in the configuration")?;
    let workspace = WorkspaceName::new(name)?;

    let variables = args
        .vars
        .iter()
        .map(|v| Variable::parse(v))
        .collect::<Result<Vec<_>, _>>()?;

    let plan_mode = if args.destroy {
        PlanMode::Destroy
    } else if args.refresh_only {
        PlanMode::RefreshOnly
    } else {
        PlanMode::Normal
    };

    let dependency_locks = DependencyLocks::load(config_dir)
        .with_context(|| format!("failed to read dependency locks in {}", config_dir.display()))?;

    let base = match kind {
        OperationKind::Plan => Operation::plan(workspace, config_dir),
        OperationKind::Apply => Operation::apply(workspace, config_dir),
    };
    Ok(Operation {
        plan_mode,
        refresh: !args.no_refresh,
        targets: args.targets.clone(),
        excludes: args.excludes.clone(),
        replace: args.replace.clone(),
        variables,
        auto_approve,
        lock_state: !args.no_lock,
        lock_timeout: args.lock_timeout.unwrap_or_else(|| config.lock_timeout()),
        parallelism: args.parallelism.unwrap_or(DEFAULT_PARALLELISM),
        plan_file: plan_file.map(PlanFile::from_path),
        plan_out: args.plan_out.clone(),
        generate_config_out: args.generate_config_out.clone(),
        dependency_locks,
        ..base
    })
}

/// Map a result to the process exit code.
pub fn exit_code(result: &RunResult) -> i32 {
    match result.failure_kind() {
        Some(FailureKind::Canceled) => CANCELED_EXIT_CODE,
        _ => result.exit_status(),
    }
}

/// Run a plan or apply to completion.
pub async fn run_operation(
    ctx: &Context,
    kind: OperationKind,
    args: RunArgs,
    auto_approve: bool,
    plan_file: Option<PathBuf>,
) -> Result<i32> {
    let config = Config::load(Some(ctx.config_dir.as_path())).context("failed to load configuration")?;
    let organization = args
        .organization
        .clone()
        .or_else(|| config.organization());
    let Some(organization) = organization else {
        bail!("No organization selected: pass --organization or set `organization` in the configuration");
    };

    let op = build_operation(
        kind,
        &args,
        auto_approve,
        plan_file.as_deref(),
        &ctx.config_dir,
        &config,
    )?;

    let api = create_runs_api(&config).context("failed to create runs API client")?;
    let poll = PollSettings::new(config.poll_min(), config.poll_max());
    let client = RunClient::connect(api, poll)
        .await
        .with_context(|| format!("failed to connect to {}", config.hostname()))?;

    let settings = EngineSettings::new(organization)
        .with_force_local(Config::force_local())
        .with_ignore_version_conflict(config.ignore_version_conflict());
    let engine = Engine::new(client, settings)
        .with_view(make_view(ctx.json, ctx.verbosity))
        .with_prompter(Arc::new(TerminalPrompter::new(ctx.interactive)))
        .with_local(Arc::new(CommandExecution::new(config.local_program())));

    let handle = engine.start(op).await?;
    tracing::debug!(operation_id = %handle.id(), "operation started");

    let signals = handle.signals();
    let interrupts = tokio::spawn(async move {
        let mut count = 0;
        while tokio::signal::ctrl_c().await.is_ok() {
            count += 1;
            if count == 1 {
                tracing::info!("interrupt received, stopping");
                signals.stop();
            } else {
                tracing::info!("second interrupt received, canceling");
                signals.cancel();
                break;
            }
        }
    });

    let result = handle.wait().await;
    interrupts.abort();

    if ctx.json {
        println!("{}", serde_json::to_string(&result)?);
    }
    Ok(exit_code(&result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::FileConfig;
    use crate::core::types::{Failure, Phase};
    use std::time::Duration;
    use tempfile::TempDir;

    fn config() -> Config {
        Config {
            global: FileConfig {
                workspace: Some("prod".into()),
                lock_timeout_secs: Some(30),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn operation_from_flags_and_config() {
        let dir = TempDir::new().unwrap();
        let args = RunArgs {
            destroy: true,
            targets: vec!["null_resource.a".into()],
            vars: vec!["region=eu".into()],
            ..Default::default()
        };
        let op = build_operation(
            OperationKind::Apply,
            &args,
            true,
            None,
            dir.path(),
            &config(),
        )
        .unwrap();
        assert_eq!(op.workspace.as_str(), "prod");
        assert!(op.is_destroy());
        assert!(op.auto_approve);
        assert_eq!(op.lock_timeout, Duration::from_secs(30));
        assert_eq!(op.variables[0].name, "region");
    }

    #[test]
    fn flag_overrides_config() {
        let dir = TempDir::new().unwrap();
        let args = RunArgs {
            workspace: Some("staging".into()),
            lock_timeout: Some(Duration::from_millis(50)),
            no_lock: true,
            ..Default::default()
        };
        let op = build_operation(OperationKind::Plan, &args, false, None, dir.path(), &config())
            .unwrap();
        assert_eq!(op.workspace.as_str(), "staging");
        assert_eq!(op.lock_timeout, Duration::from_millis(50));
        assert!(!op.lock_state);
    }

    #[test]
    fn missing_workspace_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = build_operation(
            OperationKind::Plan,
            &RunArgs::default(),
            false,
            None,
            dir.path(),
            &Config::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("No workspace selected"));
    }

    #[test]
    fn canceled_maps_to_130() {
        let canceled = RunResult::failure(
            Phase::Canceled,
            true,
            Failure::new(FailureKind::Canceled, "canceled"),
        );
        assert_eq!(exit_code(&canceled), CANCELED_EXIT_CODE);

        let timeout = RunResult::failure(
            Phase::Canceled,
            true,
            Failure::new(FailureKind::LockTimeout, "Lock timeout exceeded"),
        );
        assert_eq!(exit_code(&timeout), 1);
        assert_eq!(exit_code(&RunResult::success(Phase::Planned, true)), 0);
    }
}
