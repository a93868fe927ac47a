//! cli::commands
//!
//! Command dispatch and handlers.
//!
//! # Architecture
//!
//! Each command handler:
//! 1. Validates command-specific arguments
//! 2. Calls the engine to execute the command
//! 3. Maps the result to an exit code
//!
//! # Async Commands
//!
//! Plan and apply are async because they involve network I/O. The
//! dispatcher builds a tokio runtime for them and blocks on it.

mod completion;
mod run;

pub use completion::completion;
pub use run::{build_operation, exit_code, run_operation, Context, CANCELED_EXIT_CODE};

use crate::cli::args::{Cli, Command};
use crate::core::types::OperationKind;
use anyhow::Result;

/// Dispatch a command to its handler.
pub fn dispatch(cli: Cli) -> Result<i32> {
    let ctx = run::Context::from_cli(&cli);
    match cli.command {
        Command::Plan { run } => block_on(run_operation(&ctx, OperationKind::Plan, run, false, None)),
        Command::Apply {
            run,
            auto_approve,
            plan_file,
        } => block_on(run_operation(
            &ctx,
            OperationKind::Apply,
            run,
            auto_approve,
            plan_file,
        )),
        Command::Completion { shell } => {
            completion(shell)?;
            Ok(0)
        }
    }
}

fn block_on<F: std::future::Future<Output = Result<i32>>>(future: F) -> Result<i32> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(future)
}
