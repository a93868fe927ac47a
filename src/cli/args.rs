//! cli::args
//!
//! Command-line argument definitions using clap derive.
//!
//! # Global Flags
//!
//! These flags are available on all commands:
//! - `--help` / `-h`: Show help
//! - `--version`: Show version
//! - `--chdir <path>`: Use this configuration directory
//! - `--debug`: Enable debug logging
//! - `--json`: Machine-readable output
//! - `--no-interactive`: Never prompt
//! - `--quiet` / `-q`: Minimal output

use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

/// Stratus - plan and apply infrastructure changes on a remote runs service
#[derive(Parser, Debug)]
#[command(name = "stratus")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration directory to run in (defaults to the current directory)
    #[arg(long, global = true, value_name = "DIR")]
    pub chdir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Minimal output; implies --no-interactive
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit one JSON object per event instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Disable interactive prompts
    #[arg(long, global = true)]
    pub no_interactive: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Parser::parse()
    }

    /// Whether prompts may be shown.
    ///
    /// False with `--no-interactive`, `--quiet` or `--json`, or when stdin
    /// is not a terminal.
    pub fn interactive(&self) -> bool {
        !(self.no_interactive || self.quiet || self.json) && std::io::stdin().is_terminal()
    }

    /// Configuration directory for the command.
    pub fn config_dir(&self) -> PathBuf {
        self.chdir.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the changes a remote run would make
    #[command(
        name = "plan",
        long_about = "Create a speculative plan on the remote runs service.\n\n\
            The configuration directory is uploaded, a plan-only run is queued, \
            and its log is streamed here. Policy checks run after the plan; a \
            plan never applies anything.",
        after_help = "\
EXAMPLES:
    # Plan the current directory against its workspace
    stratus plan -w prod

    # Plan a destroy
    stratus plan -w prod --destroy

    # Plan two resources only
    stratus plan -w prod --target null_resource.a --target null_resource.b"
    )]
    Plan {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Plan and apply changes on the remote runs service
    #[command(
        name = "apply",
        long_about = "Plan and apply on the remote runs service.\n\n\
            After the plan and any policy checks, you are asked to confirm. \
            The run may also be confirmed or discarded from the service UI \
            while the prompt is waiting.",
        after_help = "\
EXAMPLES:
    # Apply with confirmation
    stratus apply -w prod

    # Apply without asking
    stratus apply -w prod --auto-approve

    # Apply a plan saved on the service
    stratus apply -w prod ./plan-bookmark.json

CANCELLATION:
    Ctrl-C once stops waiting and asks whether to cancel the remote run.
    Ctrl-C twice cancels the remote run without asking."
    )]
    Apply {
        #[command(flatten)]
        run: RunArgs,

        /// Skip interactive approval of the plan
        #[arg(long)]
        auto_approve: bool,

        /// Saved plan to apply
        #[arg(value_name = "PLAN")]
        plan_file: Option<PathBuf>,
    },

    /// Generate shell completion scripts
    #[command(
        name = "completion",
        long_about = "Generate shell completion scripts for tab-completion.\n\n\
            Outputs a completion script for the specified shell. Add the output \
            to your shell's configuration to enable tab-completion for Stratus commands.",
        after_help = "\
EXAMPLES:
    # Bash (add to ~/.bashrc)
    stratus completion bash >> ~/.bashrc

    # Zsh (add to ~/.zshrc)
    stratus completion zsh >> ~/.zshrc

    # Fish
    stratus completion fish > ~/.config/fish/completions/stratus.fish

    # PowerShell
    stratus completion powershell >> $PROFILE"
    )]
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Flags shared by plan and apply.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Workspace to run in (defaults to the configured workspace)
    #[arg(short, long, value_name = "NAME")]
    pub workspace: Option<String>,

    /// Organization owning the workspace (defaults to the configured one)
    #[arg(long, value_name = "NAME")]
    pub organization: Option<String>,

    /// Plan to destroy all managed resources
    #[arg(long, conflicts_with = "refresh_only")]
    pub destroy: bool,

    /// Only refresh state; propose no changes
    #[arg(long)]
    pub refresh_only: bool,

    /// Skip refreshing state before planning
    #[arg(long)]
    pub no_refresh: bool,

    /// Limit planning to this resource address (repeatable)
    #[arg(long = "target", value_name = "ADDR")]
    pub targets: Vec<String>,

    /// Exclude this resource address from planning (repeatable)
    #[arg(long = "exclude", value_name = "ADDR")]
    pub excludes: Vec<String>,

    /// Force replacement of this resource address (repeatable)
    #[arg(long = "replace", value_name = "ADDR")]
    pub replace: Vec<String>,

    /// Set a run variable (repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub vars: Vec<String>,

    /// Do not take the state lock
    #[arg(long)]
    pub no_lock: bool,

    /// How long to wait for the state lock and the run queue (e.g. 30s, 500ms)
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub lock_timeout: Option<Duration>,

    /// Number of concurrent resource operations
    #[arg(long, value_name = "N")]
    pub parallelism: Option<u32>,

    /// Write the plan to this path
    #[arg(long = "out", value_name = "PATH")]
    pub plan_out: Option<PathBuf>,

    /// Write generated configuration for imports to this path
    #[arg(long, value_name = "PATH")]
    pub generate_config_out: Option<PathBuf>,
}

/// Supported shells for completion
#[derive(clap::ValueEnum, Debug, Clone, Copy)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
}

/// Parse `500ms`, `30s`, `2m` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}'", s))?;
    match unit {
        "" | "s" => Ok(Duration::from_secs(n)),
        "ms" => Ok(Duration::from_millis(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        _ => Err(format!("invalid duration unit in '{}' (use ms, s or m)", s)),
    }
}
