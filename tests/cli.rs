//! Command-line surface tests.
//!
//! Each command runs with `STRATUS_CONFIG` pointed at an empty file so
//! the user's own configuration never leaks in.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::{NamedTempFile, TempDir};

struct Env {
    config: NamedTempFile,
    dir: TempDir,
}

impl Env {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("main.tf"), "").unwrap();
        Self {
            config: NamedTempFile::new().unwrap(),
            dir,
        }
    }

    fn stratus(&self) -> Command {
        let mut cmd = Command::cargo_bin("stratus").unwrap();
        cmd.env("STRATUS_CONFIG", self.config.path())
            .env_remove("STRATUS_TOKEN")
            .env_remove("STRATUS_FORCE_LOCAL_BACKEND")
            .env_remove("STRATUS_LOG")
            .arg("--chdir")
            .arg(self.dir.path());
        cmd
    }
}

#[test]
fn help_lists_commands() {
    Env::new()
        .stratus()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("apply"))
        .stdout(predicate::str::contains("completion"));
}

#[test]
fn version_flag_works() {
    Env::new()
        .stratus()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("stratus"));
}

#[test]
fn apply_help_explains_cancellation() {
    Env::new()
        .stratus()
        .args(["apply", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--auto-approve"))
        .stdout(predicate::str::contains("Ctrl-C twice"));
}

#[test]
fn bash_completion_is_generated() {
    Env::new()
        .stratus()
        .args(["completion", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stratus"));
}

#[test]
fn plan_without_organization_fails() {
    Env::new()
        .stratus()
        .args(["plan", "-w", "prod"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("No organization selected"));
}

#[test]
fn bad_variable_binding_fails() {
    Env::new()
        .stratus()
        .args(["plan", "--organization", "acme", "-w", "prod", "--var", "novalue"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid variable binding"));
}

#[test]
fn bad_lock_timeout_is_a_usage_error() {
    Env::new()
        .stratus()
        .args(["plan", "--lock-timeout", "soon"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("invalid duration"));
}

#[test]
fn destroy_conflicts_with_refresh_only() {
    Env::new()
        .stratus()
        .args(["plan", "--destroy", "--refresh-only"])
        .assert()
        .failure()
        .code(2);
}
