//! CLI tests for `ralph run`, `ralph init` and `ralph status`.
//!
//! Spawns the ralph binary against temporary workspaces and checks exit codes
//! and on-disk effects. Agents and checks are plain shell commands.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use ralph::core::types::RunStatus;
use ralph::exit_codes;
use ralph::io::init::RalphPaths;
use ralph::io::run_state::load_run_state;

fn ralph(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ralph"))
        .args(args)
        .arg("--root")
        .arg(root)
        .env("RUST_LOG", "off")
        .output()
        .expect("spawn ralph")
}

/// Write a config whose agent and test check are shell one-liners.
fn write_config(root: &Path, agent_script: &str, test_command: &str) {
    let ralph_dir = root.join(".ralph");
    fs::create_dir_all(&ralph_dir).expect("create .ralph");
    let config = format!(
        r#"[run]
max_iterations = 3
mode = "tests"

[agent]
command = ["sh", "-c", "{agent_script}"]
budget_flag = ""

[verify]
tests = ["{test_command}"]
"#
    );
    fs::write(ralph_dir.join("config.toml"), config).expect("write config");
}

fn only_run(root: &Path) -> ralph::io::run_state::RunState {
    let runs_dir = RalphPaths::new(root).runs_dir;
    let mut entries: Vec<_> = fs::read_dir(&runs_dir)
        .expect("runs dir")
        .map(|entry| entry.expect("entry").path())
        .collect();
    assert_eq!(entries.len(), 1, "expected exactly one run");
    let dir = entries.remove(0);
    load_run_state(&dir.join("run.json")).expect("run.json")
}

/// `--dry-run` prints the first prompt and touches nothing.
#[test]
fn dry_run_prints_prompt_without_side_effects() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = ralph(temp.path(), &["run", "add a login form", "--dry-run"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("add a login form"));
    assert!(stdout.contains("Instructions: plan the work"));
    assert!(stdout.trim_end().ends_with("Do not print it when only this iteration's task is done."));
    let leftovers = fs::read_dir(temp.path()).expect("read root").count();
    assert_eq!(leftovers, 0);
}

/// Blank task descriptions are rejected as invalid input.
#[test]
fn blank_task_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = ralph(temp.path(), &["run", "   "]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

/// A setup error is reported before any run directory is created.
#[test]
fn invalid_sentinel_leaves_no_run_behind() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ralph_dir = temp.path().join(".ralph");
    fs::create_dir_all(&ralph_dir).expect("create .ralph");
    fs::write(
        ralph_dir.join("config.toml"),
        "[agent]\ncompletion_sentinel = \"ok\"\n",
    )
    .expect("write config");

    let output = ralph(temp.path(), &["run", "add a login form"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("completion_sentinel"));
    assert!(!RalphPaths::new(temp.path()).runs_dir.exists());
}

#[test]
fn init_refuses_to_overwrite_without_force() {
    let temp = tempfile::tempdir().expect("tempdir");

    let first = ralph(temp.path(), &["init"]);
    assert_eq!(first.status.code(), Some(exit_codes::OK));
    assert!(RalphPaths::new(temp.path()).config_path.is_file());

    let second = ralph(temp.path(), &["init"]);
    assert_eq!(second.status.code(), Some(exit_codes::INVALID));

    let forced = ralph(temp.path(), &["init", "--force"]);
    assert_eq!(forced.status.code(), Some(exit_codes::OK));
}

#[test]
fn status_without_runs_is_an_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = ralph(temp.path(), &["status"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no runs found"));
}

/// An agent that prints the sentinel plus a passing check ends the run at once.
#[cfg(unix)]
#[test]
fn run_succeeds_when_checks_pass_and_agent_reports_completion() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_config(temp.path(), "cat >/dev/null; echo RALPH_COMPLETE", "true");

    let output = ralph(temp.path(), &["run", "make it work"]);
    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("success after 1 iteration(s)"));

    let state = only_run(temp.path());
    assert_eq!(state.status, RunStatus::Success);
    assert_eq!(state.iterations.len(), 1);

    let status = ralph(temp.path(), &["status"]);
    assert_eq!(status.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&status.stdout).contains("status:     success"));
}

/// A check that never passes exhausts the cap and exits with the exhausted code.
#[cfg(unix)]
#[test]
fn run_exhausts_when_checks_keep_failing() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_config(temp.path(), "cat >/dev/null; echo RALPH_COMPLETE", "false");

    let output = ralph(temp.path(), &["run", "make it work", "--max-iterations", "2"]);
    assert_eq!(output.status.code(), Some(exit_codes::EXHAUSTED));
    assert!(String::from_utf8_lossy(&output.stderr).contains("max iterations (2) reached"));

    let state = only_run(temp.path());
    assert_eq!(state.status, RunStatus::MaxIterationsReached);
    assert_eq!(state.iterations.len(), 2);
    assert!(state.ended_at.is_some());

    // A spent run cannot be resumed without raising the cap.
    let resumed = ralph(temp.path(), &["run", "--resume", &state.run_id]);
    assert_eq!(resumed.status.code(), Some(exit_codes::INVALID));
}
