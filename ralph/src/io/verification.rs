//! Verification runner: project checks selected by mode.
//!
//! Each check is a configured command run to completion in the workspace.
//! Its raw output goes to `verify.log`; only failure-looking lines make it
//! into the excerpt handed back to the loop.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::excerpt::render_block;
use crate::core::types::{Check, VerificationMode, VerificationResult};
use crate::interrupt::Interrupt;
use crate::io::config::VerifyConfig;
use crate::io::process::{CommandSpec, run_command_with_timeout};

/// Parameters for one verification pass.
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    /// Directory the checks run in (the workspace root).
    pub workdir: PathBuf,
    pub mode: VerificationMode,
    /// Iteration number, used for log headers only.
    pub iteration: u32,
    /// Run-scoped log that receives the raw output of every check.
    pub log_path: PathBuf,
}

/// Runs the checks a mode selects and reduces them to a verdict.
pub trait Verifier {
    fn verify(&self, request: &VerifyRequest) -> Result<VerificationResult>;
}

/// Verifier backed by the commands in `[verify]`.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    config: VerifyConfig,
    interrupt: Option<Interrupt>,
}

impl CommandVerifier {
    pub fn new(config: VerifyConfig) -> Self {
        Self {
            config,
            interrupt: None,
        }
    }

    /// Forward Ctrl-C to a running check.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }
}

impl Verifier for CommandVerifier {
    #[instrument(skip_all, fields(mode = %request.mode, iteration = request.iteration))]
    fn verify(&self, request: &VerifyRequest) -> Result<VerificationResult> {
        let mut failed = Vec::new();
        let mut excerpt = String::new();

        for &check in request.mode.checks() {
            let command = self.config.command_for(check);
            let outcome = run_check(
                check,
                command,
                &request.workdir,
                self.config.timeout(),
                self.config.output_limit_bytes,
                self.interrupt.as_ref().map(Interrupt::flag),
            );
            append_check_log(&request.log_path, request.iteration, check, command, &outcome)?;

            if outcome.passed {
                debug!(check = %check, "check passed");
                continue;
            }
            warn!(check = %check, status = %outcome.status, "check failed");
            if !excerpt.is_empty() {
                excerpt.push('\n');
            }
            excerpt.push_str(&render_block(
                check.as_str(),
                &outcome.output,
                self.config.excerpt_lines,
            ));
            failed.push(check.as_str());
        }

        if failed.is_empty() {
            info!("verification passed");
            Ok(VerificationResult::pass())
        } else {
            info!(failed = ?failed, "verification failed");
            Ok(VerificationResult::fail(failed, excerpt))
        }
    }
}

struct CheckOutcome {
    passed: bool,
    /// Human-readable exit description for logs.
    status: String,
    /// Combined stdout and stderr.
    output: String,
}

fn run_check(
    check: Check,
    command: &CommandSpec,
    workdir: &Path,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: Option<&AtomicBool>,
) -> CheckOutcome {
    debug!(check = %check, command = %command, "running check");
    let cmd = command.to_command(workdir, Vec::<String>::new());
    match run_command_with_timeout(cmd, None, timeout, output_limit_bytes, cancel) {
        Ok(output) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&output.stdout_truncated_notice(check.as_str()));
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            text.push_str(&output.stderr_truncated_notice(check.as_str()));

            if output.timed_out {
                text.push_str(&format!(
                    "\nerror: {check} check timed out after {}s\n",
                    timeout.as_secs()
                ));
                return CheckOutcome {
                    passed: false,
                    status: "timed out".to_string(),
                    output: text,
                };
            }
            CheckOutcome {
                passed: output.status.success(),
                status: match output.status.code() {
                    Some(code) => format!("exit {code}"),
                    None => "killed by signal".to_string(),
                },
                output: text,
            }
        }
        // A missing tool fails this check only; the remaining checks still run.
        Err(err) => CheckOutcome {
            passed: false,
            status: "failed to launch".to_string(),
            output: format!("error: failed to launch `{command}`: {err:#}\n"),
        },
    }
}

fn append_check_log(
    path: &Path,
    iteration: u32,
    check: Check,
    command: &CommandSpec,
    outcome: &CheckOutcome,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create verify log dir {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open verify log {}", path.display()))?;
    let mut buf = format!(
        "=== iteration {iteration} · {check} · {command} ===\n{}",
        outcome.output
    );
    if !buf.ends_with('\n') {
        buf.push('\n');
    }
    buf.push_str(&format!("=== {check}: {} ===\n\n", outcome.status));
    file.write_all(buf.as_bytes())
        .with_context(|| format!("append verify log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", ["-c", script])
    }

    fn request(workdir: &Path, mode: VerificationMode) -> VerifyRequest {
        VerifyRequest {
            workdir: workdir.to_path_buf(),
            mode,
            iteration: 1,
            log_path: workdir.join("verify.log"),
        }
    }

    fn recording_config() -> VerifyConfig {
        VerifyConfig {
            tests: sh("echo tests >> calls.txt"),
            lint: sh("echo lint >> calls.txt"),
            typecheck: sh("echo typecheck >> calls.txt"),
            build: sh("echo build >> calls.txt"),
            ..VerifyConfig::default()
        }
    }

    /// Quick mode must run lint and typecheck and nothing else.
    #[cfg(unix)]
    #[test]
    fn quick_mode_runs_exactly_lint_and_typecheck() {
        let temp = tempfile::tempdir().expect("tempdir");
        let verifier = CommandVerifier::new(recording_config());

        let result = verifier
            .verify(&request(temp.path(), VerificationMode::Quick))
            .expect("verify");

        assert!(result.passed);
        let calls = fs::read_to_string(temp.path().join("calls.txt")).expect("calls");
        assert_eq!(calls, "lint\ntypecheck\n");
    }

    #[cfg(unix)]
    #[test]
    fn all_mode_skips_build() {
        let temp = tempfile::tempdir().expect("tempdir");
        let verifier = CommandVerifier::new(recording_config());

        verifier
            .verify(&request(temp.path(), VerificationMode::All))
            .expect("verify");

        let calls = fs::read_to_string(temp.path().join("calls.txt")).expect("calls");
        assert_eq!(calls, "tests\nlint\ntypecheck\n");
    }

    #[cfg(unix)]
    #[test]
    fn failed_check_produces_excerpt_and_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = VerifyConfig {
            tests: sh("echo 'running 2 tests'; echo 'test login ... FAILED' >&2; exit 1"),
            ..recording_config()
        };
        let verifier = CommandVerifier::new(config);

        let result = verifier
            .verify(&request(temp.path(), VerificationMode::Tests))
            .expect("verify");

        assert!(!result.passed);
        assert_eq!(
            result.failed_checks.iter().collect::<Vec<_>>(),
            vec!["tests"]
        );
        assert_eq!(result.diagnostic_excerpt, "[tests]\ntest login ... FAILED\n");

        let log = fs::read_to_string(temp.path().join("verify.log")).expect("log");
        assert!(log.contains("=== iteration 1 · tests · sh -c"));
        assert!(log.contains("running 2 tests"));
        assert!(log.contains("=== tests: exit 1 ==="));
    }

    /// A missing tool fails its check without aborting the pass.
    #[test]
    fn missing_tool_is_a_failed_check() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = VerifyConfig {
            lint: CommandSpec::new("ralph-missing-linter", Vec::<String>::new()),
            typecheck: CommandSpec::new("ralph-missing-typechecker", Vec::<String>::new()),
            ..VerifyConfig::default()
        };
        let verifier = CommandVerifier::new(config);

        let result = verifier
            .verify(&request(temp.path(), VerificationMode::Quick))
            .expect("verify");

        assert!(!result.passed);
        assert_eq!(
            result.failed_checks.iter().collect::<Vec<_>>(),
            vec!["lint", "typecheck"]
        );
        assert!(result.diagnostic_excerpt.contains("[lint]"));
        assert!(result.diagnostic_excerpt.contains("failed to launch"));
    }

    /// A check that forks stays bounded by the check timeout.
    #[cfg(unix)]
    #[test]
    fn forking_check_is_bounded_by_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = VerifyConfig {
            tests: sh("(sleep 6); true"),
            timeout_secs: 1,
            ..recording_config()
        };
        let verifier = CommandVerifier::new(config);

        let started = std::time::Instant::now();
        let result = verifier
            .verify(&request(temp.path(), VerificationMode::Tests))
            .expect("verify");

        assert!(started.elapsed() < Duration::from_secs(4), "{:?}", started.elapsed());
        assert!(!result.passed);
        assert!(
            result
                .diagnostic_excerpt
                .contains("error: tests check timed out after 1s")
        );
    }
}
