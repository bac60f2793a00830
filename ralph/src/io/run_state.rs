//! Per-run record storage (`.ralph/runs/<run-id>/run.json`).

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{FailureReason, RunStatus, VerificationMode};

/// Persisted state of one loop execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunState {
    pub run_id: String,
    /// Original task description given on the command line.
    pub task: String,
    pub max_iterations: u32,
    pub mode: VerificationMode,
    pub budget_usd: f64,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub iterations: Vec<IterationRecord>,
}

/// Verdict of the checks that ran in one iteration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationVerdict {
    pub passed: bool,
    pub failed_checks: BTreeSet<String>,
}

/// Outcome of a single pass through the loop. Never mutated after append.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IterationRecord {
    /// 1-indexed, increases by exactly one per record.
    pub iteration: u32,
    /// `None` when the agent could not be launched or was killed.
    pub agent_exit_code: Option<i32>,
    pub agent_timed_out: bool,
    pub saw_sentinel: bool,
    /// `None` when checks were skipped because the agent failed.
    pub verification: Option<VerificationVerdict>,
    pub failure: Option<FailureReason>,
    /// Brief human-readable summary of the iteration.
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

impl RunState {
    pub fn new(
        run_id: impl Into<String>,
        task: impl Into<String>,
        max_iterations: u32,
        mode: VerificationMode,
        budget_usd: f64,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            task: task.into(),
            max_iterations,
            mode,
            budget_usd,
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            iterations: Vec::new(),
        }
    }

    /// Number the next iteration will carry.
    pub fn next_iteration(&self) -> u32 {
        self.iterations.last().map_or(1, |record| record.iteration + 1)
    }

    /// Append a record, enforcing `1..k` numbering.
    pub fn push_record(&mut self, record: IterationRecord) -> Result<()> {
        let expected = self.next_iteration();
        if record.iteration != expected {
            bail!(
                "iteration record out of order: expected {expected}, got {}",
                record.iteration
            );
        }
        self.iterations.push(record);
        Ok(())
    }

    /// Set a terminal (or interrupted) status and stamp the end time.
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }

    /// Reopen an interrupted run for another stretch of iterations.
    pub fn reopen(&mut self) {
        self.status = RunStatus::Running;
        self.ended_at = None;
    }
}

/// Load run state from disk.
pub fn load_run_state(path: &Path) -> Result<RunState> {
    debug!(path = %path.display(), "loading run state");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    debug!(run_id = %state.run_id, iterations = state.iterations.len(), "run state loaded");
    Ok(state)
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(path = %path.display(), run_id = %state.run_id, iterations = state.iterations.len(), "writing run state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("run state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp run state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace run state {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(iteration: u32) -> IterationRecord {
        IterationRecord {
            iteration,
            agent_exit_code: Some(0),
            agent_timed_out: false,
            saw_sentinel: false,
            verification: Some(VerificationVerdict {
                passed: true,
                failed_checks: BTreeSet::new(),
            }),
            failure: None,
            summary: "ok".to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Verifies write → read preserves all fields.
    #[test]
    fn run_state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run.json");

        let mut state = RunState::new("run-123", "add login", 5, VerificationMode::Quick, 2.5);
        state.push_record(record(1)).expect("push");
        state.finish(RunStatus::Success);

        write_run_state(&path, &state).expect("write");
        let loaded = load_run_state(&path).expect("load");
        assert_eq!(loaded, state);
        assert!(!temp.path().join("run.json.tmp").exists());
    }

    /// Ensures the persisted status and reason names stay stable.
    #[test]
    fn serialized_names_are_stable() {
        let mut state = RunState::new("run-1", "task", 1, VerificationMode::All, 1.0);
        let mut failed = record(1);
        failed.failure = Some(FailureReason::Agent);
        failed.verification = None;
        state.push_record(failed).expect("push");
        state.finish(RunStatus::MaxIterationsReached);

        let value = serde_json::to_value(&state).expect("serialize");
        assert_eq!(value["status"], "max_iterations_reached");
        assert_eq!(value["mode"], "all");
        assert_eq!(value["iterations"][0]["failure"], "agent");
        assert!(value["iterations"][0]["verification"].is_null());
    }

    #[test]
    fn records_must_be_consecutive() {
        let mut state = RunState::new("run-1", "task", 5, VerificationMode::All, 1.0);
        assert_eq!(state.next_iteration(), 1);
        state.push_record(record(1)).expect("first");
        let err = state.push_record(record(3)).unwrap_err();
        assert!(err.to_string().contains("expected 2"));
        state.push_record(record(2)).expect("second");
        assert_eq!(state.next_iteration(), 3);
    }
}
