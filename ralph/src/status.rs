//! `ralph status`: summarize a persisted run.

use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::io::init::{RalphPaths, RunPaths, validate_run_id};
use crate::io::progress::{ProgressStore, render_task_summary};
use crate::io::run_state::{RunState, load_run_state};

/// A run's record plus where its files live.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: RunState,
    pub paths: RunPaths,
    /// Rendered task checklist, `None` when no usable plan exists.
    pub tasks: Option<String>,
}

/// Load `run_id`, or the most recently started run when `None`.
pub fn load_report(root: &Path, run_id: Option<&str>) -> Result<RunReport> {
    let ralph = RalphPaths::new(root);
    let state = match run_id {
        Some(id) => {
            validate_run_id(id)?;
            let path = ralph.run(id).run_state_path;
            if !path.exists() {
                return Err(anyhow!("run {id} not found"));
            }
            load_run_state(&path)?
        }
        None => latest_run(&ralph)?
            .ok_or_else(|| anyhow!("no runs found under {}", ralph.runs_dir.display()))?,
    };
    let paths = ralph.run(&state.run_id);
    let tasks = ProgressStore::new(&paths)
        .read_tasks()?
        .map(|tasks| render_task_summary(&tasks));
    Ok(RunReport {
        state,
        paths,
        tasks,
    })
}

/// Most recently started run; unreadable run records are skipped with a warning.
fn latest_run(ralph: &RalphPaths) -> Result<Option<RunState>> {
    let entries = match fs::read_dir(&ralph.runs_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("read {}", ralph.runs_dir.display()));
        }
    };

    let mut latest: Option<RunState> = None;
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", ralph.runs_dir.display()))?;
        let path = entry.path().join("run.json");
        if !path.is_file() {
            continue;
        }
        match load_run_state(&path) {
            Ok(state) => {
                let newer = latest.as_ref().is_none_or(|current| {
                    (state.started_at, &state.run_id) > (current.started_at, &current.run_id)
                });
                if newer {
                    latest = Some(state);
                }
            }
            Err(err) => warn!(path = %path.display(), err = %format!("{err:#}"), "skipping unreadable run"),
        }
    }
    debug!(found = latest.is_some(), "latest run lookup");
    Ok(latest)
}

/// Human-readable summary printed by `ralph status`.
pub fn render_report(report: &RunReport) -> String {
    let state = &report.state;
    let mut out = String::new();
    let _ = writeln!(out, "run:        {}", state.run_id);
    let _ = writeln!(out, "task:       {}", state.task);
    let _ = writeln!(out, "status:     {}", state.status.as_str());
    let _ = writeln!(
        out,
        "iterations: {} of {}",
        state.iterations.len(),
        state.max_iterations
    );
    let _ = writeln!(out, "mode:       {}", state.mode);
    let _ = writeln!(out, "budget:     ${:.2} per iteration", state.budget_usd);
    let _ = writeln!(out, "started:    {}", state.started_at.to_rfc3339());
    if let Some(ended) = state.ended_at {
        let _ = writeln!(out, "ended:      {}", ended.to_rfc3339());
    }

    if !state.iterations.is_empty() {
        out.push_str("\nhistory:\n");
        for record in &state.iterations {
            let _ = writeln!(out, "  {:>3}. {}", record.iteration, record.summary);
        }
    }
    if let Some(tasks) = &report.tasks {
        let _ = write!(out, "\ntasks:\n{tasks}\n");
    }
    let _ = write!(
        out,
        "\nlogs:\n  {}\n  {}\n  {}\n",
        report.paths.activity_path.display(),
        report.paths.agent_log_path.display(),
        report.paths.verify_log_path.display()
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{RunStatus, VerificationMode};
    use crate::io::run_state::write_run_state;
    use chrono::Duration;

    fn persist(root: &Path, run_id: &str, minutes_ago: i64) -> RunState {
        let mut state = RunState::new(run_id, "add login", 3, VerificationMode::All, 5.0);
        state.started_at -= Duration::minutes(minutes_ago);
        let paths = RalphPaths::new(root).run(run_id);
        write_run_state(&paths.run_state_path, &state).expect("write");
        state
    }

    #[test]
    fn latest_run_is_chosen_by_start_time() {
        let temp = tempfile::tempdir().expect("tempdir");
        persist(temp.path(), "run-b", 30);
        persist(temp.path(), "run-a", 5);

        let report = load_report(temp.path(), None).expect("report");
        assert_eq!(report.state.run_id, "run-a");
        assert_eq!(report.tasks, None);
    }

    #[test]
    fn explicit_run_and_missing_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_report(temp.path(), None).unwrap_err();
        assert!(err.to_string().contains("no runs found"));

        let mut state = persist(temp.path(), "run-x", 0);
        state.finish(RunStatus::MaxIterationsReached);
        write_run_state(
            &RalphPaths::new(temp.path()).run("run-x").run_state_path,
            &state,
        )
        .expect("write");

        let report = load_report(temp.path(), Some("run-x")).expect("report");
        let text = render_report(&report);
        assert!(text.contains("status:     max_iterations_reached"));
        assert!(text.contains("iterations: 0 of 3"));
        assert!(text.contains("verify.log"));

        let err = load_report(temp.path(), Some("run-y")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
