//! Orchestration for starting, resuming and previewing a run.
//!
//! A "run" is one loop execution toward a single goal, identified by a stable
//! `run_id` and stored under `.ralph/runs/<run-id>/`. Starting a run allocates
//! the id, writes `run.json` and initializes the progress store. The loop
//! itself lives in [`crate::looping`].

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::core::types::{PriorFailure, RunStatus, VerificationMode};
use crate::io::config::{RalphConfig, RunDefaults, validate_budget};
use crate::io::init::{RalphPaths, RunPaths, create_dir, validate_run_id};
use crate::io::progress::ProgressStore;
use crate::io::prompt::{PromptBuilder, PromptInputs, PromptPack};
use crate::io::run_state::{RunState, load_run_state, write_run_state};

/// Per-run knobs that can be overridden from the command line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSettings {
    pub max_iterations: u32,
    pub mode: VerificationMode,
    pub budget_usd: f64,
}

/// Command-line values that take precedence over config or a resumed run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingOverrides {
    pub max_iterations: Option<u32>,
    /// Mode name as typed. Unknown names fall back to `all`.
    pub mode: Option<String>,
    pub budget_usd: Option<f64>,
}

impl RunSettings {
    /// Settings from the `[run]` table of the config.
    pub fn from_defaults(defaults: &RunDefaults) -> Self {
        Self {
            max_iterations: defaults.max_iterations,
            mode: mode_or_all(&defaults.mode),
            budget_usd: defaults.budget_usd,
        }
    }

    pub fn with_overrides(self, overrides: &SettingOverrides) -> Result<Self> {
        let settings = Self {
            max_iterations: overrides.max_iterations.unwrap_or(self.max_iterations),
            mode: overrides.mode.as_deref().map_or(self.mode, mode_or_all),
            budget_usd: overrides.budget_usd.unwrap_or(self.budget_usd),
        };
        if settings.max_iterations == 0 {
            bail!("max iterations must be at least 1");
        }
        validate_budget(settings.budget_usd)?;
        Ok(settings)
    }
}

fn mode_or_all(raw: &str) -> VerificationMode {
    if let Err(err) = raw.parse::<VerificationMode>() {
        warn!(%err, "falling back to verification mode 'all'");
    }
    VerificationMode::parse_lenient(raw)
}

/// Driver-side knobs that stay fixed for the lifetime of one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOptions {
    pub agent_timeout: Option<Duration>,
    pub output_tail_lines: usize,
    pub prompt_budget_bytes: usize,
    pub activity_tail_lines: usize,
    pub sentinel: String,
    /// Echo agent output live.
    pub verbose: bool,
}

impl LoopOptions {
    pub fn from_config(config: &RalphConfig, verbose: bool) -> Self {
        Self {
            agent_timeout: config.agent.timeout(),
            output_tail_lines: config.agent.output_tail_lines,
            prompt_budget_bytes: config.prompt.budget_bytes,
            activity_tail_lines: config.prompt.activity_tail_lines,
            sentinel: config.agent.completion_sentinel.clone(),
            verbose,
        }
    }

    /// Override the agent timeout; `0` disables it.
    pub fn with_timeout_secs(mut self, timeout_secs: Option<u64>) -> Self {
        if let Some(secs) = timeout_secs {
            self.agent_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        self
    }
}

/// A run ready for the loop: its files, its record and its store.
#[derive(Debug, Clone)]
pub struct RunHandle {
    /// Workspace the agent and checks run in.
    pub root: PathBuf,
    pub paths: RunPaths,
    pub store: ProgressStore,
    pub state: RunState,
    pub options: LoopOptions,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.state.run_id
    }

    pub fn settings(&self) -> RunSettings {
        RunSettings {
            max_iterations: self.state.max_iterations,
            mode: self.state.mode,
            budget_usd: self.state.budget_usd,
        }
    }
}

/// Create a new run for `task` in `root`.
pub fn start_run(
    root: &Path,
    task: &str,
    settings: RunSettings,
    options: LoopOptions,
) -> Result<RunHandle> {
    let task = task.trim();
    if task.is_empty() {
        bail!("task description must not be empty");
    }
    let ralph = RalphPaths::new(root);
    create_dir(&ralph.runs_dir)?;
    let run_id = allocate_run_id(&ralph.runs_dir, Utc::now())?;
    let paths = ralph.run(&run_id);

    let state = RunState::new(
        &run_id,
        task,
        settings.max_iterations,
        settings.mode,
        settings.budget_usd,
    );
    let store = ProgressStore::new(&paths);
    store.initialize(&run_id)?;
    write_run_state(&paths.run_state_path, &state)?;
    store.append_activity(&format!(
        "Run started.\n\nGoal: {task}\n\nMode `{}`, at most {} iterations, budget ${:.2} per iteration.",
        settings.mode, settings.max_iterations, settings.budget_usd
    ))?;

    info!(run_id = %run_id, mode = %settings.mode, max_iterations = settings.max_iterations, "run started");
    Ok(RunHandle {
        root: root.to_path_buf(),
        paths,
        store,
        state,
        options,
    })
}

/// Reopen an existing run so the loop continues at its next iteration number.
pub fn resume_run(
    root: &Path,
    run_id: &str,
    overrides: &SettingOverrides,
    options: LoopOptions,
) -> Result<RunHandle> {
    validate_run_id(run_id)?;
    let paths = RalphPaths::new(root).run(run_id);
    if !paths.run_state_path.exists() {
        return Err(anyhow!(
            "run {run_id} not found ({} is missing)",
            paths.run_state_path.display()
        ));
    }
    let mut state = load_run_state(&paths.run_state_path)?;
    if state.run_id != run_id {
        bail!(
            "run.json in {} belongs to run {}",
            paths.dir.display(),
            state.run_id
        );
    }
    if state.status == RunStatus::Success {
        bail!("run {run_id} already succeeded");
    }

    let current = RunSettings {
        max_iterations: state.max_iterations,
        mode: state.mode,
        budget_usd: state.budget_usd,
    };
    let settings = current.with_overrides(overrides)?;
    let done = state.iterations.len() as u32;
    if done >= settings.max_iterations {
        bail!(
            "run {run_id} already used {done} of {} iterations (raise --max-iterations to continue)",
            settings.max_iterations
        );
    }
    state.max_iterations = settings.max_iterations;
    state.mode = settings.mode;
    state.budget_usd = settings.budget_usd;
    state.reopen();

    let store = ProgressStore::new(&paths);
    store.initialize(run_id)?;
    write_run_state(&paths.run_state_path, &state)?;
    store.append_activity(&format!(
        "Run resumed at iteration {} (mode `{}`, at most {} iterations).",
        state.next_iteration(),
        settings.mode,
        settings.max_iterations
    ))?;

    info!(run_id, next_iteration = state.next_iteration(), "run resumed");
    Ok(RunHandle {
        root: root.to_path_buf(),
        paths,
        store,
        state,
        options,
    })
}

/// Render the prompt a new run would start with, without touching the filesystem.
pub fn preview_first_prompt(
    root: &Path,
    task: &str,
    settings: RunSettings,
    options: &LoopOptions,
) -> Result<PromptPack> {
    let task = task.trim();
    if task.is_empty() {
        bail!("task description must not be empty");
    }
    let run_id = run_id_for(Utc::now());
    let paths = RalphPaths::new(root).run(&run_id);
    debug!(run_id = %run_id, "previewing first prompt");
    PromptBuilder::new(options.prompt_budget_bytes, &options.sentinel).build(&PromptInputs {
        iteration: 1,
        max_iterations: settings.max_iterations,
        task: task.to_string(),
        prior_failure: PriorFailure::None,
        mode: settings.mode,
        plan_exists: false,
        plan_path: relative_to(root, &paths.plan_path),
        activity_path: relative_to(root, &paths.activity_path),
        recent_activity: String::new(),
        task_summary: String::new(),
    })
}

/// Path as the agent should see it: relative to the workspace it runs in.
pub fn relative_to(root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(root)
        .map_or_else(|_| path.to_path_buf(), Path::to_path_buf)
}

fn run_id_for(now: DateTime<Utc>) -> String {
    format!("run-{}", now.format("%Y%m%d-%H%M%S"))
}

/// Claim a fresh run directory, suffixing `-2`, `-3`, … on collision.
fn allocate_run_id(runs_dir: &Path, now: DateTime<Utc>) -> Result<String> {
    let base = run_id_for(now);
    for suffix in 1..=999u32 {
        let id = if suffix == 1 {
            base.clone()
        } else {
            format!("{base}-{suffix}")
        };
        validate_run_id(&id)?;
        match fs::create_dir(runs_dir.join(&id)) {
            Ok(()) => return Ok(id),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("create run dir for {id}"));
            }
        }
    }
    Err(anyhow!(
        "unable to allocate a unique run id from base '{base}' (too many runs this second)"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn settings() -> RunSettings {
        RunSettings {
            max_iterations: 3,
            mode: VerificationMode::Tests,
            budget_usd: 2.0,
        }
    }

    fn options() -> LoopOptions {
        LoopOptions::from_config(&RalphConfig::default(), false)
    }

    #[test]
    fn run_ids_are_timestamped_and_unique() {
        let temp = tempfile::tempdir().expect("tempdir");
        let now = Utc
            .with_ymd_and_hms(2026, 10, 19, 8, 30, 5)
            .single()
            .expect("valid time");

        assert_eq!(
            allocate_run_id(temp.path(), now).expect("first"),
            "run-20261019-083005"
        );
        assert_eq!(
            allocate_run_id(temp.path(), now).expect("second"),
            "run-20261019-083005-2"
        );
        assert!(temp.path().join("run-20261019-083005-2").is_dir());
    }

    #[test]
    fn overrides_take_precedence_and_unknown_mode_means_all() {
        let base = RunSettings::from_defaults(&RunDefaults::default());
        assert_eq!(base.mode, VerificationMode::All);

        let resolved = base
            .with_overrides(&SettingOverrides {
                max_iterations: Some(4),
                mode: Some("quick".to_string()),
                budget_usd: None,
            })
            .expect("resolve");
        assert_eq!(resolved.max_iterations, 4);
        assert_eq!(resolved.mode, VerificationMode::Quick);
        assert_eq!(resolved.budget_usd, 5.0);

        let fallback = resolved
            .with_overrides(&SettingOverrides {
                mode: Some("everything".to_string()),
                ..SettingOverrides::default()
            })
            .expect("resolve");
        assert_eq!(fallback.mode, VerificationMode::All);
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        let base = settings();
        assert!(
            base.with_overrides(&SettingOverrides {
                max_iterations: Some(0),
                ..SettingOverrides::default()
            })
            .is_err()
        );
        assert!(
            base.with_overrides(&SettingOverrides {
                budget_usd: Some(0.0),
                ..SettingOverrides::default()
            })
            .is_err()
        );
    }

    #[test]
    fn timeout_override() {
        let options = options().with_timeout_secs(Some(30));
        assert_eq!(options.agent_timeout, Some(Duration::from_secs(30)));
        assert_eq!(options.with_timeout_secs(Some(0)).agent_timeout, None);
    }

    #[test]
    fn start_run_writes_record_and_store() {
        let temp = tempfile::tempdir().expect("tempdir");
        let handle = start_run(temp.path(), "  add login  ", settings(), options()).expect("start");

        assert_eq!(handle.state.task, "add login");
        assert_eq!(handle.state.status, RunStatus::Running);
        let loaded = load_run_state(&handle.paths.run_state_path).expect("load");
        assert_eq!(loaded, handle.state);
        assert!(handle.paths.activity_path.is_file());
        assert!(!handle.paths.plan_path.exists());
    }

    #[test]
    fn empty_task_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = start_run(temp.path(), "   ", settings(), options()).unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
        assert!(!temp.path().join(".ralph").exists());
    }

    #[test]
    fn preview_has_no_side_effects() {
        let temp = tempfile::tempdir().expect("tempdir");
        let pack =
            preview_first_prompt(temp.path(), "add login", settings(), &options()).expect("preview");

        assert!(pack.as_str().contains("add login"));
        assert!(pack.as_str().contains(".ralph/runs/run-"));
        let entries = fs::read_dir(temp.path()).expect("read dir").count();
        assert_eq!(entries, 0);
    }

    #[test]
    fn resume_rejects_unknown_and_finished_runs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = resume_run(temp.path(), "run-missing", &SettingOverrides::default(), options())
            .unwrap_err();
        assert!(err.to_string().contains("not found"));

        let mut handle = start_run(temp.path(), "task", settings(), options()).expect("start");
        handle.state.finish(RunStatus::Success);
        write_run_state(&handle.paths.run_state_path, &handle.state).expect("write");
        let err = resume_run(
            temp.path(),
            handle.run_id(),
            &SettingOverrides::default(),
            options(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("already succeeded"));
    }

    #[test]
    fn resume_reopens_interrupted_run_with_overrides() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut handle = start_run(temp.path(), "task", settings(), options()).expect("start");
        handle.state.finish(RunStatus::Interrupted);
        write_run_state(&handle.paths.run_state_path, &handle.state).expect("write");

        let resumed = resume_run(
            temp.path(),
            handle.run_id(),
            &SettingOverrides {
                max_iterations: Some(6),
                ..SettingOverrides::default()
            },
            options(),
        )
        .expect("resume");
        assert_eq!(resumed.state.status, RunStatus::Running);
        assert_eq!(resumed.state.ended_at, None);
        assert_eq!(resumed.settings().max_iterations, 6);
        assert_eq!(resumed.settings().mode, VerificationMode::Tests);
        let log = fs::read_to_string(&resumed.paths.activity_path).expect("activity");
        assert!(log.contains("Run resumed at iteration 1"));
    }
}
