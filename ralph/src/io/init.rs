//! Canonical `.ralph/` layout and `ralph init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info};

use super::config::{RalphConfig, write_config};

/// Workspace-level paths under `<root>/.ralph/`.
#[derive(Debug, Clone)]
pub struct RalphPaths {
    pub root: PathBuf,
    pub ralph_dir: PathBuf,
    pub config_path: PathBuf,
    pub runs_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl RalphPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let ralph_dir = root.join(".ralph");
        Self {
            root: root.clone(),
            config_path: ralph_dir.join("config.toml"),
            runs_dir: ralph_dir.join("runs"),
            gitignore_path: ralph_dir.join(".gitignore"),
            ralph_dir,
        }
    }

    pub fn run(&self, run_id: &str) -> RunPaths {
        RunPaths::new(&self.runs_dir, run_id)
    }
}

/// All files belonging to one run (`.ralph/runs/<run-id>/`).
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub run_state_path: PathBuf,
    pub plan_path: PathBuf,
    pub activity_path: PathBuf,
    pub agent_log_path: PathBuf,
    pub verify_log_path: PathBuf,
    pub iterations_dir: PathBuf,
}

impl RunPaths {
    pub fn new(runs_dir: &Path, run_id: &str) -> Self {
        let dir = runs_dir.join(run_id);
        Self {
            run_state_path: dir.join("run.json"),
            plan_path: dir.join("plan.md"),
            activity_path: dir.join("activity.md"),
            agent_log_path: dir.join("agent.log"),
            verify_log_path: dir.join("verify.log"),
            iterations_dir: dir.join("iterations"),
            dir,
        }
    }

    pub fn iteration_dir(&self, iteration: u32) -> PathBuf {
        self.iterations_dir.join(iteration.to_string())
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config file.
    pub force: bool,
}

/// Create `.ralph/` with a default `config.toml` and `.gitignore`.
///
/// Fails if the config already exists unless `options.force` is set.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<RalphPaths> {
    let paths = RalphPaths::new(root);
    if paths.ralph_dir.exists() && !paths.ralph_dir.is_dir() {
        return Err(anyhow!("ralph init: .ralph exists but is not a directory"));
    }
    if paths.config_path.exists() && !options.force {
        bail!(
            "ralph init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        );
    }

    create_dir(&paths.runs_dir)?;
    write_config(&paths.config_path, &RalphConfig::default())?;
    if !paths.gitignore_path.exists() || options.force {
        fs::write(&paths.gitignore_path, RALPH_GITIGNORE)
            .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    }

    info!(root = %root.display(), "initialized .ralph");
    Ok(paths)
}

pub(crate) fn create_dir(path: &Path) -> Result<()> {
    debug!(path = %path.display(), "create directory");
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

/// Validate that an id is safe for use as a directory name.
pub fn validate_run_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("run id must not be empty"));
    }
    if id == "." || id == ".." {
        return Err(anyhow!("run id must not be '.' or '..'"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("run id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

const RALPH_GITIGNORE: &str = "runs/\n";
