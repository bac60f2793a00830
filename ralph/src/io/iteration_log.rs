//! Per-iteration artifacts under `.ralph/runs/<run-id>/iterations/<n>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{FailureReason, VerificationResult};
use crate::io::init::RunPaths;

/// Everything the loop learned about one iteration, for later inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationMeta {
    pub run_id: String,
    pub iteration: u32,
    /// `plan`, `retry` or `continue`.
    pub prompt_kind: String,
    pub escalated: bool,
    pub agent_exit_code: Option<i32>,
    pub agent_timed_out: bool,
    pub agent_launch_error: Option<String>,
    pub saw_sentinel: bool,
    /// `None` when checks were skipped.
    pub verification: Option<VerificationResult>,
    /// Task ids whose completion flag the driver restored.
    pub restored_tasks: Vec<u32>,
    pub failure: Option<FailureReason>,
    /// Diagnostic carried into the next prompt (agent output tail or check excerpt).
    pub failure_detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub prompt_path: PathBuf,
    pub meta_path: PathBuf,
}

impl IterationPaths {
    pub fn new(run: &RunPaths, iteration: u32) -> Self {
        let dir = run.iteration_dir(iteration);
        Self {
            prompt_path: dir.join("prompt.md"),
            meta_path: dir.join("meta.json"),
            dir,
        }
    }
}

/// Persist the prompt before the agent sees it.
pub fn write_prompt(paths: &IterationPaths, prompt: &str) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;
    write_text(&paths.prompt_path, prompt)
}

pub fn write_meta(paths: &IterationPaths, meta: &IterationMeta) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;
    let mut buf = serde_json::to_string_pretty(meta).context("serialize iteration meta")?;
    buf.push('\n');
    write_text(&paths.meta_path, &buf)
}

/// Load a previously written `meta.json`; `Ok(None)` when absent.
pub fn load_meta(paths: &IterationPaths) -> Result<Option<IterationMeta>> {
    let contents = match fs::read_to_string(&paths.meta_path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("read {}", paths.meta_path.display()));
        }
    };
    let meta = serde_json::from_str(&contents)
        .with_context(|| format!("parse {}", paths.meta_path.display()))?;
    Ok(Some(meta))
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::init::RalphPaths;

    #[test]
    fn iteration_paths_are_stable() {
        let run = RalphPaths::new("/work").run("run-1");
        let paths = IterationPaths::new(&run, 3);

        assert!(paths.dir.ends_with(".ralph/runs/run-1/iterations/3"));
        assert!(paths.prompt_path.ends_with("iterations/3/prompt.md"));
        assert!(paths.meta_path.ends_with("iterations/3/meta.json"));
    }

    #[test]
    fn writes_prompt_and_meta() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run = RalphPaths::new(temp.path()).run("run-9");
        let paths = IterationPaths::new(&run, 1);
        let now = Utc::now();
        let meta = IterationMeta {
            run_id: "run-9".to_string(),
            iteration: 1,
            prompt_kind: "plan".to_string(),
            escalated: false,
            agent_exit_code: Some(1),
            agent_timed_out: false,
            agent_launch_error: None,
            saw_sentinel: false,
            verification: None,
            restored_tasks: Vec::new(),
            failure: Some(FailureReason::Agent),
            failure_detail: Some("exit 1".to_string()),
            started_at: now,
            ended_at: now,
            duration_ms: 0,
        };

        write_prompt(&paths, "## prompt\n").expect("prompt");
        write_meta(&paths, &meta).expect("meta");

        assert_eq!(
            fs::read_to_string(&paths.prompt_path).expect("read prompt"),
            "## prompt\n"
        );
        let loaded = load_meta(&paths).expect("load meta");
        assert_eq!(loaded, Some(meta));
        let missing = IterationPaths::new(&run, 2);
        assert_eq!(load_meta(&missing).expect("load missing"), None);
    }
}
