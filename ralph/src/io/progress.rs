//! Progress store: the task list and activity log that outlive each agent process.
//!
//! Every agent invocation starts without memory of earlier ones, so all
//! cross-iteration state lives here:
//!
//! - `plan.md`: markdown with one fenced ```` ```json ```` block holding
//!   `{"tasks": [...]}`. Written by the agent; rewritten by the driver only to
//!   restore completion flags.
//! - `activity.md`: append-only, timestamped free-text notes. Never parsed.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use jsonschema::validator_for;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::immutability::{check_completed_task_regressions, restore_completed_tasks};
use crate::core::invariants::validate_invariants;
use crate::core::types::Task;
use crate::io::init::RunPaths;

/// JSON Schema every task list must satisfy.
pub const TASK_LIST_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/task_list.schema.json"
));

static JSON_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json[ \t]*\r?\n(.*?)```").expect("block pattern is valid"));

#[derive(Debug, Serialize, Deserialize)]
struct TaskList {
    tasks: Vec<Task>,
}

/// File-backed task list and activity log for one run.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    dir: PathBuf,
    plan_path: PathBuf,
    activity_path: PathBuf,
}

impl ProgressStore {
    pub fn new(paths: &RunPaths) -> Self {
        Self {
            dir: paths.dir.clone(),
            plan_path: paths.plan_path.clone(),
            activity_path: paths.activity_path.clone(),
        }
    }

    pub fn plan_path(&self) -> &Path {
        &self.plan_path
    }

    pub fn activity_path(&self) -> &Path {
        &self.activity_path
    }

    /// Create the run directory and activity log if absent.
    ///
    /// Idempotent: an existing activity log is never truncated, and the plan
    /// is left for the agent to create.
    pub fn initialize(&self, run_id: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create progress dir {}", self.dir.display()))?;
        let header = format!(
            "# Activity log\n\nRun `{run_id}` initialized {}.\n\n",
            timestamp()
        );
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.activity_path)
        {
            Ok(mut file) => {
                file.write_all(header.as_bytes())
                    .with_context(|| format!("write {}", self.activity_path.display()))?;
                debug!(path = %self.activity_path.display(), "activity log created");
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(path = %self.activity_path.display(), "activity log kept");
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("create {}", self.activity_path.display()));
            }
        }
        Ok(())
    }

    /// Read the task list.
    ///
    /// `Ok(None)` when no plan exists yet, or when the plan is present but
    /// unusable (no JSON block, invalid JSON, schema or invariant violation).
    /// A corrupt plan degrades to "no plan" rather than failing the run.
    pub fn read_tasks(&self) -> Result<Option<Vec<Task>>> {
        let contents = match fs::read_to_string(&self.plan_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("read plan {}", self.plan_path.display()));
            }
        };
        match parse_plan(&contents) {
            Ok(tasks) => Ok(Some(tasks)),
            Err(err) => {
                warn!(path = %self.plan_path.display(), err = %format!("{err:#}"), "ignoring unusable plan");
                Ok(None)
            }
        }
    }

    /// True iff a non-empty task list exists and every task is completed.
    pub fn all_tasks_complete(&self) -> Result<bool> {
        Ok(match self.read_tasks()? {
            Some(tasks) => !tasks.is_empty() && tasks.iter().all(|task| task.completed),
            None => false,
        })
    }

    /// Append a timestamped note. Prior entries are never rewritten.
    pub fn append_activity(&self, text: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.activity_path)
            .with_context(|| format!("open {}", self.activity_path.display()))?;
        let entry = format!("## {}\n\n{}\n\n", timestamp(), text.trim_end());
        file.write_all(entry.as_bytes())
            .with_context(|| format!("append {}", self.activity_path.display()))
    }

    /// Last `max_lines` lines of the activity log (empty when absent).
    pub fn recent_activity(&self, max_lines: usize) -> Result<String> {
        let contents = match fs::read_to_string(&self.activity_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("read activity {}", self.activity_path.display()));
            }
        };
        let lines: Vec<&str> = contents.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        Ok(lines[start..].join("\n"))
    }

    /// Atomically replace the task list, keeping the markdown around the JSON block.
    pub fn write_tasks(&self, tasks: &[Task]) -> Result<()> {
        let block = render_json_block(tasks)?;
        let existing = match fs::read_to_string(&self.plan_path) {
            Ok(contents) => Some(contents),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("read plan {}", self.plan_path.display()));
            }
        };
        let contents = match existing {
            Some(current) if JSON_BLOCK_RE.is_match(&current) => JSON_BLOCK_RE
                .replace(&current, regex::NoExpand(&block))
                .into_owned(),
            _ => format!("# Plan\n\n{block}\n"),
        };
        write_atomic(&self.plan_path, &contents)
    }

    /// Re-read the plan after an agent invocation and undo completion regressions.
    ///
    /// `previous` is the snapshot taken before the invocation. Returns the
    /// current task list (after restoration) and the ids that were restored.
    pub fn reconcile(&self, previous: Option<&[Task]>) -> Result<(Option<Vec<Task>>, Vec<u32>)> {
        let current = self.read_tasks()?;
        let Some(previous) = previous else {
            return Ok((current, Vec::new()));
        };
        if !previous.iter().any(|task| task.completed) {
            return Ok((current, Vec::new()));
        }

        let Some(mut tasks) = current else {
            // A vanished or corrupt plan is rebuilt from the last good snapshot.
            let restored: Vec<u32> = previous
                .iter()
                .filter(|task| task.completed)
                .map(|task| task.id)
                .collect();
            warn!(restored = ?restored, "plan unusable after agent run, restoring snapshot");
            self.write_tasks(previous)?;
            return Ok((Some(previous.to_vec()), restored));
        };
        for regression in check_completed_task_regressions(previous, &tasks) {
            warn!(%regression, "agent regressed task list");
        }
        let restored = restore_completed_tasks(previous, &mut tasks);
        if !restored.is_empty() {
            tasks.sort_by_key(|task| task.id);
            info!(restored = ?restored, "restored completed tasks");
            self.write_tasks(&tasks)?;
        }
        Ok((Some(tasks), restored))
    }
}

/// Render a compact checklist of tasks for prompts.
pub fn render_task_summary(tasks: &[Task]) -> String {
    tasks
        .iter()
        .map(|task| {
            let mark = if task.completed { "x" } else { " " };
            format!(
                "- [{mark}] {} ({}): {}",
                task.id,
                task.category,
                task.description.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_plan(contents: &str) -> Result<Vec<Task>> {
    let block = JSON_BLOCK_RE
        .captures(contents)
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| anyhow!("plan has no ```json block"))?
        .as_str();
    let value: Value = serde_json::from_str(block).context("parse plan json")?;
    validate_schema(&value)?;
    let list: TaskList = serde_json::from_value(value).context("deserialize task list")?;
    let errors = validate_invariants(&list.tasks);
    if !errors.is_empty() {
        return Err(anyhow!("task list invariants failed: {}", errors.join("; ")));
    }
    Ok(list.tasks)
}

fn validate_schema(value: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(TASK_LIST_SCHEMA).context("parse task schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(value) {
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "task list schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

fn render_json_block(tasks: &[Task]) -> Result<String> {
    let list = TaskList {
        tasks: tasks.to_vec(),
    };
    let json = serde_json::to_string_pretty(&list).context("serialize task list")?;
    Ok(format!("```json\n{json}\n```"))
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("plan path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("md.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp plan {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace plan {}", path.display()))?;
    Ok(())
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
