//! Test-only helpers: task fixtures and scripted agent/verifier fakes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde_json::json;
use tempfile::TempDir;

use crate::core::types::{Task, VerificationMode, VerificationResult};
use crate::io::agent::{Agent, AgentRequest, AgentResponse};
use crate::io::config::RalphConfig;
use crate::io::verification::{Verifier, VerifyRequest};
use crate::run::{LoopOptions, RunHandle, RunSettings, start_run};

/// Create a deterministic task with default fields.
pub fn task(id: u32, completed: bool) -> Task {
    Task {
        id,
        category: "general".to_string(),
        description: format!("task {id}"),
        completed,
        extra: Default::default(),
    }
}

/// Render a plan file the way an agent would write it.
pub fn plan_markdown(tasks: &[Task]) -> String {
    let body = serde_json::to_string_pretty(&json!({ "tasks": tasks })).unwrap_or_default();
    format!("# Plan\n\nWritten by the scripted agent.\n\n```json\n{body}\n```\n")
}

/// One scripted agent invocation.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    pub exit_code: Option<i32>,
    pub output: Vec<String>,
    pub saw_sentinel: bool,
    pub timed_out: bool,
    pub launch_error: Option<String>,
    /// Task list written to the plan file during the turn.
    pub tasks: Option<Vec<Task>>,
}

impl ScriptedTurn {
    /// Clean exit, no output.
    pub fn ok() -> Self {
        Self {
            exit_code: Some(0),
            ..Self::default()
        }
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            output: vec![format!("agent exiting with {code}")],
            ..Self::default()
        }
    }

    pub fn with_sentinel(mut self) -> Self {
        self.saw_sentinel = true;
        self.output.push("RALPH_COMPLETE".to_string());
        self
    }

    pub fn writing_tasks(mut self, tasks: Vec<Task>) -> Self {
        self.tasks = Some(tasks);
        self
    }
}

/// Agent fake that replays scripted turns and records every prompt.
pub struct ScriptedAgent {
    plan_path: PathBuf,
    turns: RefCell<VecDeque<ScriptedTurn>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(plan_path: impl Into<PathBuf>, turns: Vec<ScriptedTurn>) -> Self {
        Self {
            plan_path: plan_path.into(),
            turns: RefCell::new(turns.into()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    /// Prompts received so far, in invocation order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.borrow().len()
    }
}

impl Agent for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse> {
        self.prompts.borrow_mut().push(request.prompt.clone());
        let turn = self
            .turns
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no turn for iteration {}", request.iteration))?;

        if let Some(tasks) = &turn.tasks {
            if let Some(parent) = self.plan_path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            fs::write(&self.plan_path, plan_markdown(tasks))
                .with_context(|| format!("write {}", self.plan_path.display()))?;
        }

        Ok(AgentResponse {
            exit_code: turn.exit_code,
            output: turn.output,
            saw_sentinel: turn.saw_sentinel,
            timed_out: turn.timed_out,
            launch_error: turn.launch_error,
        })
    }
}

/// Verifier fake that replays results and records the requested modes.
pub struct ScriptedVerifier {
    results: RefCell<VecDeque<VerificationResult>>,
    modes: RefCell<Vec<VerificationMode>>,
}

impl ScriptedVerifier {
    pub fn new(results: Vec<VerificationResult>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            modes: RefCell::new(Vec::new()),
        }
    }

    /// Verifier whose every pass fails `check`.
    pub fn always_failing(check: &str, times: usize) -> Self {
        let result =
            VerificationResult::fail([check], format!("[{check}]\nerror: {check} failed\n"));
        Self::new(vec![result; times])
    }

    pub fn modes(&self) -> Vec<VerificationMode> {
        self.modes.borrow().clone()
    }

    pub fn calls(&self) -> usize {
        self.modes.borrow().len()
    }
}

impl Verifier for ScriptedVerifier {
    fn verify(&self, request: &VerifyRequest) -> Result<VerificationResult> {
        self.modes.borrow_mut().push(request.mode);
        self.results
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted verifier has no result for iteration {}", request.iteration))
    }
}

/// Temporary workspace root for loop tests.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir().context("create temp workspace")?,
        })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Loop options from the default config.
    pub fn options(&self) -> LoopOptions {
        LoopOptions::from_config(&RalphConfig::default(), false)
    }

    /// Start a run with the given cap and mode.
    pub fn start(&self, task: &str, max_iterations: u32, mode: VerificationMode) -> Result<RunHandle> {
        start_run(
            self.root(),
            task,
            RunSettings {
                max_iterations,
                mode,
                budget_usd: 1.0,
            },
            self.options(),
        )
    }
}
