//! Agent abstraction for iteration work.
//!
//! The [`Agent`] trait decouples the loop from the actual coding agent
//! (by default the `claude` CLI). Tests use scripted agents that return
//! predetermined responses without spawning processes.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use tracing::{info, instrument, warn};

use crate::core::decision::agent_succeeded;
use crate::core::signal::CompletionSignal;
use crate::interrupt::Interrupt;
use crate::io::process::{CommandSpec, LineMatcher, StreamOptions, run_command_streaming};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory for the agent process (the workspace root).
    pub workdir: PathBuf,
    /// Prompt text, written to the agent's stdin.
    pub prompt: String,
    /// Spending cap handed to the agent, in USD.
    pub budget_usd: f64,
    /// `None` waits for the agent indefinitely.
    pub timeout: Option<Duration>,
    /// Run-scoped log receiving every output line.
    pub log_path: PathBuf,
    pub iteration: u32,
    /// Output lines retained in the response.
    pub tail_lines: usize,
    /// Echo agent output to stderr as it arrives.
    pub verbose: bool,
}

/// Outcome of one agent invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentResponse {
    /// `None` when the process never started or was killed.
    pub exit_code: Option<i32>,
    /// Most recent output lines.
    pub output: Vec<String>,
    /// Whether any output line carried the completion signal.
    pub saw_sentinel: bool,
    pub timed_out: bool,
    /// Set when the agent process could not be started.
    pub launch_error: Option<String>,
}

impl AgentResponse {
    /// Clean exit within the time limit.
    pub fn succeeded(&self) -> bool {
        self.launch_error.is_none() && agent_succeeded(self.exit_code, self.timed_out)
    }

    /// Short diagnostic for the next prompt when the invocation failed.
    pub fn failure_detail(&self, max_lines: usize) -> String {
        if let Some(err) = &self.launch_error {
            return format!("failed to launch agent: {err}");
        }
        let start = self.output.len().saturating_sub(max_lines);
        self.output[start..].join("\n")
    }
}

/// Abstraction over agent backends.
pub trait Agent {
    /// Run the agent once. Process failures are reported in the response;
    /// `Err` is reserved for driver-side I/O failures (unwritable log).
    fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse>;
}

/// Agent that spawns a configured command and feeds the prompt on stdin.
pub struct CommandAgent {
    command: CommandSpec,
    budget_flag: String,
    signal: Arc<dyn CompletionSignal>,
    interrupt: Option<Interrupt>,
}

impl CommandAgent {
    pub fn new(
        command: CommandSpec,
        budget_flag: impl Into<String>,
        signal: Arc<dyn CompletionSignal>,
    ) -> Self {
        Self {
            command,
            budget_flag: budget_flag.into(),
            signal,
            interrupt: None,
        }
    }

    /// Forward Ctrl-C to the running agent's process group.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    fn extra_args(&self, budget_usd: f64) -> Vec<String> {
        if self.budget_flag.is_empty() {
            return Vec::new();
        }
        vec![self.budget_flag.clone(), format!("{budget_usd:.2}")]
    }
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(iteration = request.iteration, program = %self.command.program()))]
    fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse> {
        write_log_header(&request.log_path, request.iteration, &self.command)?;
        info!(workdir = %request.workdir.display(), "starting agent");

        let cmd = self
            .command
            .to_command(&request.workdir, self.extra_args(request.budget_usd));
        let signal = Arc::clone(&self.signal);
        let matcher: LineMatcher = Arc::new(move |line: &str| signal.matches_line(line));

        let streamed = match run_command_streaming(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            StreamOptions {
                log_path: &request.log_path,
                tail_lines: request.tail_lines,
                echo: request.verbose,
                matcher: Some(matcher),
                cancel: self.interrupt.as_ref().map(Interrupt::flag),
            },
        ) {
            Ok(streamed) => streamed,
            Err(err) => {
                let message = format!("{err:#}");
                warn!(err = %message, "agent could not be run");
                append_log_line(&request.log_path, &format!("[ralph] {message}"))?;
                return Ok(AgentResponse {
                    launch_error: Some(message),
                    ..AgentResponse::default()
                });
            }
        };

        let exit_code = if streamed.timed_out {
            None
        } else {
            streamed.status.code()
        };
        if streamed.timed_out {
            append_log_line(&request.log_path, "[ralph] agent timed out and was killed")?;
        }
        let response = AgentResponse {
            exit_code,
            output: streamed.tail,
            saw_sentinel: streamed.matched,
            timed_out: streamed.timed_out,
            launch_error: None,
        };
        if response.succeeded() {
            info!(saw_sentinel = response.saw_sentinel, "agent finished");
        } else {
            warn!(exit_code = ?response.exit_code, timed_out = response.timed_out, "agent failed");
        }
        Ok(response)
    }
}

fn write_log_header(path: &Path, iteration: u32, command: &CommandSpec) -> Result<()> {
    append_log_line(
        path,
        &format!(
            "\n=== iteration {iteration} · {} · {command} ===",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        ),
    )
}

fn append_log_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create agent log dir {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open agent log {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("append agent log {}", path.display()))
}
