//! Loop configuration stored under `.ralph/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::signal::{DEFAULT_SENTINEL, validate_sentinel};
use crate::core::types::{Check, VerificationMode};
use crate::io::process::CommandSpec;

/// Loop configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values below; CLI flags override the `[run]` table per invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RalphConfig {
    pub run: RunDefaults,
    pub agent: AgentConfig,
    pub verify: VerifyConfig,
    pub prompt: PromptConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunDefaults {
    /// Iteration cap for a run.
    pub max_iterations: u32,
    /// Verification mode name. Unknown names fall back to `all`.
    pub mode: String,
    /// Per-iteration budget handed to the agent, in USD.
    pub budget_usd: f64,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            mode: VerificationMode::All.as_str().to_string(),
            budget_usd: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent command; the prompt is written to its stdin.
    pub command: CommandSpec,
    /// Flag used to pass the budget (`<flag> <amount>`). Empty disables it.
    pub budget_flag: String,
    /// Wall-clock limit per invocation in seconds. `0` means no limit.
    pub timeout_secs: u64,
    /// Lines of agent output retained in memory per invocation.
    pub output_tail_lines: usize,
    /// Marker the agent prints when every task is complete.
    pub completion_sentinel: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: CommandSpec::new(
                "claude",
                ["--print", "--dangerously-skip-permissions"],
            ),
            budget_flag: "--max-budget-usd".to_string(),
            timeout_secs: 0,
            output_tail_lines: 200,
            completion_sentinel: DEFAULT_SENTINEL.to_string(),
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerifyConfig {
    pub tests: CommandSpec,
    pub lint: CommandSpec,
    pub typecheck: CommandSpec,
    pub build: CommandSpec,
    /// Wall-clock limit per check in seconds.
    pub timeout_secs: u64,
    /// Bytes of stdout/stderr captured per check stream.
    pub output_limit_bytes: usize,
    /// Failure lines kept per failed check in the diagnostic excerpt.
    pub excerpt_lines: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            tests: CommandSpec::new("npm", ["test"]),
            lint: CommandSpec::new("npm", ["run", "lint"]),
            typecheck: CommandSpec::new("npx", ["tsc", "--noEmit"]),
            build: CommandSpec::new("npm", ["run", "build"]),
            timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
            excerpt_lines: 8,
        }
    }
}

impl VerifyConfig {
    pub fn command_for(&self, check: Check) -> &CommandSpec {
        match check {
            Check::Tests => &self.tests,
            Check::Lint => &self.lint,
            Check::Typecheck => &self.typecheck,
            Check::Build => &self.build,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    /// Maximum prompt size before droppable sections are removed.
    pub budget_bytes: usize,
    /// Lines of the activity log included as context.
    pub activity_tail_lines: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 40_000,
            activity_tail_lines: 40,
        }
    }
}

impl RalphConfig {
    pub fn validate(&self) -> Result<()> {
        if self.run.max_iterations == 0 {
            return Err(anyhow!("run.max_iterations must be > 0"));
        }
        validate_budget(self.run.budget_usd).context("run.budget_usd")?;
        if self.agent.output_tail_lines == 0 {
            return Err(anyhow!("agent.output_tail_lines must be > 0"));
        }
        validate_sentinel(&self.agent.completion_sentinel)
            .context("agent.completion_sentinel")?;
        if self.verify.timeout_secs == 0 {
            return Err(anyhow!("verify.timeout_secs must be > 0"));
        }
        if self.verify.output_limit_bytes == 0 {
            return Err(anyhow!("verify.output_limit_bytes must be > 0"));
        }
        if self.prompt.budget_bytes == 0 {
            return Err(anyhow!("prompt.budget_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Budgets are handed to the agent verbatim, so they must be positive and finite.
pub fn validate_budget(budget_usd: f64) -> Result<()> {
    if !budget_usd.is_finite() || budget_usd <= 0.0 {
        return Err(anyhow!("budget must be a positive amount (got {budget_usd})"));
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RalphConfig::default()`.
pub fn load_config(path: &Path) -> Result<RalphConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = RalphConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RalphConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RalphConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
