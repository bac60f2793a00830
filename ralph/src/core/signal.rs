//! Completion signalling between the agent and the driver.
//!
//! The agent announces that every tracked task is done by printing a fixed
//! marker. Detection sits behind [`CompletionSignal`] so another convention
//! (structured exit status, status file) can replace it without touching the
//! loop controller.

use anyhow::{Result, bail};

/// Default marker the agent prints once all tasks are complete.
pub const DEFAULT_SENTINEL: &str = "RALPH_COMPLETE";

/// Detects a completion announcement in agent output.
pub trait CompletionSignal: Send + Sync {
    /// Inspect one line of output. Called for every line the agent emits.
    fn matches_line(&self, line: &str) -> bool;
}

/// Substring match on a single-line marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelSignal {
    token: String,
}

impl SentinelSignal {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        validate_sentinel(&token)?;
        Ok(Self { token })
    }
}

impl Default for SentinelSignal {
    fn default() -> Self {
        Self {
            token: DEFAULT_SENTINEL.to_string(),
        }
    }
}

impl CompletionSignal for SentinelSignal {
    fn matches_line(&self, line: &str) -> bool {
        line.contains(&self.token)
    }
}

/// Sentinels are matched line by line, so they must be single-line and long
/// enough not to appear by accident.
pub fn validate_sentinel(token: &str) -> Result<()> {
    if token.trim().is_empty() {
        bail!("completion sentinel must not be empty");
    }
    if token.contains('\n') || token.contains('\r') {
        bail!("completion sentinel must be a single line");
    }
    if token.trim().len() < 5 {
        bail!("completion sentinel must be at least 5 characters (got '{token}')");
    }
    Ok(())
}
