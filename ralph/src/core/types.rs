//! Shared deterministic types for loop core logic.
//!
//! These types define stable contracts between the controller and its
//! collaborators. They do not depend on external state or I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One unit of work tracked across iterations (an entry of `plan.md`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: u32,
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub completed: bool,
    /// Optional structured fields (e.g. `test_type`) kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A single external check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Check {
    Tests,
    Lint,
    Typecheck,
    Build,
}

impl Check {
    pub fn as_str(self) -> &'static str {
        match self {
            Check::Tests => "tests",
            Check::Lint => "lint",
            Check::Typecheck => "typecheck",
            Check::Build => "build",
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which checks constitute "passing" for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMode {
    Tests,
    Lint,
    Typecheck,
    Build,
    Quick,
    #[default]
    All,
}

impl VerificationMode {
    /// Checks selected by this mode, in execution order.
    pub fn checks(self) -> &'static [Check] {
        match self {
            VerificationMode::Tests => &[Check::Tests],
            VerificationMode::Lint => &[Check::Lint],
            VerificationMode::Typecheck => &[Check::Typecheck],
            VerificationMode::Build => &[Check::Build],
            VerificationMode::Quick => &[Check::Lint, Check::Typecheck],
            VerificationMode::All => &[Check::Tests, Check::Lint, Check::Typecheck],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VerificationMode::Tests => "tests",
            VerificationMode::Lint => "lint",
            VerificationMode::Typecheck => "typecheck",
            VerificationMode::Build => "build",
            VerificationMode::Quick => "quick",
            VerificationMode::All => "all",
        }
    }

    /// Parse a mode name, falling back to `All` for anything unrecognized.
    pub fn parse_lenient(raw: &str) -> Self {
        raw.parse().unwrap_or_default()
    }
}

impl FromStr for VerificationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tests" | "test" => Ok(VerificationMode::Tests),
            "lint" => Ok(VerificationMode::Lint),
            "typecheck" | "types" => Ok(VerificationMode::Typecheck),
            "build" => Ok(VerificationMode::Build),
            "quick" => Ok(VerificationMode::Quick),
            "all" => Ok(VerificationMode::All),
            other => Err(format!("unknown verification mode '{other}'")),
        }
    }
}

impl fmt::Display for VerificationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reduced outcome of a verification pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    pub failed_checks: BTreeSet<String>,
    /// Failure-indicative lines for humans and the agent. Never branched on.
    pub diagnostic_excerpt: String,
}

impl VerificationResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            failed_checks: BTreeSet::new(),
            diagnostic_excerpt: String::new(),
        }
    }

    pub fn fail<I, S>(checks: I, excerpt: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            passed: false,
            failed_checks: checks.into_iter().map(Into::into).collect(),
            diagnostic_excerpt: excerpt.into(),
        }
    }
}

/// Why an iteration did not verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureReason {
    /// Agent exited nonzero, could not be launched, or timed out.
    Agent,
    /// One or more verification checks failed.
    Verification,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::Agent => "agent",
            FailureReason::Verification => "verification",
        }
    }
}

/// Failure context carried from one iteration into the next prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PriorFailure {
    /// No failure to report (first iteration or last iteration verified).
    #[default]
    None,
    Agent {
        exit_code: Option<i32>,
        timed_out: bool,
        detail: String,
    },
    Verification {
        failed_checks: Vec<String>,
        excerpt: String,
    },
}

impl PriorFailure {
    pub fn is_none(&self) -> bool {
        matches!(self, PriorFailure::None)
    }

    /// One-line summary for prompts and progress output.
    pub fn summary(&self) -> Option<String> {
        match self {
            PriorFailure::None => None,
            PriorFailure::Agent {
                timed_out: true, ..
            } => Some("the agent process timed out and was terminated".to_string()),
            PriorFailure::Agent {
                exit_code: Some(code),
                ..
            } => Some(format!("the agent process exited with status {code}")),
            PriorFailure::Agent {
                exit_code: None, ..
            } => Some("the agent process could not be run to completion".to_string()),
            PriorFailure::Verification { failed_checks, .. } => Some(format!(
                "verification failed: {}",
                failed_checks.join(", ")
            )),
        }
    }

    /// Diagnostic text accompanying the summary, if any.
    pub fn detail(&self) -> Option<&str> {
        let text = match self {
            PriorFailure::None => return None,
            PriorFailure::Agent { detail, .. } => detail.as_str(),
            PriorFailure::Verification { excerpt, .. } => excerpt.as_str(),
        };
        let trimmed = text.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    MaxIterationsReached,
    /// Stopped between iterations by an interrupt; resumable.
    Interrupted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::MaxIterationsReached => "max_iterations_reached",
            RunStatus::Interrupted => "interrupted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quick_mode_selects_lint_and_typecheck_only() {
        assert_eq!(
            VerificationMode::Quick.checks(),
            &[Check::Lint, Check::Typecheck]
        );
    }

    #[test]
    fn all_mode_excludes_build() {
        let checks = VerificationMode::All.checks();
        assert!(checks.contains(&Check::Tests));
        assert!(!checks.contains(&Check::Build));
    }

    #[test]
    fn unknown_mode_falls_back_to_all() {
        assert_eq!(
            VerificationMode::parse_lenient("everything"),
            VerificationMode::All
        );
        assert_eq!(
            VerificationMode::parse_lenient(" Quick "),
            VerificationMode::Quick
        );
    }

    #[test]
    fn task_keeps_optional_fields_and_defaults_completion() {
        let raw = r#"{"id":1,"category":"auth","description":"login","test_type":"unit"}"#;
        let task: Task = serde_json::from_str(raw).expect("parse task");
        assert!(!task.completed);
        assert_eq!(task.extra.get("test_type"), Some(&Value::from("unit")));

        let back = serde_json::to_value(&task).expect("serialize");
        assert_eq!(back["test_type"], "unit");
        assert_eq!(back["completed"], false);
    }

    #[test]
    fn prior_failure_summaries() {
        assert_eq!(PriorFailure::None.summary(), None);
        let failure = PriorFailure::Verification {
            failed_checks: vec!["lint".to_string(), "tests".to_string()],
            excerpt: "  \n".to_string(),
        };
        assert_eq!(
            failure.summary().as_deref(),
            Some("verification failed: lint, tests")
        );
        assert_eq!(failure.detail(), None);
    }
}
