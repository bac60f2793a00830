//! Prompt builder: deterministic agent input for one iteration.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When the rendered prompt exceeds the byte budget, droppable context goes
//! first; required sections are only ever truncated, never removed.

use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::escalation::escalation_due;
use crate::core::types::{PriorFailure, VerificationMode};

const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const RETRY_TEMPLATE: &str = include_str!("prompts/retry.md");
const CONTINUE_TEMPLATE: &str = include_str!("prompts/continue.md");

/// Droppable sections, least valuable first.
const DROP_ORDER: [&str; 2] = ["activity", "tasks"];

const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Which instruction block a prompt carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// No usable task list: decompose the goal first.
    Plan,
    /// A task list exists and the previous iteration failed.
    Retry,
    /// A task list exists and nothing failed.
    Continue,
}

impl PromptKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PromptKind::Plan => "plan",
            PromptKind::Retry => "retry",
            PromptKind::Continue => "continue",
        }
    }
}

impl fmt::Display for PromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything one prompt is assembled from.
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub iteration: u32,
    pub max_iterations: u32,
    /// Goal text as given by the user.
    pub task: String,
    pub prior_failure: PriorFailure,
    pub mode: VerificationMode,
    /// Whether a usable task list was read from the plan file.
    pub plan_exists: bool,
    pub plan_path: PathBuf,
    pub activity_path: PathBuf,
    /// Tail of the activity log.
    pub recent_activity: String,
    /// Checklist rendering of the task list, empty when there is none.
    pub task_summary: String,
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template(PromptKind::Plan.as_str(), PLAN_TEMPLATE)
            .context("load plan template")?;
        env.add_template(PromptKind::Retry.as_str(), RETRY_TEMPLATE)
            .context("load retry template")?;
        env.add_template(PromptKind::Continue.as_str(), CONTINUE_TEMPLATE)
            .context("load continue template")?;
        Ok(Self { env })
    }

    fn render(&self, kind: PromptKind, input: &PromptInputs, sentinel: &str) -> Result<String> {
        let template = self.env.get_template(kind.as_str())?;
        let checks: Vec<&str> = input.mode.checks().iter().map(|c| c.as_str()).collect();
        let rendered = template
            .render(context! {
                iteration => input.iteration,
                max_iterations => input.max_iterations,
                task => input.task.trim(),
                mode => input.mode.as_str(),
                checks => checks,
                failure_summary => input.prior_failure.summary(),
                failure_detail => input.prior_failure.detail(),
                escalate => !input.prior_failure.is_none() && escalation_due(input.iteration),
                plan_path => input.plan_path.display().to_string(),
                activity_path => input.activity_path.display().to_string(),
                tasks => non_empty(&input.task_summary),
                activity => non_empty(&input.recent_activity),
                sentinel => sentinel,
            })
            .with_context(|| format!("render {kind} prompt"))?;
        Ok(rendered)
    }
}

fn non_empty(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    /// Section content without the marker.
    content: String,
}

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker pattern is valid")
});

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

fn total_len(sections: &[ParsedSection]) -> usize {
    let separators = sections.len().saturating_sub(1) * 2;
    sections.iter().map(|s| s.content.len()).sum::<usize>() + separators
}

/// Shrink sections until they fit `budget` bytes.
///
/// Droppable sections go in `DROP_ORDER`. If that is not enough, the longest
/// section before the closing instruction is truncated, so the prompt always
/// ends with the completion instruction.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let total = total_len(sections);
    if total <= budget || sections.len() < 2 {
        return;
    }
    let last = sections.len() - 1;
    let Some(idx) = (0..last).max_by_key(|&i| sections[i].content.len()) else {
        return;
    };
    let section = &mut sections[idx];
    let before_len = section.content.len();
    let excess = total - budget;
    let keep = before_len.saturating_sub(excess + TRUNCATION_MARKER.len());
    let cut = floor_char_boundary(&section.content, keep);
    section.content.truncate(cut);
    section.content.push_str(TRUNCATION_MARKER);
    debug!(
        section = %section.key,
        before_len,
        after_len = section.content.len(),
        "truncated section for budget"
    );
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut idx = index;
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
    sentinel: String,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize, sentinel: impl Into<String>) -> Self {
        Self {
            budget_bytes,
            sentinel: sentinel.into(),
        }
    }

    /// Select the instruction block for `input` and render it.
    pub fn build(&self, input: &PromptInputs) -> Result<PromptPack> {
        let kind = select_kind(input);
        let escalated = !input.prior_failure.is_none() && escalation_due(input.iteration);
        let rendered = PromptEngine::new()?.render(kind, input, &self.sentinel)?;

        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        let mut content = render_sections(&sections);
        content.push('\n');

        debug!(kind = %kind, escalated, bytes = content.len(), "prompt built");
        Ok(PromptPack {
            kind,
            escalated,
            content,
        })
    }
}

fn select_kind(input: &PromptInputs) -> PromptKind {
    if !input.plan_exists {
        PromptKind::Plan
    } else if input.prior_failure.is_none() {
        PromptKind::Continue
    } else {
        PromptKind::Retry
    }
}

/// A rendered prompt ready to send to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPack {
    kind: PromptKind,
    escalated: bool,
    content: String,
}

impl PromptPack {
    pub fn kind(&self) -> PromptKind {
        self.kind
    }

    /// Whether the escalation notice was included.
    pub fn escalated(&self) -> bool {
        self.escalated
    }

    pub fn as_str(&self) -> &str {
        &self.content
    }

    pub fn render(&self) -> String {
        self.content.clone()
    }
}
