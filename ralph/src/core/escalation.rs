//! Escalation policy for repeated failures.
//!
//! Escalation never changes control flow. It only adds a notice to prompts
//! that follow a failure, telling the agent to step back and reconsider its
//! approach.

/// First iteration whose failure prompt carries the escalation notice.
pub const ESCALATION_ITERATION: u32 = 3;

/// True when a prompt for `iteration` that follows a failure must include the notice.
pub fn escalation_due(iteration: u32) -> bool {
    iteration >= ESCALATION_ITERATION
}
