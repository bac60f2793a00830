//! Per-iteration termination decision.

use crate::core::types::{PriorFailure, VerificationResult};

/// What happened in one iteration, reduced to the facts the decision needs.
#[derive(Debug, Clone, Copy)]
pub enum IterationFacts<'a> {
    /// The agent exited nonzero, was killed, or never started. Checks were skipped.
    AgentFailed {
        exit_code: Option<i32>,
        timed_out: bool,
        detail: &'a str,
    },
    /// The agent exited cleanly and verification ran.
    Verified {
        result: &'a VerificationResult,
        saw_sentinel: bool,
        all_tasks_complete: bool,
    },
}

/// Controller action after an iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Verification passed and the work is complete.
    Success,
    /// Keep iterating; `prior_failure` feeds the next prompt.
    Continue { prior_failure: PriorFailure },
}

/// Decide whether the run succeeded.
///
/// Success needs verification to pass AND either the completion sentinel or
/// a fully completed task list. A passing verification with open tasks is not
/// a failure: the loop continues with no failure context.
pub fn decide(facts: IterationFacts<'_>) -> Decision {
    match facts {
        IterationFacts::AgentFailed {
            exit_code,
            timed_out,
            detail,
        } => Decision::Continue {
            prior_failure: PriorFailure::Agent {
                exit_code,
                timed_out,
                detail: detail.to_string(),
            },
        },
        IterationFacts::Verified { result, .. } if !result.passed => Decision::Continue {
            prior_failure: PriorFailure::Verification {
                failed_checks: result.failed_checks.iter().cloned().collect(),
                excerpt: result.diagnostic_excerpt.clone(),
            },
        },
        IterationFacts::Verified {
            saw_sentinel,
            all_tasks_complete,
            ..
        } => {
            if saw_sentinel || all_tasks_complete {
                Decision::Success
            } else {
                Decision::Continue {
                    prior_failure: PriorFailure::None,
                }
            }
        }
    }
}

/// True when the agent's exit counts as a clean run.
pub fn agent_succeeded(exit_code: Option<i32>, timed_out: bool) -> bool {
    !timed_out && exit_code == Some(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passing_checks_with_open_tasks_continue_without_failure() {
        let result = VerificationResult::pass();
        let decision = decide(IterationFacts::Verified {
            result: &result,
            saw_sentinel: false,
            all_tasks_complete: false,
        });
        assert_eq!(
            decision,
            Decision::Continue {
                prior_failure: PriorFailure::None
            }
        );
    }

    #[test]
    fn sentinel_or_completion_with_passing_checks_succeeds() {
        let result = VerificationResult::pass();
        for (sentinel, complete) in [(true, false), (false, true), (true, true)] {
            let decision = decide(IterationFacts::Verified {
                result: &result,
                saw_sentinel: sentinel,
                all_tasks_complete: complete,
            });
            assert_eq!(decision, Decision::Success);
        }
    }

    #[test]
    fn failing_checks_never_succeed_even_with_sentinel() {
        let result = VerificationResult::fail(["tests"], "[tests]\nerror: boom\n");
        let decision = decide(IterationFacts::Verified {
            result: &result,
            saw_sentinel: true,
            all_tasks_complete: true,
        });
        assert_eq!(
            decision,
            Decision::Continue {
                prior_failure: PriorFailure::Verification {
                    failed_checks: vec!["tests".to_string()],
                    excerpt: "[tests]\nerror: boom\n".to_string(),
                }
            }
        );
    }

    #[test]
    fn agent_failure_carries_exit_code() {
        let decision = decide(IterationFacts::AgentFailed {
            exit_code: Some(2),
            timed_out: false,
            detail: "crashed",
        });
        let Decision::Continue { prior_failure } = decision else {
            panic!("agent failure must continue");
        };
        assert_eq!(
            prior_failure.summary().as_deref(),
            Some("the agent process exited with status 2")
        );
    }

    #[test]
    fn agent_success_requires_zero_exit_without_timeout() {
        assert!(agent_succeeded(Some(0), false));
        assert!(!agent_succeeded(Some(0), true));
        assert!(!agent_succeeded(Some(1), false));
        assert!(!agent_succeeded(None, false));
    }
}
