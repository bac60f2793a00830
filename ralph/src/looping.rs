//! The loop controller behind `ralph run`.
//!
//! One iteration: build the prompt, persist it, invoke the agent, verify (only
//! when the agent exited cleanly), restore completion flags the agent undid,
//! record the outcome, then decide. The run ends on success, when the
//! iteration cap is reached, or at an iteration boundary after an interrupt.

use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::decision::{Decision, IterationFacts, decide};
use crate::core::escalation::ESCALATION_ITERATION;
use crate::core::types::{FailureReason, PriorFailure, RunStatus, Task};
use crate::interrupt::Interrupt;
use crate::io::agent::{Agent, AgentRequest, AgentResponse};
use crate::io::iteration_log::{IterationMeta, IterationPaths, load_meta, write_meta, write_prompt};
use crate::io::progress::render_task_summary;
use crate::io::prompt::{PromptBuilder, PromptInputs, PromptKind};
use crate::io::run_state::{IterationRecord, VerificationVerdict, write_run_state};
use crate::io::verification::{Verifier, VerifyRequest};
use crate::run::{RunHandle, relative_to};

/// Agent output lines carried into the next prompt after an agent failure.
const AGENT_DETAIL_LINES: usize = 20;

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// Verification passed and the work was reported complete.
    Success,
    /// The iteration cap was reached without success.
    Exhausted,
    /// An interrupt was observed between iterations.
    Interrupted,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub run_id: String,
    /// Iteration number this invocation started at (`> 1` after a resume).
    pub started_at_iter: u32,
    pub iterations_executed: u32,
    /// Total iterations recorded for the run.
    pub total_iterations: u32,
    pub stop: LoopStop,
}

/// What the CLI prints after each iteration.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub max_iterations: u32,
    pub prompt_kind: PromptKind,
    pub escalated: bool,
    pub record: IterationRecord,
    /// Failure context handed to the next iteration, if any.
    pub prior_failure: PriorFailure,
    pub restored_tasks: Vec<u32>,
}

/// Drive `handle` until success, exhaustion or interrupt.
///
/// Agent and verification failures are recorded and retried; only driver-side
/// errors (unwritable state, prompt rendering) abort with `Err`.
#[instrument(skip_all, fields(run_id = %handle.state.run_id))]
pub fn run_loop<A: Agent, V: Verifier, F: FnMut(&IterationReport)>(
    handle: &mut RunHandle,
    agent: &A,
    verifier: &V,
    interrupt: &Interrupt,
    mut on_iteration: F,
) -> Result<LoopOutcome> {
    let builder = PromptBuilder::new(handle.options.prompt_budget_bytes, &handle.options.sentinel);
    let started_at_iter = handle.state.next_iteration();
    let mut prior_failure = resume_prior_failure(handle)?;
    let mut known_tasks: Option<Vec<Task>> = handle.store.read_tasks()?;
    let mut executed = 0u32;

    let stop = loop {
        let recorded = handle.state.iterations.len() as u32;
        if recorded >= handle.state.max_iterations {
            warn!(
                iterations = recorded,
                max_iterations = handle.state.max_iterations,
                "max iterations reached without success"
            );
            break LoopStop::Exhausted;
        }
        if interrupt.is_requested() {
            warn!(completed = recorded, "interrupted between iterations");
            break LoopStop::Interrupted;
        }

        let iteration = handle.state.next_iteration();
        let started_at = Utc::now();
        let timer = Instant::now();

        let before = handle.store.read_tasks()?;
        if before.is_some() {
            known_tasks.clone_from(&before);
        }
        let pack = builder.build(&PromptInputs {
            iteration,
            max_iterations: handle.state.max_iterations,
            task: handle.state.task.clone(),
            prior_failure: prior_failure.clone(),
            mode: handle.state.mode,
            plan_exists: before.is_some(),
            plan_path: relative_to(&handle.root, handle.store.plan_path()),
            activity_path: relative_to(&handle.root, handle.store.activity_path()),
            recent_activity: handle
                .store
                .recent_activity(handle.options.activity_tail_lines)?,
            task_summary: before
                .as_deref()
                .map(render_task_summary)
                .unwrap_or_default(),
        })?;
        let iter_paths = IterationPaths::new(&handle.paths, iteration);
        write_prompt(&iter_paths, pack.as_str())?;
        info!(iteration, kind = %pack.kind(), escalated = pack.escalated(), "iteration started");

        let response = agent.invoke(&AgentRequest {
            workdir: handle.root.clone(),
            prompt: pack.render(),
            budget_usd: handle.state.budget_usd,
            timeout: handle.options.agent_timeout,
            log_path: handle.paths.agent_log_path.clone(),
            iteration,
            tail_lines: handle.options.output_tail_lines,
            verbose: handle.options.verbose,
        })?;

        let (after, restored) = handle.store.reconcile(known_tasks.as_deref())?;
        if after.is_some() {
            known_tasks = after;
        }
        if !restored.is_empty() {
            handle.store.append_activity(&format!(
                "Driver restored the completed flag of task(s) {}. Completed tasks stay completed.",
                join_ids(&restored)
            ))?;
        }

        let (verification, decision) = if response.succeeded() {
            let result = verifier.verify(&VerifyRequest {
                workdir: handle.root.clone(),
                mode: handle.state.mode,
                iteration,
                log_path: handle.paths.verify_log_path.clone(),
            })?;
            let all_tasks_complete = handle.store.all_tasks_complete()?;
            let decision = decide(IterationFacts::Verified {
                result: &result,
                saw_sentinel: response.saw_sentinel,
                all_tasks_complete,
            });
            (Some(result), decision)
        } else {
            let detail = response.failure_detail(AGENT_DETAIL_LINES);
            let decision = decide(IterationFacts::AgentFailed {
                exit_code: response.exit_code,
                timed_out: response.timed_out,
                detail: &detail,
            });
            (None, decision)
        };

        let failure = failure_reason(&decision);
        let summary = summarize(&decision, &response);
        let record = IterationRecord {
            iteration,
            agent_exit_code: response.exit_code,
            agent_timed_out: response.timed_out,
            saw_sentinel: response.saw_sentinel,
            verification: verification.as_ref().map(|result| VerificationVerdict {
                passed: result.passed,
                failed_checks: result.failed_checks.clone(),
            }),
            failure,
            summary: summary.clone(),
            timestamp: Utc::now(),
        };
        handle.state.push_record(record.clone())?;
        write_run_state(&handle.paths.run_state_path, &handle.state)?;
        handle
            .store
            .append_activity(&format!("Iteration {iteration}: {summary}"))?;

        let next_failure = match &decision {
            Decision::Success => PriorFailure::None,
            Decision::Continue { prior_failure } => prior_failure.clone(),
        };
        write_meta(
            &iter_paths,
            &IterationMeta {
                run_id: handle.state.run_id.clone(),
                iteration,
                prompt_kind: pack.kind().as_str().to_string(),
                escalated: pack.escalated(),
                agent_exit_code: response.exit_code,
                agent_timed_out: response.timed_out,
                agent_launch_error: response.launch_error.clone(),
                saw_sentinel: response.saw_sentinel,
                verification: verification.clone(),
                restored_tasks: restored.clone(),
                failure,
                failure_detail: next_failure.detail().map(str::to_string),
                started_at,
                ended_at: Utc::now(),
                duration_ms: u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX),
            },
        )?;
        executed += 1;

        on_iteration(&IterationReport {
            max_iterations: handle.state.max_iterations,
            prompt_kind: pack.kind(),
            escalated: pack.escalated(),
            record,
            prior_failure: next_failure.clone(),
            restored_tasks: restored,
        });

        if decision == Decision::Success {
            info!(iteration, "run succeeded");
            break LoopStop::Success;
        }
        if iteration == ESCALATION_ITERATION {
            warn!(
                iteration,
                "still failing; later retry prompts ask the agent to reconsider its approach"
            );
        }
        prior_failure = next_failure;
    };

    let status = match stop {
        LoopStop::Success => RunStatus::Success,
        LoopStop::Exhausted => RunStatus::MaxIterationsReached,
        LoopStop::Interrupted => RunStatus::Interrupted,
    };
    handle.state.finish(status);
    write_run_state(&handle.paths.run_state_path, &handle.state)?;
    handle.store.append_activity(&format!(
        "Run finished with status `{}` after {} iteration(s).",
        status.as_str(),
        handle.state.iterations.len()
    ))?;

    Ok(LoopOutcome {
        run_id: handle.state.run_id.clone(),
        started_at_iter,
        iterations_executed: executed,
        total_iterations: handle.state.iterations.len() as u32,
        stop,
    })
}

/// Rebuild the failure context of the last recorded iteration after a resume.
fn resume_prior_failure(handle: &RunHandle) -> Result<PriorFailure> {
    let Some(last) = handle.state.iterations.last() else {
        return Ok(PriorFailure::None);
    };
    let Some(reason) = last.failure else {
        return Ok(PriorFailure::None);
    };
    let meta = load_meta(&IterationPaths::new(&handle.paths, last.iteration))?;
    let detail = meta
        .and_then(|meta| meta.failure_detail)
        .unwrap_or_default();
    Ok(match reason {
        FailureReason::Agent => PriorFailure::Agent {
            exit_code: last.agent_exit_code,
            timed_out: last.agent_timed_out,
            detail,
        },
        FailureReason::Verification => PriorFailure::Verification {
            failed_checks: last
                .verification
                .as_ref()
                .map(|verdict| verdict.failed_checks.iter().cloned().collect())
                .unwrap_or_default(),
            excerpt: detail,
        },
    })
}

fn failure_reason(decision: &Decision) -> Option<FailureReason> {
    match decision {
        Decision::Continue {
            prior_failure: PriorFailure::Agent { .. },
        } => Some(FailureReason::Agent),
        Decision::Continue {
            prior_failure: PriorFailure::Verification { .. },
        } => Some(FailureReason::Verification),
        _ => None,
    }
}

fn summarize(decision: &Decision, response: &AgentResponse) -> String {
    match decision {
        Decision::Success if response.saw_sentinel => {
            "verification passed; agent reported completion".to_string()
        }
        Decision::Success => "verification passed; all tasks complete".to_string(),
        Decision::Continue { prior_failure } => match prior_failure.summary() {
            Some(summary) if response.saw_sentinel && response.launch_error.is_none() => {
                format!("{summary} (completion was claimed but not accepted)")
            }
            Some(summary) => summary,
            None => "verification passed; tasks remain".to_string(),
        },
    }
}

fn join_ids(ids: &[u32]) -> String {
    ids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(exit_code: Option<i32>, saw_sentinel: bool) -> AgentResponse {
        AgentResponse {
            exit_code,
            saw_sentinel,
            ..AgentResponse::default()
        }
    }

    #[test]
    fn failure_reason_follows_decision() {
        assert_eq!(failure_reason(&Decision::Success), None);
        assert_eq!(
            failure_reason(&Decision::Continue {
                prior_failure: PriorFailure::None
            }),
            None
        );
        assert_eq!(
            failure_reason(&Decision::Continue {
                prior_failure: PriorFailure::Agent {
                    exit_code: Some(1),
                    timed_out: false,
                    detail: String::new(),
                }
            }),
            Some(FailureReason::Agent)
        );
        assert_eq!(
            failure_reason(&Decision::Continue {
                prior_failure: PriorFailure::Verification {
                    failed_checks: vec!["lint".to_string()],
                    excerpt: String::new(),
                }
            }),
            Some(FailureReason::Verification)
        );
    }

    /// A claimed completion that is not accepted is called out in the summary.
    #[test]
    fn summary_mentions_rejected_completion_claim() {
        let decision = Decision::Continue {
            prior_failure: PriorFailure::Agent {
                exit_code: Some(3),
                timed_out: false,
                detail: String::new(),
            },
        };
        assert_eq!(
            summarize(&decision, &response(Some(3), true)),
            "the agent process exited with status 3 (completion was claimed but not accepted)"
        );
        assert_eq!(
            summarize(
                &Decision::Continue {
                    prior_failure: PriorFailure::None
                },
                &response(Some(0), false)
            ),
            "verification passed; tasks remain"
        );
        assert_eq!(
            summarize(&Decision::Success, &response(Some(0), true)),
            "verification passed; agent reported completion"
        );
    }

    #[test]
    fn ids_are_comma_separated() {
        assert_eq!(join_ids(&[1, 4]), "1, 4");
    }
}
