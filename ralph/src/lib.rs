//! Iterate-until-verified driver for an external coding agent.
//!
//! Each iteration hands a fresh agent process a prompt, lets it work, then runs
//! the project's own checks. The loop ends when the checks pass and the agent's
//! task list is done, or when the iteration cap is reached. The architecture
//! enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (decision, escalation, excerpts,
//!   task-list invariants). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, config, child
//!   processes). Behind traits where tests need fakes.
//!
//! Orchestration modules ([`run`], [`looping`], [`status`]) coordinate core
//! logic with I/O to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod interrupt;
pub mod io;
pub mod logging;
pub mod looping;
pub mod run;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
