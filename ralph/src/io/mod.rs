//! Side-effecting adapters: filesystem layout, config, child processes and the agent.

pub mod agent;
pub mod config;
pub mod init;
pub mod iteration_log;
pub mod process;
pub mod progress;
pub mod prompt;
pub mod run_state;
pub mod verification;
