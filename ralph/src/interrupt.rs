//! Between-iteration cancellation.
//!
//! Ctrl-C sets a flag; the loop checks it before starting each iteration, so
//! an interrupted run never leaves a half-recorded iteration behind. Children
//! run in their own process group and do not see the terminal's signal, so
//! the agent and check runners forward it from this flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::warn;

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    requested: Arc<AtomicBool>,
}

impl Interrupt {
    /// A flag nothing but [`Interrupt::request`] will ever set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a Ctrl-C handler that sets the flag. Call at most once per process.
    pub fn install() -> Result<Self> {
        let interrupt = Self::new();
        let flag = Arc::clone(&interrupt.requested);
        ctrlc::set_handler(move || {
            if !flag.swap(true, Ordering::SeqCst) {
                warn!("interrupt received; stopping after the current iteration");
            }
        })
        .context("install interrupt handler")?;
        Ok(interrupt)
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// The shared flag, for child waits that forward the interrupt.
    pub fn flag(&self) -> &AtomicBool {
        &self.requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let interrupt = Interrupt::new();
        let observer = interrupt.clone();
        assert!(!observer.is_requested());
        interrupt.request();
        assert!(observer.is_requested());
    }
}
