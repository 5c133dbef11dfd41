//! Interrupt handling
//!
//! The first Ctrl-C (or SIGTERM) asks the training loop to stop after the
//! current step and save; a second one exits immediately.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;
use train_core::{Error, Result};

/// Exit code used when a second interrupt forces the process down
pub const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Default)]
struct Inner {
    requested: AtomicBool,
    count: AtomicUsize,
}

/// Shared interrupt state, checked by the loop between steps
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<Inner>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one interrupt and return how many have arrived so far
    pub fn request(&self) -> usize {
        self.0.requested.store(true, Ordering::SeqCst);
        self.0.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_requested(&self) -> bool {
        self.0.requested.load(Ordering::SeqCst)
    }
}

/// Route Ctrl-C and SIGTERM into `flag`
pub fn install_handler(flag: InterruptFlag) -> Result<()> {
    ctrlc::set_handler(move || {
        if flag.request() == 1 {
            warn!("Interrupt received, stopping after the current step");
        } else {
            warn!("Second interrupt received, exiting without saving");
            std::process::exit(FORCED_EXIT_CODE);
        }
    })
    .map_err(|e| Error::Internal {
        message: format!("Failed to install interrupt handler: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_counts_requests() {
        let flag = InterruptFlag::new();
        assert!(!flag.is_requested());

        let shared = flag.clone();
        assert_eq!(shared.request(), 1);
        assert!(flag.is_requested());
        assert_eq!(flag.request(), 2);
    }
}
