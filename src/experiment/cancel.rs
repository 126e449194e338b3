//! Cooperative cancellation of the active run.
//!
//! The flag is only polled at step, program and target boundaries, so an
//! instrument command in flight always completes before the run stops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct CancelState {
    active: AtomicBool,
    requested: AtomicBool,
}

/// Shared cancellation flag. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancellationController {
    state: Arc<CancelState>,
}

impl CancellationController {
    /// Inactive controller with no pending request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the active run to stop at its next checkpoint.
    ///
    /// Idempotent. Returns `false` and does nothing when no run is active.
    pub fn request_cancel(&self) -> bool {
        if !self.state.active.load(Ordering::Acquire) {
            debug!("cancel requested with no active run, ignored");
            return false;
        }
        if !self.state.requested.swap(true, Ordering::AcqRel) {
            info!("cancel requested");
        }
        true
    }

    /// Whether the active run should stop at this checkpoint.
    pub fn is_cancel_requested(&self) -> bool {
        self.state.requested.load(Ordering::Acquire)
    }

    /// Whether a run is currently armed.
    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::Acquire)
    }

    /// Start of a run: clear any stale request and accept new ones.
    pub fn arm(&self) {
        self.state.requested.store(false, Ordering::Release);
        self.state.active.store(true, Ordering::Release);
    }

    /// End of a run: clear the request and ignore new ones.
    pub fn disarm(&self) {
        self.state.active.store(false, Ordering::Release);
        self.state.requested.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_without_run_is_ignored() {
        let cancel = CancellationController::new();
        assert!(!cancel.request_cancel());
        assert!(!cancel.is_cancel_requested());
    }

    #[test]
    fn test_request_is_idempotent_while_armed() {
        let cancel = CancellationController::new();
        cancel.arm();
        assert!(cancel.request_cancel());
        assert!(cancel.request_cancel());
        assert!(cancel.is_cancel_requested());
    }

    #[test]
    fn test_arm_and_disarm_clear_request() {
        let cancel = CancellationController::new();
        cancel.arm();
        cancel.request_cancel();
        cancel.disarm();
        assert!(!cancel.is_cancel_requested());
        assert!(!cancel.is_active());

        cancel.arm();
        assert!(!cancel.is_cancel_requested());
    }

    #[test]
    fn test_clones_share_state() {
        let cancel = CancellationController::new();
        let handle = cancel.clone();
        cancel.arm();
        handle.request_cancel();
        assert!(cancel.is_cancel_requested());
    }
}
