use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

const QUIT_IDLE: u8 = 0;
const QUIT_REQUESTED: u8 = 1;
const QUIT_OBSERVED: u8 = 2;

/// Process-wide flags shared between the scheduler and anything that may ask it to stop.
///
/// Requests can arrive from any thread at any time; the scheduler only observes the quit
/// request at iteration boundaries. Once observed, a quit can no longer be aborted.
#[derive(Debug, Default)]
pub struct SchedulerContext {
    quit_state: AtomicU8,
    disconnect_requested: AtomicBool,
    final_snapshot_claimed: AtomicBool,
}

impl SchedulerContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_quit(&self, reason: &'static str) {
        if self
            .quit_state
            .compare_exchange(QUIT_IDLE, QUIT_REQUESTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!(reason, "quit_requested");
        }
    }

    /// Withdraws a quit request the scheduler has not acted on yet.
    pub fn abort_quit(&self) -> bool {
        match self.quit_state.compare_exchange(
            QUIT_REQUESTED,
            QUIT_IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                info!("quit_aborted");
                true
            }
            Err(QUIT_OBSERVED) => {
                warn!("quit_abort_ignored_shutdown_started");
                false
            }
            Err(_) => false,
        }
    }

    pub fn quit_requested(&self) -> bool {
        self.quit_state.load(Ordering::Acquire) != QUIT_IDLE
    }

    pub fn shutdown_started(&self) -> bool {
        self.quit_state.load(Ordering::Acquire) == QUIT_OBSERVED
    }

    /// Latches a pending quit request. Returns `true` when shutdown should begin.
    pub(crate) fn observe_quit(&self) -> bool {
        match self.quit_state.compare_exchange(
            QUIT_REQUESTED,
            QUIT_OBSERVED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(state) => state == QUIT_OBSERVED,
        }
    }

    pub fn request_disconnect(&self, reason: &'static str) {
        if !self.disconnect_requested.swap(true, Ordering::AcqRel) {
            info!(reason, "disconnect_requested");
        }
    }

    pub fn disconnect_requested(&self) -> bool {
        self.disconnect_requested.load(Ordering::Acquire)
    }

    /// `true` for exactly one caller over the life of the context.
    pub fn claim_final_snapshot(&self) -> bool {
        !self.final_snapshot_claimed.swap(true, Ordering::AcqRel)
    }

    pub fn final_snapshot_claimed(&self) -> bool {
        self.final_snapshot_claimed.load(Ordering::Acquire)
    }

    pub fn quit_handle(self: &Arc<Self>) -> QuitHandle {
        QuitHandle {
            context: Arc::clone(self),
        }
    }
}

/// Cloneable, thread-safe handle for signal handlers, UI actions and remote commands.
#[derive(Debug, Clone)]
pub struct QuitHandle {
    context: Arc<SchedulerContext>,
}

impl QuitHandle {
    pub fn request_quit(&self, reason: &'static str) {
        self.context.request_quit(reason);
    }

    pub fn abort_quit(&self) -> bool {
        self.context.abort_quit()
    }

    pub fn request_disconnect(&self, reason: &'static str) {
        self.context.request_disconnect(reason);
    }

    pub fn quit_requested(&self) -> bool {
        self.context.quit_requested()
    }
}
