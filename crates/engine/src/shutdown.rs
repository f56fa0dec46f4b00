use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::context::SchedulerContext;

pub const SAVING_FINAL_DATA: &str = "Saving final data...";
pub const LOGGING_OUT: &str = "Logging out...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    WaitingOnDialogs,
    WaitingOnUploads,
    WaitingOnLogout,
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    LogoutAcknowledged,
    LogoutTimeout,
    /// The circuit was already gone, so no logout handshake was attempted.
    Disconnected,
}

/// Status queries and actions the sequencer needs from the session and UI layers.
pub trait ShutdownQueries {
    fn open_modal_count(&self) -> usize;
    fn open_floater_blocking_count(&self) -> usize;
    fn pending_upload_count(&self) -> usize;
    fn send_logout_request(&mut self);
    fn logout_acknowledged(&self) -> bool;
    fn capture_final_snapshot(&mut self);

    fn show_progress(&mut self, _percent: f32, _message: &str) {}
}

/// Forward-only shutdown state machine.
///
/// Each `step` evaluates the current state once. The two deadlines make the total wait
/// after the dialogs close at most `upload_timeout + logout_timeout`, plus one step.
#[derive(Debug, Clone)]
pub struct ShutdownSequencer {
    state: ShutdownState,
    upload_timeout: Duration,
    logout_timeout: Duration,
    uploads_started_at: Option<Instant>,
    logout_sent_at: Option<Instant>,
    largest_upload_backlog: usize,
    discarded_uploads: usize,
    termination: Option<TerminationReason>,
}

impl ShutdownSequencer {
    pub fn new(upload_timeout: Duration, logout_timeout: Duration) -> Self {
        Self {
            state: ShutdownState::Running,
            upload_timeout,
            logout_timeout,
            uploads_started_at: None,
            logout_sent_at: None,
            largest_upload_backlog: 0,
            discarded_uploads: 0,
            termination: None,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.upload_save_timeout(), config.logout_timeout())
    }

    pub fn state(&self) -> ShutdownState {
        self.state
    }

    pub fn is_terminating(&self) -> bool {
        self.state == ShutdownState::Terminating
    }

    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.termination
    }

    /// Uploads still pending when the upload deadline forced the logout.
    pub fn discarded_uploads(&self) -> usize {
        self.discarded_uploads
    }

    pub fn logout_request_sent(&self) -> bool {
        self.logout_sent_at.is_some()
    }

    /// Leaves `Running`. Calling it again once shutdown has begun does nothing.
    pub fn begin(&mut self) {
        if self.state == ShutdownState::Running {
            self.transition(ShutdownState::WaitingOnDialogs);
        }
    }

    pub fn step(
        &mut self,
        now: Instant,
        queries: &mut impl ShutdownQueries,
        context: &SchedulerContext,
    ) -> ShutdownState {
        match self.state {
            ShutdownState::Running | ShutdownState::Terminating => {}
            ShutdownState::WaitingOnDialogs => self.step_dialogs(now, queries, context),
            ShutdownState::WaitingOnUploads => self.step_uploads(now, queries, context),
            ShutdownState::WaitingOnLogout => self.step_logout(now, queries, context),
        }
        self.state
    }

    fn step_dialogs(
        &mut self,
        now: Instant,
        queries: &mut impl ShutdownQueries,
        context: &SchedulerContext,
    ) {
        // Blocking floaters are force-closed once the region is gone; modals stay local.
        let blocking_floaters = if context.disconnect_requested() {
            0
        } else {
            queries.open_floater_blocking_count()
        };
        if queries.open_modal_count() > 0 || blocking_floaters > 0 {
            return;
        }
        if context.claim_final_snapshot() {
            queries.capture_final_snapshot();
            info!("final_snapshot_captured");
        }
        self.uploads_started_at = Some(now);
        self.transition(ShutdownState::WaitingOnUploads);
    }

    fn step_uploads(
        &mut self,
        now: Instant,
        queries: &mut impl ShutdownQueries,
        context: &SchedulerContext,
    ) {
        let pending = queries.pending_upload_count();
        if context.disconnect_requested() {
            self.discarded_uploads = pending;
            self.terminate(TerminationReason::Disconnected);
            return;
        }
        // The backlog can still grow after quit was requested.
        self.largest_upload_backlog = self.largest_upload_backlog.max(pending);
        let started_at = *self.uploads_started_at.get_or_insert(now);
        let waited = now.saturating_duration_since(started_at);

        if pending > 0 && waited < self.upload_timeout && !self.logout_request_sent() {
            let finished = self.largest_upload_backlog - pending;
            let percent = 100.0 * finished as f32 / self.largest_upload_backlog as f32;
            queries.show_progress(percent, SAVING_FINAL_DATA);
            return;
        }

        if pending > 0 {
            self.discarded_uploads = pending;
            warn!(
                pending,
                waited_ms = waited.as_millis() as u64,
                "shutdown_upload_timeout"
            );
        }
        self.send_logout(now, queries);
        self.transition(ShutdownState::WaitingOnLogout);
    }

    fn step_logout(
        &mut self,
        now: Instant,
        queries: &mut impl ShutdownQueries,
        context: &SchedulerContext,
    ) {
        if queries.logout_acknowledged() {
            self.terminate(TerminationReason::LogoutAcknowledged);
            return;
        }
        if context.disconnect_requested() {
            self.terminate(TerminationReason::Disconnected);
            return;
        }
        let sent_at = *self.logout_sent_at.get_or_insert(now);
        if now.saturating_duration_since(sent_at) >= self.logout_timeout {
            warn!(
                timeout_ms = self.logout_timeout.as_millis() as u64,
                "logout_timeout"
            );
            self.terminate(TerminationReason::LogoutTimeout);
        }
    }

    fn send_logout(&mut self, now: Instant, queries: &mut impl ShutdownQueries) {
        if self.logout_sent_at.is_some() {
            return;
        }
        queries.send_logout_request();
        queries.show_progress(100.0, LOGGING_OUT);
        self.logout_sent_at = Some(now);
        info!("logout_request_sent");
    }

    fn terminate(&mut self, reason: TerminationReason) {
        self.termination = Some(reason);
        self.transition(ShutdownState::Terminating);
    }

    fn transition(&mut self, next: ShutdownState) {
        info!(from = ?self.state, to = ?next, "shutdown_state_changed");
        self.state = next;
    }
}
