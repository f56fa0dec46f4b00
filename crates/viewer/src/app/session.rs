use std::cell::RefCell;
use std::collections::HashSet;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{info, warn};
use viewer_core::{
    DispatchError, DispatchTable, MetricsHandle, SchedulerContext, ShutdownQueries, TaggedMessage,
};

use super::circuit::{CircuitLink, Message};
use super::control_port::ControlCommand;
use super::marker::{self, FinalSnapshot};
use super::workers::{ChatLogJob, FetchJob, WorkerJobs};

pub(crate) type SharedSession = Rc<RefCell<SessionState>>;

/// Everything the main thread knows about the logged-in session.
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) session_id: u64,
    objects: HashSet<u32>,
    pub(crate) object_updates: u64,
    pub(crate) chat_lines: u64,
    pub(crate) textures_requested: u64,
    pub(crate) pending_uploads: usize,
    pub(crate) uploads_completed: u64,
    upload_credit: f64,
    pub(crate) open_modals: usize,
    pub(crate) blocking_floaters: usize,
    pub(crate) window_active: bool,
    pub(crate) logout_acknowledged: bool,
    pub(crate) last_progress: Option<(f32, String)>,
    /// Control-port replies waiting for the next flush.
    pub(crate) replies: Vec<String>,
}

impl SessionState {
    pub(crate) fn new(session_id: u64, pending_uploads: usize) -> Self {
        Self {
            session_id,
            objects: HashSet::new(),
            object_updates: 0,
            chat_lines: 0,
            textures_requested: 0,
            pending_uploads,
            uploads_completed: 0,
            upload_credit: 0.0,
            open_modals: 0,
            blocking_floaters: 0,
            window_active: true,
            logout_acknowledged: false,
            last_progress: None,
            replies: Vec::new(),
        }
    }

    pub(crate) fn shared(self) -> SharedSession {
        Rc::new(RefCell::new(self))
    }

    pub(crate) fn objects_seen(&self) -> usize {
        self.objects.len()
    }

    /// Completes uploads at `per_second`, carrying fractional progress between frames.
    pub(crate) fn advance_uploads(&mut self, per_second: f64, delta_seconds: f64) {
        if self.pending_uploads == 0 {
            self.upload_credit = 0.0;
            return;
        }
        self.upload_credit += per_second * delta_seconds;
        let finished = (self.upload_credit.floor() as usize).min(self.pending_uploads);
        self.pending_uploads -= finished;
        self.uploads_completed += finished as u64;
        self.upload_credit -= finished as f64;
    }

    /// Applies a command that only touches local window state and returns its reply.
    /// Anything else gives `None` and has to go through message intake.
    pub(crate) fn apply_window_command(&mut self, command: ControlCommand) -> Option<String> {
        let reply = match command {
            ControlCommand::DialogOpen | ControlCommand::DialogClose => {
                self.open_modals =
                    adjust_count(self.open_modals, command == ControlCommand::DialogOpen);
                format!("ok: modal dialogs:{}", self.open_modals)
            }
            ControlCommand::FloaterOpen | ControlCommand::FloaterClose => {
                self.blocking_floaters =
                    adjust_count(self.blocking_floaters, command == ControlCommand::FloaterOpen);
                format!("ok: blocking floaters:{}", self.blocking_floaters)
            }
            ControlCommand::Blur => {
                self.window_active = false;
                "ok: window inactive".to_string()
            }
            ControlCommand::Focus => {
                self.window_active = true;
                "ok: window active".to_string()
            }
            _ => return None,
        };
        Some(reply)
    }

    pub(crate) fn take_replies(&mut self) -> Vec<String> {
        std::mem::take(&mut self.replies)
    }

    fn snapshot(&self, disconnected: bool) -> FinalSnapshot {
        FinalSnapshot {
            session_id: self.session_id,
            objects_seen: self.objects.len() as u64,
            chat_lines: self.chat_lines,
            textures_requested: self.textures_requested,
            uploads_completed: self.uploads_completed,
            uploads_pending: self.pending_uploads,
            disconnected,
        }
    }
}

fn wrong_variant(message: &Message) -> DispatchError {
    DispatchError::Handler {
        tag: message.tag().to_string(),
        reason: "message routed to a handler for another template".to_string(),
    }
}

/// Builds the per-template handler table for the session.
pub(crate) fn build_dispatch(
    session: &SharedSession,
    context: &Arc<SchedulerContext>,
    jobs: &WorkerJobs,
    metrics: MetricsHandle,
) -> DispatchTable<Message> {
    let mut table = DispatchTable::new();

    let state = Rc::clone(session);
    table.register("ObjectUpdate", move |message: &Message| {
        let Message::ObjectUpdate { local_id } = message else {
            return Err(wrong_variant(message));
        };
        let mut state = state.borrow_mut();
        state.object_updates += 1;
        state.objects.insert(*local_id);
        Ok(())
    });

    let state = Rc::clone(session);
    let fetch = jobs.fetch.clone();
    table.register("ImageData", move |message: &Message| {
        let Message::ImageData {
            texture_id,
            codec_bytes,
        } = message
        else {
            return Err(wrong_variant(message));
        };
        if *codec_bytes == 0 {
            return Err(DispatchError::Malformed {
                tag: message.tag().to_string(),
                reason: format!("texture {texture_id} has an empty payload"),
            });
        }
        state.borrow_mut().textures_requested += 1;
        fetch.submit(FetchJob {
            texture_id: *texture_id,
            codec_bytes: *codec_bytes,
        });
        Ok(())
    });

    let state = Rc::clone(session);
    let chat_log = jobs.chat_log.clone();
    table.register("ChatFromSimulator", move |message: &Message| {
        let Message::ChatFromSimulator { from, text } = message else {
            return Err(wrong_variant(message));
        };
        state.borrow_mut().chat_lines += 1;
        chat_log.submit(ChatLogJob {
            line: format!("{from}: {text}"),
        });
        Ok(())
    });

    let state = Rc::clone(session);
    table.register("LogoutReply", move |_message: &Message| {
        state.borrow_mut().logout_acknowledged = true;
        info!("logout_reply_received");
        Ok(())
    });

    let kicked = Arc::clone(context);
    table.register("KickUser", move |message: &Message| {
        let Message::KickUser { reason } = message else {
            return Err(wrong_variant(message));
        };
        warn!(reason = %reason, "kicked_by_region");
        kicked.request_disconnect("kicked");
        kicked.request_quit("kicked");
        Ok(())
    });

    let state = Rc::clone(session);
    let control_context = Arc::clone(context);
    table.register("ViewerControl", move |message: &Message| {
        let Message::ViewerControl(command) = message else {
            return Err(wrong_variant(message));
        };
        let reply = apply_control(*command, &state, &control_context, &metrics);
        state.borrow_mut().replies.push(reply);
        Ok(())
    });

    table
}

fn apply_control(
    command: ControlCommand,
    session: &SharedSession,
    context: &SchedulerContext,
    metrics: &MetricsHandle,
) -> String {
    match command {
        ControlCommand::Quit => {
            context.request_quit("control_port");
            "ok: quit requested".to_string()
        }
        ControlCommand::AbortQuit => {
            if context.abort_quit() {
                "ok: quit aborted".to_string()
            } else if context.shutdown_started() {
                "error: shutdown already started".to_string()
            } else {
                "ok: no quit pending".to_string()
            }
        }
        ControlCommand::Disconnect => {
            context.request_disconnect("control_port");
            context.request_quit("control_port");
            "ok: disconnecting".to_string()
        }
        ControlCommand::Status => status_line(&session.borrow(), context, metrics),
        ControlCommand::Sync => "ok: sync".to_string(),
        ControlCommand::Upload(count) => {
            let mut state = session.borrow_mut();
            state.pending_uploads = state.pending_uploads.saturating_add(count as usize);
            format!("ok: uploads pending:{}", state.pending_uploads)
        }
        window => session
            .borrow_mut()
            .apply_window_command(window)
            .unwrap_or_else(|| format!("error: unhandled command {window:?}")),
    }
}

fn adjust_count(count: usize, open: bool) -> usize {
    if open {
        count.saturating_add(1)
    } else {
        count.saturating_sub(1)
    }
}

fn status_line(
    state: &SessionState,
    context: &SchedulerContext,
    metrics: &MetricsHandle,
) -> String {
    let loop_metrics = metrics.snapshot();
    let mut line = format!(
        "ok: status session:{} objects:{} chat:{} textures:{} uploads_pending:{} \
quit_requested:{} shutting_down:{} fps:{:.1}",
        state.session_id,
        state.objects.len(),
        state.chat_lines,
        state.textures_requested,
        state.pending_uploads,
        u8::from(context.quit_requested()),
        u8::from(context.shutdown_started()),
        loop_metrics.smoothed_fps,
    );
    if let Some((percent, message)) = &state.last_progress {
        line.push_str(&format!(" progress:{percent:.0}% ({message})"));
    }
    line
}

/// Session-side answers to the shutdown sequencer's questions.
pub(crate) struct SessionQueries {
    session: SharedSession,
    circuit: CircuitLink,
    context: Arc<SchedulerContext>,
    logout_marker: PathBuf,
    final_snapshot: PathBuf,
}

impl SessionQueries {
    pub(crate) fn new(
        session: SharedSession,
        circuit: CircuitLink,
        context: Arc<SchedulerContext>,
        logout_marker: PathBuf,
        final_snapshot: PathBuf,
    ) -> Self {
        Self {
            session,
            circuit,
            context,
            logout_marker,
            final_snapshot,
        }
    }
}

impl ShutdownQueries for SessionQueries {
    fn open_modal_count(&self) -> usize {
        self.session.borrow().open_modals
    }

    fn open_floater_blocking_count(&self) -> usize {
        self.session.borrow().blocking_floaters
    }

    fn pending_upload_count(&self) -> usize {
        self.session.borrow().pending_uploads
    }

    fn send_logout_request(&mut self) {
        let session_id = self.session.borrow().session_id;
        if let Err(err) = marker::write_logout_marker(&self.logout_marker, session_id) {
            warn!(
                error = %err,
                path = %self.logout_marker.display(),
                "logout_marker_write_failed"
            );
        }
        self.circuit.request_logout();
    }

    fn logout_acknowledged(&self) -> bool {
        self.session.borrow().logout_acknowledged
    }

    fn capture_final_snapshot(&mut self) {
        let snapshot = self
            .session
            .borrow()
            .snapshot(self.context.disconnect_requested());
        match marker::write_final_snapshot(&self.final_snapshot, &snapshot) {
            Ok(()) => info!(path = %self.final_snapshot.display(), "final_snapshot_written"),
            Err(err) => warn!(
                error = %err,
                path = %self.final_snapshot.display(),
                "final_snapshot_write_failed"
            ),
        }
    }

    fn show_progress(&mut self, percent: f32, message: &str) {
        info!(percent, message, "shutdown_progress");
        self.session.borrow_mut().last_progress = Some((percent, message.to_string()));
    }
}
