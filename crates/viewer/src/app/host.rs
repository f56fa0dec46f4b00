use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};
use viewer_core::{FrameHost, FrameSample};

use super::circuit::{CircuitLink, Message};
use super::control_port::{ControlCommand, ControlPort};
use super::session::SharedSession;

/// Foreground side of the headless viewer: control-port input, upload progress and a
/// stand-in for the render pass.
pub(crate) struct ViewerHost {
    session: SharedSession,
    control: ControlPort,
    inbound: Sender<Message>,
    circuit: CircuitLink,
    render_cost: Duration,
    uploads_per_second: f64,
    frames_rendered: u64,
    line_scratch: Vec<String>,
}

impl ViewerHost {
    pub(crate) fn new(
        session: SharedSession,
        control: ControlPort,
        inbound: Sender<Message>,
        circuit: CircuitLink,
        render_cost: Duration,
        uploads_per_second: f64,
    ) -> Self {
        Self {
            session,
            control,
            inbound,
            circuit,
            render_cost,
            uploads_per_second,
            frames_rendered: 0,
            line_scratch: Vec::new(),
        }
    }

    pub(crate) fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    /// Window-local commands apply at once, even after the circuit is gone and intake
    /// has stopped. Everything else is queued as an inbound message.
    fn handle_command(&mut self, command: ControlCommand) {
        let local_reply = self.session.borrow_mut().apply_window_command(command);
        if let Some(reply) = local_reply {
            debug!(command = ?command, "window_command_applied");
            self.session.borrow_mut().replies.push(reply);
            return;
        }
        debug!(command = ?command, "control_command_queued");
        if self.inbound.send(Message::ViewerControl(command)).is_err() {
            warn!(command = ?command, "control_command_dropped_queue_closed");
        }
    }

    /// Sends replies produced by control commands handled since the last flush.
    pub(crate) fn flush_replies(&mut self) {
        let replies = self.session.borrow_mut().take_replies();
        if !replies.is_empty() {
            self.control.send_lines(&replies);
        }
    }
}

impl FrameHost for ViewerHost {
    fn poll_input(&mut self) {
        self.flush_replies();

        let mut lines = std::mem::take(&mut self.line_scratch);
        self.control.poll_lines(&mut lines);
        for line in lines.drain(..) {
            match ControlCommand::parse(&line) {
                Ok(command) => self.handle_command(command),
                Err(reason) => {
                    self.control.send_lines(&[format!("error: {reason}")]);
                }
            }
        }
        self.line_scratch = lines;
    }

    fn update(&mut self, frame: &FrameSample) {
        self.session
            .borrow_mut()
            .advance_uploads(self.uploads_per_second, frame.clamped_delta_seconds);
    }

    fn render_frame(&mut self) {
        if !self.render_cost.is_zero() {
            thread::sleep(self.render_cost);
        }
        self.frames_rendered += 1;
    }

    fn window_active(&self) -> bool {
        self.session.borrow().window_active
    }

    fn begin_disconnect(&mut self) {
        self.circuit.close();
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;
    use std::sync::mpsc;
    use std::sync::Arc;

    use tempfile::TempDir;
    use viewer_core::{
        BackgroundWorkerPool, FrameScheduler, JobSubmitter, ManualClock, MetricsHandle,
        SchedulerConfig, SchedulerContext, SchedulerState, ShutdownState, TerminationReason,
    };

    use super::*;
    use crate::app::session::{build_dispatch, SessionQueries, SessionState};
    use crate::app::workers::{PipelineCounters, WorkerJobs};

    fn host_with(session: &SharedSession) -> (ViewerHost, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel();
        let host = ViewerHost::new(
            Rc::clone(session),
            ControlPort::disabled(),
            sender,
            CircuitLink::detached(),
            Duration::ZERO,
            2.0,
        );
        (host, receiver)
    }

    #[test]
    fn update_advances_uploads_by_the_clamped_delta() {
        let session = SessionState::new(1, 3).shared();
        let (mut host, _receiver) = host_with(&session);
        let frame = FrameSample {
            frame_number: 1,
            raw_delta_seconds: 5.0,
            clamped_delta_seconds: 1.0,
            smoothed_fps: 1.0,
        };

        host.update(&frame);

        assert_eq!(session.borrow().pending_uploads, 1);
        assert_eq!(session.borrow().uploads_completed, 2);
    }

    #[test]
    fn window_activity_follows_the_session() {
        let session = SessionState::new(1, 0).shared();
        let (host, _receiver) = host_with(&session);
        assert!(host.window_active());

        session.borrow_mut().window_active = false;
        assert!(!host.window_active());
    }

    #[test]
    fn render_counts_frames_and_flush_drains_replies() {
        let session = SessionState::new(1, 0).shared();
        let (mut host, _receiver) = host_with(&session);
        session.borrow_mut().replies.push("ok: sync".to_string());

        host.render_frame();
        host.poll_input();

        assert_eq!(host.frames_rendered(), 1);
        assert!(session.borrow().replies.is_empty());
    }

    #[test]
    fn window_commands_apply_without_going_through_intake() {
        let session = SessionState::new(1, 0).shared();
        let (mut host, receiver) = host_with(&session);

        host.handle_command(ControlCommand::DialogOpen);
        host.handle_command(ControlCommand::Blur);
        host.handle_command(ControlCommand::Sync);

        assert_eq!(session.borrow().open_modals, 1);
        assert!(!session.borrow().window_active);
        assert_eq!(
            session.borrow().replies,
            vec!["ok: modal dialogs:1", "ok: window inactive"]
        );
        assert_eq!(
            receiver.try_iter().collect::<Vec<_>>(),
            vec![Message::ViewerControl(ControlCommand::Sync)]
        );
    }

    #[test]
    fn kick_with_an_open_dialog_still_shuts_down_once_it_closes() {
        let dir = TempDir::new().expect("temp dir");
        let session = SessionState::new(7, 0).shared();
        let context = SchedulerContext::new();
        let jobs = WorkerJobs {
            fetch: JobSubmitter::new(),
            chat_log: JobSubmitter::new(),
            counters: Arc::new(PipelineCounters::default()),
        };
        let mut dispatch = build_dispatch(&session, &context, &jobs, MetricsHandle::default());
        let mut queries = SessionQueries::new(
            Rc::clone(&session),
            CircuitLink::detached(),
            Arc::clone(&context),
            dir.path().join("logout.marker"),
            dir.path().join("final_snapshot.json"),
        );
        let (mut host, mut inbound) = host_with(&session);
        let config = SchedulerConfig::default();
        let pool = BackgroundWorkerPool::from_config(&config);
        let mut scheduler =
            FrameScheduler::new(config, ManualClock::new(), Arc::clone(&context), pool)
                .expect("valid config");

        host.handle_command(ControlCommand::DialogOpen);
        host.handle_command(ControlCommand::FloaterOpen);
        host.inbound
            .send(Message::KickUser {
                reason: "region restart".to_string(),
            })
            .expect("queue open");
        for _ in 0..200 {
            scheduler.run_iteration(&mut host, &mut inbound, &mut dispatch, &mut queries);
        }
        assert_eq!(scheduler.state(), SchedulerState::ShuttingDown);
        assert_eq!(scheduler.sequencer().state(), ShutdownState::WaitingOnDialogs);

        host.handle_command(ControlCommand::DialogClose);
        let mut iterations = 0;
        while scheduler.run_iteration(&mut host, &mut inbound, &mut dispatch, &mut queries)
            != SchedulerState::Terminated
        {
            iterations += 1;
            assert!(iterations < 100, "shutdown never finished");
        }

        assert_eq!(
            scheduler.sequencer().termination_reason(),
            Some(TerminationReason::Disconnected)
        );
        assert!(dir.path().join("final_snapshot.json").exists());
        assert!(!dir.path().join("logout.marker").exists());
    }
}
