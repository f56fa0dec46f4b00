use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::clock::{Clock, FrameClock, FrameSample, SystemClock};
use crate::config::{ConfigError, SchedulerConfig};
use crate::context::SchedulerContext;
use crate::intake::{MessageDispatch, MessageIntakePump, MessageSource};
use crate::metrics::{MetricsAccumulator, MetricsHandle};
use crate::shutdown::{ShutdownQueries, ShutdownSequencer, TerminationReason};
use crate::worker::{BackgroundWorkerPool, IdleWindow, PumpReport};


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Init,
    Running,
    ShuttingDown,
    Terminated,
}

/// Foreground collaborators driven once per iteration.
pub trait FrameHost {
    /// Non-blocking OS and input event poll.
    fn poll_input(&mut self);

    fn update(&mut self, frame: &FrameSample);

    fn render_frame(&mut self);

    /// `false` while the window is hidden or unfocused.
    fn window_active(&self) -> bool {
        true
    }

    fn begin_disconnect(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: u64,
    pub termination: Option<TerminationReason>,
    pub discarded_uploads: usize,
    pub abandoned_background_units: u32,
    pub frame_stalls: u64,
}

/// The outer loop: input, update and message intake, render, background pump, then the
/// quit check. Quit requests are only acted on at the end of an iteration.
pub struct FrameScheduler<C: Clock = SystemClock> {
    config: SchedulerConfig,
    clock: C,
    context: Arc<SchedulerContext>,
    frame_clock: FrameClock,
    intake: MessageIntakePump,
    pool: BackgroundWorkerPool,
    sequencer: ShutdownSequencer,
    state: SchedulerState,
    metrics: MetricsAccumulator,
    metrics_handle: MetricsHandle,
    started_at: Option<Instant>,
    disconnect_handled: bool,
    last_pump: Option<PumpReport>,
}

impl<C: Clock> FrameScheduler<C> {
    pub fn new(
        config: SchedulerConfig,
        clock: C,
        context: Arc<SchedulerContext>,
        pool: BackgroundWorkerPool,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let metrics = MetricsAccumulator::new(config.metrics_log_interval(), clock.now());
        Ok(Self {
            frame_clock: FrameClock::new(
                config.min_frame_rate,
                config.max_frame_rate,
                config.initial_fps,
            ),
            intake: MessageIntakePump::from_config(&config),
            sequencer: ShutdownSequencer::from_config(&config),
            config,
            clock,
            context,
            pool,
            state: SchedulerState::Init,
            metrics,
            metrics_handle: MetricsHandle::default(),
            started_at: None,
            disconnect_handled: false,
            last_pump: None,
        })
    }

    pub fn with_metrics_handle(mut self, metrics_handle: MetricsHandle) -> Self {
        self.metrics_handle = metrics_handle;
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn context(&self) -> &Arc<SchedulerContext> {
        &self.context
    }

    pub fn metrics_handle(&self) -> MetricsHandle {
        self.metrics_handle.clone()
    }

    pub fn intake(&self) -> &MessageIntakePump {
        &self.intake
    }

    pub fn pool(&self) -> &BackgroundWorkerPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut BackgroundWorkerPool {
        &mut self.pool
    }

    pub fn sequencer(&self) -> &ShutdownSequencer {
        &self.sequencer
    }

    pub fn frame_clock(&self) -> &FrameClock {
        &self.frame_clock
    }

    pub fn last_pump(&self) -> Option<PumpReport> {
        self.last_pump
    }

    pub fn frame_stalls(&self) -> u64 {
        self.metrics.frame_stalls()
    }

    pub fn start(&mut self) {
        if self.state != SchedulerState::Init {
            return;
        }
        self.started_at = Some(self.clock.now());
        self.state = SchedulerState::Running;
        info!(
            max_messages_per_frame = self.config.max_messages_per_frame,
            message_budget_ms = self.config.message_budget_ms,
            max_idle_time_ms = self.config.max_idle_time_ms,
            run_workers_concurrently = self.config.run_workers_concurrently,
            no_render = self.config.no_render,
            workers = self.pool.len(),
            metrics_log_interval_ms = self.config.metrics_log_interval().as_millis() as u64,
            slow_frame_delay_ms = self.config.simulated_slow_frame_ms,
            "loop_config"
        );
    }

    /// Runs iterations until shutdown completes, then lets background work drain.
    pub fn run<H, S, D, Q>(
        &mut self,
        host: &mut H,
        source: &mut S,
        dispatch: &mut D,
        queries: &mut Q,
    ) -> RunSummary
    where
        H: FrameHost,
        S: MessageSource,
        D: MessageDispatch<S::Message>,
        Q: ShutdownQueries,
    {
        self.start();
        while self.state != SchedulerState::Terminated {
            self.run_iteration(host, source, dispatch, queries);
        }
        self.finish(queries)
    }

    pub fn run_iteration<H, S, D, Q>(
        &mut self,
        host: &mut H,
        source: &mut S,
        dispatch: &mut D,
        queries: &mut Q,
    ) -> SchedulerState
    where
        H: FrameHost,
        S: MessageSource,
        D: MessageDispatch<S::Message>,
        Q: ShutdownQueries,
    {
        match self.state {
            SchedulerState::Init => self.start(),
            SchedulerState::Terminated => return self.state,
            SchedulerState::Running | SchedulerState::ShuttingDown => {}
        }

        let frame_started_at = self.clock.now();
        let frame = self.frame_clock.tick_at(frame_started_at);

        host.poll_input();

        if !self.context.disconnect_requested() {
            host.update(&frame);
            let report = self
                .intake
                .drain(source, dispatch, &self.clock, &self.context);
            self.metrics.record_messages(report.processed);
        }

        if self.context.disconnect_requested() && !self.disconnect_handled {
            self.disconnect_handled = true;
            if self.context.claim_final_snapshot() {
                queries.capture_final_snapshot();
                info!("final_snapshot_captured");
            }
            host.begin_disconnect();
            info!(frame = frame.frame_number, "disconnect_begun");
        }

        if !self.config.no_render {
            host.render_frame();
        }

        let frame_interval = Duration::from_secs_f64(frame.clamped_delta_seconds);
        let pump = self.background_phase(frame_started_at, frame_interval, host.window_active());
        self.last_pump = Some(pump);

        let now = self.clock.now();
        self.record_frame(now, now.saturating_duration_since(frame_started_at), pump);
        self.check_quit_after(now);
        self.end_of_iteration(now, queries);
        self.state
    }

    /// Exit drain and final snapshot, once the loop has terminated.
    pub fn finish(&mut self, queries: &mut impl ShutdownQueries) -> RunSummary {
        let abandoned_background_units = self
            .pool
            .drain_on_exit(self.config.exit_drain_timeout(), &self.clock);
        if self.context.claim_final_snapshot() {
            queries.capture_final_snapshot();
            info!("final_snapshot_captured");
        }

        let summary = RunSummary {
            frames: self.frame_clock.frame_count(),
            termination: self.sequencer.termination_reason(),
            discarded_uploads: self.sequencer.discarded_uploads(),
            abandoned_background_units,
            frame_stalls: self.metrics.frame_stalls(),
        };
        info!(
            frames = summary.frames,
            reason = ?summary.termination,
            discarded_uploads = summary.discarded_uploads,
            abandoned_background_units,
            "shutdown_complete"
        );
        summary
    }

    fn background_phase(
        &mut self,
        frame_started_at: Instant,
        frame_interval: Duration,
        window_active: bool,
    ) -> PumpReport {
        if let Some(yield_time) = self.config.yield_time() {
            self.clock.sleep(yield_time);
        }

        if self.config.no_render || !window_active {
            let background_yield = self.config.background_yield();
            if !background_yield.is_zero() {
                self.pool.pause_render_contending();
                self.clock.sleep(background_yield);
            }
        }

        let slow_frame_delay = self.config.simulated_slow_frame();
        if !slow_frame_delay.is_zero() {
            // Explicit debug perturbation only; this is not a frame cap.
            self.clock.sleep(slow_frame_delay);
        }

        let window = IdleWindow::for_frame(&self.config, frame_interval);
        self.pool.pump_all(frame_started_at, window, &self.clock)
    }

    fn record_frame(&mut self, now: Instant, frame_time: Duration, pump: PumpReport) {
        if frame_time > self.config.frame_stall_threshold() {
            self.metrics.record_stall();
            warn!(
                frame_time_ms = frame_time.as_millis() as u64,
                frame_stalls = self.metrics.frame_stalls(),
                "frame_stall"
            );
        }
        self.metrics.record_frame(frame_time, pump.idle_time);

        if let Some(snapshot) = self.metrics.maybe_snapshot(
            now,
            self.frame_clock.smoothed_fps(),
            self.intake.budget().current_limit_seconds(),
        ) {
            self.metrics_handle.publish(snapshot);
            info!(
                fps = snapshot.fps,
                smoothed_fps = snapshot.smoothed_fps,
                frame_time_ms = snapshot.frame_time_ms,
                messages_per_second = snapshot.messages_per_second,
                idle_time_ms = snapshot.idle_time_ms,
                frame_stalls = snapshot.frame_stalls,
                message_budget_ms = snapshot.message_budget_ms,
                state = ?self.state,
                "loop_metrics"
            );
        }
    }

    fn check_quit_after(&self, now: Instant) {
        let (Some(limit), Some(started_at)) = (self.config.quit_after(), self.started_at) else {
            return;
        };
        if !self.context.quit_requested() && now.saturating_duration_since(started_at) >= limit {
            self.context.request_quit("quit_after_secs");
        }
    }

    fn end_of_iteration(&mut self, now: Instant, queries: &mut impl ShutdownQueries) {
        if self.state == SchedulerState::Running && self.context.observe_quit() {
            self.state = SchedulerState::ShuttingDown;
            self.sequencer.begin();
        }
        if self.state != SchedulerState::ShuttingDown {
            return;
        }
        self.sequencer.step(now, queries, &self.context);
        if self.sequencer.is_terminating() {
            self.state = SchedulerState::Terminated;
        }
    }
}
