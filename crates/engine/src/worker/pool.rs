use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{BackgroundWorker, PauseSignal, WorkerHandle, WorkerId, WorkerKind};
use crate::clock::Clock;
use crate::config::SchedulerConfig;

const IO_THROTTLE_DIVISOR: u32 = 100;
const IO_THROTTLE_MAX_MS: u32 = 100;
const EXIT_DRAIN_POLL: Duration = Duration::from_millis(1);

/// Time window the background pump may occupy after a frame has been rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleWindow {
    pub min_frame_time: Duration,
    pub min_idle_time: Duration,
    pub max_idle_time: Duration,
    /// Workers keep running through the next render instead of being parked.
    pub run_concurrently: bool,
}

impl IdleWindow {
    pub fn new(min_frame_time: Duration, min_idle_time: Duration, max_idle_time: Duration) -> Self {
        Self {
            min_frame_time,
            min_idle_time,
            max_idle_time: max_idle_time.max(min_idle_time),
            run_concurrently: false,
        }
    }

    /// Caps the pump at a share of the last frame interval as well as the configured
    /// maximum. With concurrent workers the pump only nudges them once.
    pub fn for_frame(config: &SchedulerConfig, frame_interval: Duration) -> Self {
        let min_idle_time = config.min_idle_time();
        let max_idle_time = if config.run_workers_concurrently {
            Duration::ZERO
        } else {
            config
                .max_idle_time()
                .min(share_of(frame_interval, config.idle_share_of_frame))
        };
        Self {
            min_frame_time: config.min_frame_time(),
            min_idle_time,
            max_idle_time: max_idle_time.max(min_idle_time),
            run_concurrently: config.run_workers_concurrently,
        }
    }
}

fn share_of(interval: Duration, share: f64) -> Duration {
    if share.is_finite() && share >= 0.0 {
        interval.mul_f64(share)
    } else {
        Duration::ZERO
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    pub passes: u32,
    pub idle_time: Duration,
    pub work_pending: u32,
    pub io_pending: u32,
    pub io_throttle_sleeps: u32,
}

impl PumpReport {
    pub fn work_remaining(&self) -> bool {
        self.work_pending > 0 || self.io_pending > 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub pumps: u64,
    pub passes: u64,
    pub io_throttle_sleeps: u64,
    pub max_idle_exits: u64,
}

struct PoolEntry {
    handle: WorkerHandle,
    worker: Box<dyn BackgroundWorker>,
}

pub struct BackgroundWorkerPool {
    entries: Vec<PoolEntry>,
    units_per_pass: u32,
    io_backlog_high_water: u32,
    stats: PumpStats,
}

impl std::fmt::Debug for BackgroundWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundWorkerPool")
            .field(
                "workers",
                &self.entries.iter().map(|entry| &entry.handle).collect::<Vec<_>>(),
            )
            .field("units_per_pass", &self.units_per_pass)
            .field("io_backlog_high_water", &self.io_backlog_high_water)
            .field("stats", &self.stats)
            .finish()
    }
}

impl BackgroundWorkerPool {
    pub fn new(units_per_pass: u32, io_backlog_high_water: u32) -> Self {
        Self {
            entries: Vec::new(),
            units_per_pass: units_per_pass.max(1),
            io_backlog_high_water,
            stats: PumpStats::default(),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.worker_units_per_pass, config.io_backlog_high_water)
    }

    /// Adds a worker. `build` receives the read side of the pause flag the pool will drive.
    pub fn register<W, F>(&mut self, kind: WorkerKind, name: &'static str, build: F) -> WorkerId
    where
        W: BackgroundWorker + 'static,
        F: FnOnce(PauseSignal) -> W,
    {
        match self.try_register(kind, name, |signal| {
            Ok::<_, std::convert::Infallible>(build(signal))
        }) {
            Ok(id) => id,
            Err(never) => match never {},
        }
    }

    pub fn try_register<W, E, F>(
        &mut self,
        kind: WorkerKind,
        name: &'static str,
        build: F,
    ) -> Result<WorkerId, E>
    where
        W: BackgroundWorker + 'static,
        F: FnOnce(PauseSignal) -> Result<W, E>,
    {
        let id = WorkerId(self.entries.len() as u32);
        let handle = WorkerHandle::new(id, kind, name);
        let worker = build(handle.flag().signal())?;
        debug!(worker = name, id = %id, kind = ?kind, "worker_registered");
        self.entries.push(PoolEntry {
            handle,
            worker: Box::new(worker),
        });
        Ok(id)
    }

    pub fn handles(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.entries.iter().map(|entry| &entry.handle)
    }

    pub fn is_paused(&self, id: WorkerId) -> Option<bool> {
        self.entries
            .iter()
            .find(|entry| entry.handle.id() == id)
            .map(|entry| entry.handle.is_paused())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> PumpStats {
        self.stats
    }

    pub fn resume_all(&mut self) {
        for entry in &mut self.entries {
            if entry.handle.is_paused() {
                entry.handle.flag().set(false);
                entry.worker.resume();
            }
        }
    }

    pub fn pause_render_contending(&mut self) {
        for entry in &mut self.entries {
            if entry.handle.kind().contends_with_render() && !entry.handle.is_paused() {
                entry.handle.flag().set(true);
                entry.worker.pause();
            }
        }
    }

    /// Advances every worker until the idle window closes.
    ///
    /// Exits once `frame_time >= min_frame_time`, `idle_time >= min_idle_time`, and
    /// either nothing is pending or `idle_time >= max_idle_time`. While nothing is
    /// pending but the minimums are not met yet, the remaining time is slept instead
    /// of spun.
    pub fn pump_all(
        &mut self,
        frame_started_at: Instant,
        window: IdleWindow,
        clock: &impl Clock,
    ) -> PumpReport {
        let pump_started_at = clock.now();
        self.resume_all();

        let mut passes = 0u32;
        let mut io_throttle_sleeps = 0u32;
        let (work_pending, io_pending, hit_max_idle) = loop {
            let (work_pending, io_pending) = self.run_pass();
            passes = passes.saturating_add(1);

            if io_pending > self.io_backlog_high_water {
                let sleep_ms = (io_pending / IO_THROTTLE_DIVISOR).min(IO_THROTTLE_MAX_MS);
                debug!(io_pending, sleep_ms, "io_backlog_throttle");
                clock.sleep(Duration::from_millis(u64::from(sleep_ms)));
                io_throttle_sleeps = io_throttle_sleeps.saturating_add(1);
            }

            let now = clock.now();
            let frame_time = now.saturating_duration_since(frame_started_at);
            let idle_time = now.saturating_duration_since(pump_started_at);
            let pending = work_pending > 0 || io_pending > 0;
            let minimums_met =
                frame_time >= window.min_frame_time && idle_time >= window.min_idle_time;

            if minimums_met && (!pending || idle_time >= window.max_idle_time) {
                break (work_pending, io_pending, pending);
            }
            if !pending {
                let wait = window
                    .min_frame_time
                    .saturating_sub(frame_time)
                    .max(window.min_idle_time.saturating_sub(idle_time));
                clock.sleep(wait);
            }
        };

        if !window.run_concurrently {
            self.pause_render_contending();
        }

        self.stats.pumps = self.stats.pumps.saturating_add(1);
        self.stats.passes = self.stats.passes.saturating_add(u64::from(passes));
        self.stats.io_throttle_sleeps = self
            .stats
            .io_throttle_sleeps
            .saturating_add(u64::from(io_throttle_sleeps));
        if hit_max_idle {
            self.stats.max_idle_exits = self.stats.max_idle_exits.saturating_add(1);
        }

        PumpReport {
            passes,
            idle_time: clock.now().saturating_duration_since(pump_started_at),
            work_pending,
            io_pending,
            io_throttle_sleeps,
        }
    }

    /// Lets workers finish outstanding work after the loop has ended. Returns the
    /// number of units abandoned when `timeout` expires first.
    pub fn drain_on_exit(&mut self, timeout: Duration, clock: &impl Clock) -> u32 {
        let started_at = clock.now();
        self.resume_all();
        loop {
            let (work_pending, io_pending) = self.run_pass();
            let pending = work_pending.saturating_add(io_pending);
            if pending == 0 {
                return 0;
            }
            if clock.now().saturating_duration_since(started_at) >= timeout {
                warn!(pending, "quitting_with_pending_background_tasks");
                return pending;
            }
            clock.sleep(EXIT_DRAIN_POLL);
        }
    }

    fn run_pass(&mut self) -> (u32, u32) {
        let mut work_pending = 0u32;
        let mut io_pending = 0u32;
        for entry in &mut self.entries {
            let pending = entry.worker.do_work(self.units_per_pass);
            if entry.handle.kind().is_file_io() {
                io_pending = io_pending.saturating_add(pending);
            } else {
                work_pending = work_pending.saturating_add(pending);
            }
        }
        (work_pending, io_pending)
    }
}
