use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_MIN_FRAME_RATE: f64 = 1.0;
pub const DEFAULT_MAX_FRAME_RATE: f64 = 200.0;
/// Rate assumed for the very first frame, before any delta has been measured.
pub const DEFAULT_INITIAL_FPS: f64 = 10.0;

const SMOOTHING_PREVIOUS_WEIGHT: f64 = 4.0;

/// Source of time for every bounded loop in the core.
///
/// Components never call `Instant::now` or `thread::sleep` directly; they go through a
/// `Clock` so the idle window and shutdown deadlines can be driven deterministically.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

/// Clock whose time only moves when `advance` or `sleep` is called.
///
/// Clones share the same timeline, so a test worker can hold one copy and charge the
/// cost of each unit of work to the clock the pool is reading.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    offset_nanos: Arc<AtomicU64>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset_nanos: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.offset_nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Timing for one outer-loop iteration. Produced by [`FrameClock::tick`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSample {
    pub frame_number: u64,
    pub raw_delta_seconds: f64,
    pub clamped_delta_seconds: f64,
    pub smoothed_fps: f64,
}

impl FrameSample {
    pub fn clamped_fps(&self) -> f64 {
        1.0 / self.clamped_delta_seconds
    }
}

#[derive(Debug, Clone)]
pub struct FrameClock {
    min_frame_rate: f64,
    max_frame_rate: f64,
    initial_fps: f64,
    last_tick: Option<Instant>,
    smoothed_fps: f64,
    frame_count: u64,
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new(
            DEFAULT_MIN_FRAME_RATE,
            DEFAULT_MAX_FRAME_RATE,
            DEFAULT_INITIAL_FPS,
        )
    }
}

impl FrameClock {
    pub fn new(min_frame_rate: f64, max_frame_rate: f64, initial_fps: f64) -> Self {
        let min_frame_rate = positive_or(min_frame_rate, DEFAULT_MIN_FRAME_RATE);
        let max_frame_rate = positive_or(max_frame_rate, DEFAULT_MAX_FRAME_RATE).max(min_frame_rate);
        let initial_fps = positive_or(initial_fps, DEFAULT_INITIAL_FPS)
            .clamp(min_frame_rate, max_frame_rate);
        Self {
            min_frame_rate,
            max_frame_rate,
            initial_fps,
            last_tick: None,
            smoothed_fps: initial_fps,
            frame_count: 0,
        }
    }

    pub fn tick(&mut self, clock: &impl Clock) -> FrameSample {
        self.tick_at(clock.now())
    }

    pub fn tick_at(&mut self, now: Instant) -> FrameSample {
        let raw_delta_seconds = match self.last_tick {
            Some(previous) => now.saturating_duration_since(previous).as_secs_f64(),
            None => 1.0 / self.initial_fps,
        };
        self.last_tick = Some(now);

        let frame_rate = clamp_frame_rate(raw_delta_seconds, self.min_frame_rate, self.max_frame_rate);
        self.smoothed_fps =
            (frame_rate + SMOOTHING_PREVIOUS_WEIGHT * self.smoothed_fps) / (SMOOTHING_PREVIOUS_WEIGHT + 1.0);
        self.frame_count = self.frame_count.saturating_add(1);

        FrameSample {
            frame_number: self.frame_count,
            raw_delta_seconds,
            clamped_delta_seconds: 1.0 / frame_rate,
            smoothed_fps: self.smoothed_fps,
        }
    }

    pub fn smoothed_fps(&self) -> f64 {
        self.smoothed_fps
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

/// Clamps the rate derived from `raw_delta_seconds`, not the delta itself.
/// A zero or negative delta counts as an infinitely fast frame.
fn clamp_frame_rate(raw_delta_seconds: f64, min_frame_rate: f64, max_frame_rate: f64) -> f64 {
    if raw_delta_seconds.is_nan() || raw_delta_seconds <= 0.0 {
        return max_frame_rate;
    }
    (1.0 / raw_delta_seconds).clamp(min_frame_rate, max_frame_rate)
}

fn positive_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        fallback
    }
}
