use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::warn;

static METRICS_LOCK_POISON_WARNED: AtomicBool = AtomicBool::new(false);

fn warn_metrics_lock_poison_once(operation: &'static str) {
    if METRICS_LOCK_POISON_WARNED
        .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
    {
        warn!(operation, "metrics lock poisoned; recovered inner value");
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoopMetricsSnapshot {
    pub fps: f32,
    pub smoothed_fps: f32,
    pub frame_time_ms: f32,
    pub messages_per_second: f32,
    pub idle_time_ms: f32,
    pub frame_stalls: u64,
    pub message_budget_ms: f32,
}

/// Latest published loop metrics, readable from any thread.
#[derive(Clone, Debug)]
pub struct MetricsHandle {
    snapshot: Arc<RwLock<LoopMetricsSnapshot>>,
}

impl Default for MetricsHandle {
    fn default() -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(LoopMetricsSnapshot::default())),
        }
    }
}

impl MetricsHandle {
    pub fn snapshot(&self) -> LoopMetricsSnapshot {
        match self.snapshot.read() {
            Ok(guard) => *guard,
            Err(poisoned) => {
                warn_metrics_lock_poison_once("read");
                *poisoned.into_inner()
            }
        }
    }

    pub(crate) fn publish(&self, snapshot: LoopMetricsSnapshot) {
        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => {
                warn_metrics_lock_poison_once("write");
                let mut guard = poisoned.into_inner();
                *guard = snapshot;
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct MetricsAccumulator {
    interval_start: Instant,
    interval: Duration,
    frames: u32,
    messages: u64,
    frame_time_sum: Duration,
    idle_time_sum: Duration,
    frame_stalls: u64,
}

impl MetricsAccumulator {
    pub(crate) fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval_start: now,
            interval,
            frames: 0,
            messages: 0,
            frame_time_sum: Duration::ZERO,
            idle_time_sum: Duration::ZERO,
            frame_stalls: 0,
        }
    }

    pub(crate) fn record_frame(&mut self, frame_time: Duration, idle_time: Duration) {
        self.frames = self.frames.saturating_add(1);
        self.frame_time_sum = self.frame_time_sum.saturating_add(frame_time);
        self.idle_time_sum = self.idle_time_sum.saturating_add(idle_time);
    }

    pub(crate) fn record_messages(&mut self, processed: u32) {
        self.messages = self.messages.saturating_add(u64::from(processed));
    }

    /// Stalls are cumulative over the whole run, not per interval.
    pub(crate) fn record_stall(&mut self) {
        self.frame_stalls = self.frame_stalls.saturating_add(1);
    }

    pub(crate) fn frame_stalls(&self) -> u64 {
        self.frame_stalls
    }

    pub(crate) fn maybe_snapshot(
        &mut self,
        now: Instant,
        smoothed_fps: f64,
        message_budget_seconds: f64,
    ) -> Option<LoopMetricsSnapshot> {
        let elapsed = now.saturating_duration_since(self.interval_start);
        if elapsed < self.interval {
            return None;
        }

        let elapsed_seconds = elapsed.as_secs_f32().max(f32::EPSILON);
        let (frame_time_ms, idle_time_ms) = if self.frames == 0 {
            (0.0, 0.0)
        } else {
            let frames = self.frames as f32;
            (
                (self.frame_time_sum.as_secs_f32() / frames) * 1000.0,
                (self.idle_time_sum.as_secs_f32() / frames) * 1000.0,
            )
        };

        let snapshot = LoopMetricsSnapshot {
            fps: self.frames as f32 / elapsed_seconds,
            smoothed_fps: smoothed_fps as f32,
            frame_time_ms,
            messages_per_second: self.messages as f32 / elapsed_seconds,
            idle_time_ms,
            frame_stalls: self.frame_stalls,
            message_budget_ms: (message_budget_seconds * 1000.0) as f32,
        };

        self.interval_start = now;
        self.frames = 0;
        self.messages = 0;
        self.frame_time_sum = Duration::ZERO;
        self.idle_time_sum = Duration::ZERO;

        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::RwLock;
    use std::thread;

    use super::*;

    fn poison_lock(lock: &RwLock<LoopMetricsSnapshot>) {
        thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = lock.write().expect("write guard");
                    panic!("poison metrics lock");
                })
                .join();
        });
    }

    #[test]
    fn snapshot_computes_expected_values() {
        let base = Instant::now();
        let mut accumulator = MetricsAccumulator::new(Duration::from_secs(1), base);

        accumulator.record_frame(Duration::from_millis(16), Duration::from_millis(2));
        accumulator.record_frame(Duration::from_millis(16), Duration::from_millis(4));
        accumulator.record_messages(150);
        accumulator.record_messages(50);
        accumulator.record_stall();

        let snapshot = accumulator
            .maybe_snapshot(base + Duration::from_secs(1), 58.0, 0.020)
            .expect("snapshot should be emitted");

        assert!((snapshot.fps - 2.0).abs() < 0.05);
        assert!((snapshot.frame_time_ms - 16.0).abs() < 0.001);
        assert!((snapshot.idle_time_ms - 3.0).abs() < 0.001);
        assert!((snapshot.messages_per_second - 200.0).abs() < 0.5);
        assert!((snapshot.message_budget_ms - 20.0).abs() < 0.001);
        assert_eq!(snapshot.smoothed_fps, 58.0);
        assert_eq!(snapshot.frame_stalls, 1);
    }

    #[test]
    fn snapshot_not_emitted_before_interval() {
        let base = Instant::now();
        let mut accumulator = MetricsAccumulator::new(Duration::from_secs(1), base);
        accumulator.record_frame(Duration::from_millis(16), Duration::ZERO);

        assert!(accumulator
            .maybe_snapshot(base + Duration::from_millis(500), 10.0, 0.020)
            .is_none());
    }

    #[test]
    fn stall_count_survives_interval_reset() {
        let base = Instant::now();
        let mut accumulator = MetricsAccumulator::new(Duration::from_secs(1), base);
        accumulator.record_stall();
        accumulator.maybe_snapshot(base + Duration::from_secs(1), 10.0, 0.020);

        let snapshot = accumulator
            .maybe_snapshot(base + Duration::from_secs(2), 10.0, 0.020)
            .expect("snapshot");
        assert_eq!(snapshot.frame_stalls, 1);
        assert_eq!(snapshot.fps, 0.0);
    }

    #[test]
    fn snapshot_recovers_after_poison_without_panic() {
        let handle = MetricsHandle::default();
        poison_lock(handle.snapshot.as_ref());

        assert_eq!(handle.snapshot(), LoopMetricsSnapshot::default());
    }

    #[test]
    fn publish_recovers_after_poison_without_panic() {
        let handle = MetricsHandle::default();
        poison_lock(handle.snapshot.as_ref());

        let expected = LoopMetricsSnapshot {
            fps: 15.0,
            smoothed_fps: 14.5,
            frame_time_ms: 11.0,
            messages_per_second: 300.0,
            idle_time_ms: 1.5,
            frame_stalls: 2,
            message_budget_ms: 20.7,
        };
        handle.publish(expected);

        assert_eq!(handle.snapshot(), expected);
    }
}
