mod dispatch;

use std::collections::VecDeque;
use std::sync::mpsc::Receiver;

use tracing::{debug, info};

use crate::budget::AdaptiveBudget;
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::context::SchedulerContext;

pub use dispatch::{DispatchError, DispatchStats, DispatchTable, TaggedMessage};

/// Inbound transport queue, drained one message at a time in arrival order.
pub trait MessageSource {
    type Message;

    fn next_message(&mut self) -> Option<Self::Message>;
}

impl<M> MessageSource for VecDeque<M> {
    type Message = M;

    fn next_message(&mut self) -> Option<M> {
        self.pop_front()
    }
}

impl<M> MessageSource for Receiver<M> {
    type Message = M;

    fn next_message(&mut self) -> Option<M> {
        self.try_recv().ok()
    }
}

/// Handler side of the pump. Implementations trap their own per-message failures;
/// a bad message is consumed like any other.
pub trait MessageDispatch<M> {
    fn dispatch(&mut self, message: M);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainExit {
    QueueEmpty,
    MessageCap,
    TimeBudget,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: u32,
    pub exit: DrainExit,
}

impl DrainReport {
    pub fn capped_by_time(&self) -> bool {
        self.exit == DrainExit::TimeBudget
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeStats {
    pub passes: u64,
    pub messages: u64,
    pub cap_hits: u64,
    pub time_caps: u64,
}

#[derive(Debug, Clone)]
pub struct MessageIntakePump {
    budget: AdaptiveBudget,
    max_messages_per_frame: u32,
    stats: IntakeStats,
}

impl MessageIntakePump {
    pub fn new(budget: AdaptiveBudget, max_messages_per_frame: u32) -> Self {
        Self {
            budget,
            max_messages_per_frame: max_messages_per_frame.max(1),
            stats: IntakeStats::default(),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            AdaptiveBudget::new(config.message_budget_seconds(), config.message_budget_growth),
            config.max_messages_per_frame,
        )
    }

    /// Dispatches queued messages until the queue empties, the per-frame cap is hit, the
    /// time budget runs out, or a handler asks for a disconnect. Only the time budget
    /// counts as a capped pass for budget growth.
    pub fn drain<S, D>(
        &mut self,
        source: &mut S,
        dispatch: &mut D,
        clock: &impl Clock,
        context: &SchedulerContext,
    ) -> DrainReport
    where
        S: MessageSource,
        D: MessageDispatch<S::Message>,
    {
        let mut processed = 0u32;
        self.budget.begin_pass(clock.now());

        let exit = loop {
            if context.disconnect_requested() {
                break DrainExit::Disconnected;
            }
            if processed >= self.max_messages_per_frame {
                break DrainExit::MessageCap;
            }
            if self.budget.is_exhausted(clock.now()) {
                break DrainExit::TimeBudget;
            }
            match source.next_message() {
                Some(message) => {
                    dispatch.dispatch(message);
                    processed += 1;
                }
                None => break DrainExit::QueueEmpty,
            }
        };

        let report = DrainReport { processed, exit };
        self.budget.report_pass_outcome(report.capped_by_time());
        self.record(report);
        report
    }

    fn record(&mut self, report: DrainReport) {
        self.stats.passes = self.stats.passes.saturating_add(1);
        self.stats.messages = self.stats.messages.saturating_add(u64::from(report.processed));
        match report.exit {
            DrainExit::MessageCap => {
                self.stats.cap_hits = self.stats.cap_hits.saturating_add(1);
                info!(
                    max_messages_per_frame = self.max_messages_per_frame,
                    "message_cap_reached"
                );
            }
            DrainExit::TimeBudget => {
                self.stats.time_caps = self.stats.time_caps.saturating_add(1);
                debug!(
                    processed = report.processed,
                    next_limit_ms = self.budget.current_limit_seconds() * 1000.0,
                    consecutive = self.budget.consecutive_capped_passes(),
                    "message_budget_grew"
                );
            }
            DrainExit::QueueEmpty | DrainExit::Disconnected => {}
        }
    }

    pub fn budget(&self) -> &AdaptiveBudget {
        &self.budget
    }

    pub fn max_messages_per_frame(&self) -> u32 {
        self.max_messages_per_frame
    }

    pub fn stats(&self) -> IntakeStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;

    #[derive(Default)]
    struct CountingDispatch {
        seen: Vec<u32>,
        cost: Duration,
        clock: Option<ManualClock>,
    }

    impl MessageDispatch<u32> for CountingDispatch {
        fn dispatch(&mut self, message: u32) {
            self.seen.push(message);
            if let Some(clock) = &self.clock {
                clock.advance(self.cost);
            }
        }
    }

    fn queue_of(count: u32) -> VecDeque<u32> {
        (0..count).collect()
    }

    #[test]
    fn message_cap_stops_drain_without_counting_as_time_cap() {
        let clock = ManualClock::new();
        let context = SchedulerContext::new();
        let mut pump = MessageIntakePump::new(AdaptiveBudget::default(), 200);
        let mut queue = queue_of(500);
        let mut dispatch = CountingDispatch::default();

        let report = pump.drain(&mut queue, &mut dispatch, &clock, &context);

        assert_eq!(report.processed, 200);
        assert_eq!(report.exit, DrainExit::MessageCap);
        assert_eq!(queue.len(), 300);
        assert_eq!(dispatch.seen.len(), 200);
        assert_eq!(pump.budget().consecutive_capped_passes(), 0);
        assert_eq!(
            pump.budget().current_limit_seconds(),
            pump.budget().default_limit_seconds()
        );
        assert_eq!(pump.stats().cap_hits, 1);
    }

    #[test]
    fn dispatch_order_matches_arrival_order() {
        let clock = ManualClock::new();
        let context = SchedulerContext::new();
        let mut pump = MessageIntakePump::new(AdaptiveBudget::default(), 10);
        let mut queue = queue_of(5);
        let mut dispatch = CountingDispatch::default();

        let report = pump.drain(&mut queue, &mut dispatch, &clock, &context);

        assert_eq!(report.exit, DrainExit::QueueEmpty);
        assert_eq!(dispatch.seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn slow_messages_exhaust_budget_and_grow_it() {
        let clock = ManualClock::new();
        let context = SchedulerContext::new();
        let mut pump = MessageIntakePump::new(AdaptiveBudget::new(0.020, 1.035), 400);
        let mut queue = queue_of(100);
        let mut dispatch = CountingDispatch {
            cost: Duration::from_millis(1),
            clock: Some(clock.clone()),
            ..CountingDispatch::default()
        };

        let report = pump.drain(&mut queue, &mut dispatch, &clock, &context);

        assert_eq!(report.exit, DrainExit::TimeBudget);
        assert_eq!(report.processed, 20);
        assert!((pump.budget().current_limit_seconds() - 0.020 * 1.035).abs() < 1e-12);

        let mut empty = VecDeque::new();
        let report = pump.drain(&mut empty, &mut dispatch, &clock, &context);
        assert_eq!(report.exit, DrainExit::QueueEmpty);
        assert_eq!(pump.budget().current_limit_seconds(), 0.020);
    }

    #[test]
    fn cap_is_respected_for_any_queue_size() {
        let clock = ManualClock::new();
        let context = SchedulerContext::new();
        for (cap, queued) in [(1u32, 0u32), (1, 5), (7, 3), (7, 7), (7, 8), (50, 1000)] {
            let mut pump = MessageIntakePump::new(AdaptiveBudget::default(), cap);
            let mut queue = queue_of(queued);
            let mut dispatch = CountingDispatch::default();
            let report = pump.drain(&mut queue, &mut dispatch, &clock, &context);
            assert!(dispatch.seen.len() as u32 <= cap);
            assert_eq!(report.processed, cap.min(queued));
        }
    }

    #[test]
    fn disconnect_request_stops_further_dispatch() {
        struct KickOnThird<'a> {
            context: &'a SchedulerContext,
            seen: u32,
        }
        impl MessageDispatch<u32> for KickOnThird<'_> {
            fn dispatch(&mut self, _message: u32) {
                self.seen += 1;
                if self.seen == 3 {
                    self.context.request_disconnect("kicked");
                }
            }
        }

        let clock = ManualClock::new();
        let context = SchedulerContext::new();
        let mut pump = MessageIntakePump::new(AdaptiveBudget::default(), 100);
        let mut queue = queue_of(10);
        let mut dispatch = KickOnThird {
            context: &context,
            seen: 0,
        };

        let report = pump.drain(&mut queue, &mut dispatch, &clock, &context);

        assert_eq!(report.exit, DrainExit::Disconnected);
        assert_eq!(report.processed, 3);
        assert_eq!(queue.len(), 7);
        assert!(!report.capped_by_time());
    }

    #[test]
    fn channel_receiver_is_a_message_source() {
        let (sender, mut receiver) = std::sync::mpsc::channel();
        sender.send(1u32).expect("send");
        sender.send(2u32).expect("send");

        assert_eq!(receiver.next_message(), Some(1));
        assert_eq!(receiver.next_message(), Some(2));
        assert_eq!(receiver.next_message(), None);
    }
}
