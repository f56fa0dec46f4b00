use std::time::{Duration, Instant};

pub const DEFAULT_MESSAGE_BUDGET_SECONDS: f64 = 0.020;
/// ~2x after 20 consecutive capped passes, ~8x after 60.
pub const DEFAULT_BUDGET_GROWTH_FACTOR: f64 = 1.035;

/// Per-frame time allowance that grows while it keeps being exhausted and snaps back to
/// its default as soon as one pass finishes inside it.
///
/// Invariant: `current_limit_seconds >= default_limit_seconds`.
#[derive(Debug, Clone)]
pub struct AdaptiveBudget {
    current_limit_seconds: f64,
    default_limit_seconds: f64,
    growth_factor: f64,
    pass_started_at: Option<Instant>,
    consecutive_capped_passes: u32,
}

impl Default for AdaptiveBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MESSAGE_BUDGET_SECONDS, DEFAULT_BUDGET_GROWTH_FACTOR)
    }
}

impl AdaptiveBudget {
    pub fn new(default_limit_seconds: f64, growth_factor: f64) -> Self {
        let default_limit_seconds = if default_limit_seconds.is_finite() && default_limit_seconds > 0.0 {
            default_limit_seconds
        } else {
            DEFAULT_MESSAGE_BUDGET_SECONDS
        };
        let growth_factor = if growth_factor.is_finite() && growth_factor >= 1.0 {
            growth_factor
        } else {
            DEFAULT_BUDGET_GROWTH_FACTOR
        };
        Self {
            current_limit_seconds: default_limit_seconds,
            default_limit_seconds,
            growth_factor,
            pass_started_at: None,
            consecutive_capped_passes: 0,
        }
    }

    pub fn begin_pass(&mut self, now: Instant) {
        self.pass_started_at = Some(now);
    }

    /// Seconds left in the current pass. Negative once the pass has overrun.
    pub fn time_remaining(&self, now: Instant) -> f64 {
        let elapsed = self
            .pass_started_at
            .map(|start| now.saturating_duration_since(start).as_secs_f64())
            .unwrap_or(0.0);
        self.current_limit_seconds - elapsed
    }

    pub fn is_exhausted(&self, now: Instant) -> bool {
        self.time_remaining(now) <= 0.0
    }

    pub fn report_pass_outcome(&mut self, capped_by_time: bool) {
        self.pass_started_at = None;
        if capped_by_time {
            self.current_limit_seconds *= self.growth_factor;
            self.consecutive_capped_passes = self.consecutive_capped_passes.saturating_add(1);
        } else {
            self.current_limit_seconds = self.default_limit_seconds;
            self.consecutive_capped_passes = 0;
        }
    }

    pub fn current_limit_seconds(&self) -> f64 {
        self.current_limit_seconds
    }

    pub fn current_limit(&self) -> Duration {
        Duration::from_secs_f64(self.current_limit_seconds)
    }

    pub fn default_limit_seconds(&self) -> f64 {
        self.default_limit_seconds
    }

    pub fn growth_factor(&self) -> f64 {
        self.growth_factor
    }

    pub fn consecutive_capped_passes(&self) -> u32 {
        self.consecutive_capped_passes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sustained_capping_grows_geometrically() {
        let mut budget = AdaptiveBudget::default();
        for _ in 0..20 {
            budget.report_pass_outcome(true);
        }

        let expected = DEFAULT_MESSAGE_BUDGET_SECONDS * DEFAULT_BUDGET_GROWTH_FACTOR.powi(20);
        assert!((budget.current_limit_seconds() - expected).abs() < 1e-12);
        assert!(budget.current_limit_seconds() > 1.9 * DEFAULT_MESSAGE_BUDGET_SECONDS);
        assert!(budget.current_limit_seconds() < 2.1 * DEFAULT_MESSAGE_BUDGET_SECONDS);
        assert_eq!(budget.consecutive_capped_passes(), 20);
    }

    #[test]
    fn sixty_capped_passes_reach_roughly_eight_times_default() {
        let mut budget = AdaptiveBudget::default();
        for _ in 0..60 {
            budget.report_pass_outcome(true);
        }
        let ratio = budget.current_limit_seconds() / budget.default_limit_seconds();
        assert!(ratio > 7.0 && ratio < 9.0, "ratio was {ratio}");
    }

    #[test]
    fn one_uncapped_pass_resets_exactly() {
        let mut budget = AdaptiveBudget::new(0.05, 1.5);
        budget.report_pass_outcome(true);
        budget.report_pass_outcome(true);
        budget.report_pass_outcome(false);

        assert_eq!(budget.current_limit_seconds(), 0.05);
        assert_eq!(budget.consecutive_capped_passes(), 0);
    }

    #[test]
    fn limit_never_drops_below_default() {
        let mut budget = AdaptiveBudget::new(0.01, 0.5);
        for capped in [true, false, true, true, false, true] {
            budget.report_pass_outcome(capped);
            assert!(budget.current_limit_seconds() >= budget.default_limit_seconds());
        }
    }

    #[test]
    fn time_remaining_counts_down_from_pass_start() {
        let mut budget = AdaptiveBudget::new(0.020, 1.035);
        let start = Instant::now();
        budget.begin_pass(start);

        let remaining = budget.time_remaining(start + Duration::from_millis(5));
        assert!((remaining - 0.015).abs() < 1e-9);
        assert!(!budget.is_exhausted(start + Duration::from_millis(19)));
        assert!(budget.is_exhausted(start + Duration::from_millis(20)));
    }
}
