use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::budget::{DEFAULT_BUDGET_GROWTH_FACTOR, DEFAULT_MESSAGE_BUDGET_SECONDS};
use crate::clock::{DEFAULT_INITIAL_FPS, DEFAULT_MAX_FRAME_RATE, DEFAULT_MIN_FRAME_RATE};

pub const DEFAULT_MAX_MESSAGES_PER_FRAME: u32 = 400;
pub const DEFAULT_IO_BACKLOG_HIGH_WATER: u32 = 1000;
pub const DEFAULT_UPLOAD_SAVE_TIMEOUT_SECS: f64 = 5.0;
pub const DEFAULT_LOGOUT_TIMEOUT_SECS: f64 = 6.0;
pub const MAX_BACKGROUND_YIELD_MS: u64 = 1000;

/// Tuning inputs consumed by the scheduler. None of the numbers are load-bearing beyond
/// "budget growth is mild and monotonic" and "shutdown is bounded".
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub min_frame_rate: f64,
    pub max_frame_rate: f64,
    pub initial_fps: f64,
    pub max_messages_per_frame: u32,
    pub message_budget_ms: f64,
    pub message_budget_growth: f64,
    pub worker_units_per_pass: u32,
    pub io_backlog_high_water: u32,
    pub min_frame_time_ms: f64,
    pub min_idle_time_ms: f64,
    pub max_idle_time_ms: f64,
    /// Fraction of the frame interval the pump may take, on top of `max_idle_time_ms`.
    pub idle_share_of_frame: f64,
    pub run_workers_concurrently: bool,
    pub background_yield_ms: u64,
    pub yield_time_ms: Option<u64>,
    pub no_render: bool,
    pub upload_save_timeout_secs: f64,
    pub logout_timeout_secs: f64,
    pub exit_drain_timeout_secs: f64,
    pub frame_stall_threshold_secs: f64,
    pub quit_after_secs: Option<f64>,
    pub metrics_log_interval_ms: u64,
    pub simulated_slow_frame_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_frame_rate: DEFAULT_MIN_FRAME_RATE,
            max_frame_rate: DEFAULT_MAX_FRAME_RATE,
            initial_fps: DEFAULT_INITIAL_FPS,
            max_messages_per_frame: DEFAULT_MAX_MESSAGES_PER_FRAME,
            message_budget_ms: DEFAULT_MESSAGE_BUDGET_SECONDS * 1000.0,
            message_budget_growth: DEFAULT_BUDGET_GROWTH_FACTOR,
            worker_units_per_pass: 1,
            io_backlog_high_water: DEFAULT_IO_BACKLOG_HIGH_WATER,
            min_frame_time_ms: 0.0,
            min_idle_time_ms: 0.0,
            max_idle_time_ms: 5.0,
            idle_share_of_frame: 0.05,
            run_workers_concurrently: false,
            background_yield_ms: 40,
            yield_time_ms: None,
            no_render: false,
            upload_save_timeout_secs: DEFAULT_UPLOAD_SAVE_TIMEOUT_SECS,
            logout_timeout_secs: DEFAULT_LOGOUT_TIMEOUT_SECS,
            exit_drain_timeout_secs: 5.0,
            frame_stall_threshold_secs: 1.0,
            quit_after_secs: None,
            metrics_log_interval_ms: 1000,
            simulated_slow_frame_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("`{field}` must be a finite, non-negative number (got {value})")]
    InvalidNumber { field: &'static str, value: f64 },
    #[error("`{field}` must be greater than zero (got {value})")]
    NotPositive { field: &'static str, value: f64 },
    #[error("min_frame_rate ({min}) is above max_frame_rate ({max})")]
    FrameRateRange { min: f64, max: f64 },
    #[error("message_budget_growth must be at least 1.0 (got {0})")]
    GrowthBelowOne(f64),
    #[error("max_messages_per_frame must be at least 1")]
    ZeroMessageCap,
    #[error("min_idle_time_ms ({min_ms}) is above max_idle_time_ms ({max_ms})")]
    IdleWindowInverted { min_ms: f64, max_ms: f64 },
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_negative = [
            ("min_frame_time_ms", self.min_frame_time_ms),
            ("min_idle_time_ms", self.min_idle_time_ms),
            ("max_idle_time_ms", self.max_idle_time_ms),
            ("idle_share_of_frame", self.idle_share_of_frame),
            ("upload_save_timeout_secs", self.upload_save_timeout_secs),
            ("logout_timeout_secs", self.logout_timeout_secs),
            ("exit_drain_timeout_secs", self.exit_drain_timeout_secs),
            ("frame_stall_threshold_secs", self.frame_stall_threshold_secs),
        ];
        for (field, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidNumber { field, value });
            }
        }
        if let Some(value) = self.quit_after_secs {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidNumber {
                    field: "quit_after_secs",
                    value,
                });
            }
        }

        let positive = [
            ("min_frame_rate", self.min_frame_rate),
            ("max_frame_rate", self.max_frame_rate),
            ("initial_fps", self.initial_fps),
            ("message_budget_ms", self.message_budget_ms),
        ];
        for (field, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::NotPositive { field, value });
            }
        }

        if self.min_frame_rate > self.max_frame_rate {
            return Err(ConfigError::FrameRateRange {
                min: self.min_frame_rate,
                max: self.max_frame_rate,
            });
        }
        if !(self.message_budget_growth >= 1.0) || !self.message_budget_growth.is_finite() {
            return Err(ConfigError::GrowthBelowOne(self.message_budget_growth));
        }
        if self.max_messages_per_frame == 0 {
            return Err(ConfigError::ZeroMessageCap);
        }
        if self.min_idle_time_ms > self.max_idle_time_ms {
            return Err(ConfigError::IdleWindowInverted {
                min_ms: self.min_idle_time_ms,
                max_ms: self.max_idle_time_ms,
            });
        }
        Ok(())
    }

    pub fn message_budget_seconds(&self) -> f64 {
        self.message_budget_ms / 1000.0
    }

    pub fn min_frame_time(&self) -> Duration {
        millis(self.min_frame_time_ms)
    }

    pub fn min_idle_time(&self) -> Duration {
        millis(self.min_idle_time_ms)
    }

    pub fn max_idle_time(&self) -> Duration {
        millis(self.max_idle_time_ms)
    }

    pub fn background_yield(&self) -> Duration {
        Duration::from_millis(self.background_yield_ms.min(MAX_BACKGROUND_YIELD_MS))
    }

    pub fn yield_time(&self) -> Option<Duration> {
        self.yield_time_ms.map(Duration::from_millis)
    }

    pub fn upload_save_timeout(&self) -> Duration {
        seconds(self.upload_save_timeout_secs)
    }

    pub fn logout_timeout(&self) -> Duration {
        seconds(self.logout_timeout_secs)
    }

    pub fn exit_drain_timeout(&self) -> Duration {
        seconds(self.exit_drain_timeout_secs)
    }

    pub fn frame_stall_threshold(&self) -> Duration {
        seconds(self.frame_stall_threshold_secs)
    }

    pub fn quit_after(&self) -> Option<Duration> {
        self.quit_after_secs.map(seconds).filter(|limit| !limit.is_zero())
    }

    pub fn metrics_log_interval(&self) -> Duration {
        normalize_non_zero_duration(
            Duration::from_millis(self.metrics_log_interval_ms),
            Duration::from_secs(1),
        )
    }

    pub fn simulated_slow_frame(&self) -> Duration {
        Duration::from_millis(self.simulated_slow_frame_ms)
    }
}

fn millis(value: f64) -> Duration {
    seconds(value / 1000.0)
}

fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

fn normalize_non_zero_duration(value: Duration, fallback: Duration) -> Duration {
    if value.is_zero() {
        fallback
    } else {
        value
    }
}
