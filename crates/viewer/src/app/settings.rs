use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};
use viewer_core::{ConfigError, SchedulerConfig};

pub(crate) const SLOW_FRAME_ENV_VAR: &str = "VIEWER_SLOW_FRAME_MS";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ViewerSettings {
    pub(crate) scheduler: SchedulerConfig,
    pub(crate) circuit: CircuitSettings,
    pub(crate) uploads: UploadSettings,
    /// Simulated cost of drawing one frame.
    pub(crate) render_cost_ms: u64,
}

impl Default for ViewerSettings {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            circuit: CircuitSettings::default(),
            uploads: UploadSettings::default(),
            render_cost_ms: 8,
        }
    }
}

/// Shape of the simulated region traffic.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct CircuitSettings {
    pub(crate) burst_interval_ms: u64,
    pub(crate) burst_size: u32,
    /// Every n-th message of a burst is a chat line. Zero disables chat.
    pub(crate) chat_every: u32,
    /// Every n-th message of a burst carries image data. Zero disables images.
    pub(crate) image_every: u32,
    pub(crate) logout_reply_latency_ms: u64,
    /// The region kicks the agent after this long, if set.
    pub(crate) kick_after_secs: Option<f64>,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            burst_interval_ms: 50,
            burst_size: 40,
            chat_every: 25,
            image_every: 4,
            logout_reply_latency_ms: 300,
            kick_after_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct UploadSettings {
    /// Uploads already queued when the viewer starts.
    pub(crate) pending_at_start: u32,
    pub(crate) completed_per_second: f64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            pending_at_start: 0,
            completed_per_second: 4.0,
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse settings file {path} at `{json_path}`: {source}")]
    Parse {
        path: PathBuf,
        json_path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid scheduler settings: {0}")]
    Invalid(#[from] ConfigError),
    #[error("`{field}` must be a finite, non-negative number (got {value})")]
    InvalidNumber { field: &'static str, value: f64 },
}

/// Loads settings from `path`. A missing file means all defaults.
pub(crate) fn load_settings(path: &Path) -> Result<ViewerSettings, SettingsError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(source) if source.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "settings_file_missing_using_defaults");
            return Ok(ViewerSettings::default());
        }
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let settings = parse_settings(&raw).map_err(|(json_path, source)| SettingsError::Parse {
        path: path.to_path_buf(),
        json_path,
        source,
    })?;
    settings.validate()?;
    info!(path = %path.display(), "settings_loaded");
    Ok(settings)
}

fn parse_settings(raw: &str) -> Result<ViewerSettings, (String, serde_json::Error)> {
    let mut deserializer = serde_json::Deserializer::from_str(raw);
    serde_path_to_error::deserialize::<_, ViewerSettings>(&mut deserializer).map_err(|error| {
        let json_path = error.path().to_string();
        (json_path, error.into_inner())
    })
}

impl ViewerSettings {
    pub(crate) fn validate(&self) -> Result<(), SettingsError> {
        self.scheduler.validate()?;
        let rate = self.uploads.completed_per_second;
        if !rate.is_finite() || rate < 0.0 {
            return Err(SettingsError::InvalidNumber {
                field: "uploads.completed_per_second",
                value: rate,
            });
        }
        if let Some(kick_after) = self.circuit.kick_after_secs {
            if !kick_after.is_finite() || kick_after < 0.0 {
                return Err(SettingsError::InvalidNumber {
                    field: "circuit.kick_after_secs",
                    value: kick_after,
                });
            }
        }
        Ok(())
    }

    /// Applies `VIEWER_SLOW_FRAME_MS` on top of the file value.
    pub(crate) fn apply_env_overrides(&mut self) {
        let raw = std::env::var(SLOW_FRAME_ENV_VAR).ok();
        self.scheduler.simulated_slow_frame_ms =
            resolve_slow_frame_ms(raw.as_deref(), self.scheduler.simulated_slow_frame_ms);
    }
}

fn resolve_slow_frame_ms(raw: Option<&str>, configured: u64) -> u64 {
    let Some(value) = raw else {
        return configured;
    };
    match value.trim().parse::<u64>() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(
                value,
                fallback_ms = configured,
                "slow_frame_env_invalid_using_config"
            );
            configured
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().expect("temp dir");
        let settings = load_settings(&dir.path().join("settings.json")).expect("defaults");
        assert_eq!(settings, ViewerSettings::default());
    }

    #[test]
    fn partial_file_keeps_defaults_for_omitted_fields() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{ "scheduler": { "max_messages_per_frame": 50, "quit_after_secs": 3.5 },
                 "circuit": { "kick_after_secs": 2.0 } }"#,
        )
        .expect("write settings");

        let settings = load_settings(&path).expect("load");
        assert_eq!(settings.scheduler.max_messages_per_frame, 50);
        assert_eq!(settings.scheduler.quit_after_secs, Some(3.5));
        assert_eq!(settings.scheduler.logout_timeout_secs, 6.0);
        assert_eq!(settings.circuit.kick_after_secs, Some(2.0));
        assert_eq!(settings.circuit.burst_size, 40);
        assert_eq!(settings.render_cost_ms, 8);
    }

    #[test]
    fn parse_error_names_the_offending_json_path() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "scheduler": { "max_idle_time_ms": "fast" } }"#)
            .expect("write settings");

        match load_settings(&path) {
            Err(SettingsError::Parse { json_path, .. }) => {
                assert_eq!(json_path, "scheduler.max_idle_time_ms");
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "uploads": { "per_minute": 3 } }"#).expect("write settings");

        let err = load_settings(&path).expect_err("unknown field");
        assert!(matches!(err, SettingsError::Parse { .. }), "{err}");
    }

    #[test]
    fn invalid_scheduler_values_are_rejected_after_parsing() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{ "scheduler": { "min_frame_rate": 120.0, "max_frame_rate": 30.0 } }"#,
        )
        .expect("write settings");

        let err = load_settings(&path).expect_err("invalid");
        assert!(matches!(err, SettingsError::Invalid(_)), "{err}");
    }

    #[test]
    fn negative_upload_rate_is_rejected() {
        let mut settings = ViewerSettings::default();
        settings.uploads.completed_per_second = -1.0;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidNumber {
                field: "uploads.completed_per_second",
                ..
            })
        ));
    }

    #[test]
    fn slow_frame_override_falls_back_on_bad_values() {
        assert_eq!(resolve_slow_frame_ms(None, 7), 7);
        assert_eq!(resolve_slow_frame_ms(Some("25"), 7), 25);
        assert_eq!(resolve_slow_frame_ms(Some(" 0 "), 7), 0);
        assert_eq!(resolve_slow_frame_ms(Some("-3"), 7), 7);
        assert_eq!(resolve_slow_frame_ms(Some("soon"), 7), 7);
    }
}
