use std::io;

use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use viewer_core::ConfigError;

use super::paths::{resolve_viewer_paths, StartupError, ViewerPaths};
use super::settings::{load_settings, SettingsError, ViewerSettings};

#[derive(Debug, Error)]
pub(crate) enum AppError {
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to start background worker thread: {0}")]
    SpawnWorker(#[source] io::Error),
    #[error("failed to start simulated circuit: {0}")]
    SpawnCircuit(#[source] io::Error),
}

pub(crate) struct AppWiring {
    pub(crate) paths: ViewerPaths,
    pub(crate) settings: ViewerSettings,
}

pub(crate) fn build_app() -> Result<AppWiring, AppError> {
    init_tracing();
    info!("=== Viewer Startup ===");

    let paths = resolve_viewer_paths()?;
    let mut settings = load_settings(&paths.settings_file)?;
    settings.apply_env_overrides();

    if paths.logout_marker.exists() {
        warn!(
            path = %paths.logout_marker.display(),
            "previous_session_ended_during_logout"
        );
    }
    info!(
        root = %paths.root.display(),
        cache_dir = %paths.cache_dir.display(),
        settings = %paths.settings_file.display(),
        "viewer_paths_resolved"
    );

    Ok(AppWiring { paths, settings })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();
}
