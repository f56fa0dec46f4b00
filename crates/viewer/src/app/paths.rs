use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub(crate) const ROOT_ENV_VAR: &str = "VIEWER_ROOT";
pub(crate) const SETTINGS_ENV_VAR: &str = "VIEWER_SETTINGS";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone)]
pub(crate) struct ViewerPaths {
    pub(crate) root: PathBuf,
    pub(crate) cache_dir: PathBuf,
    pub(crate) settings_file: PathBuf,
    /// Present while a logout is in flight; a leftover marker means the last session died
    /// during logout.
    pub(crate) logout_marker: PathBuf,
    pub(crate) final_snapshot: PathBuf,
    pub(crate) chat_log: PathBuf,
}

#[derive(Debug, Error)]
pub(crate) enum StartupError {
    #[error("failed to read environment variable {var}: {source}")]
    EnvVar {
        var: &'static str,
        #[source]
        source: env::VarError,
    },
    #[error("failed to resolve current executable path: {0}")]
    CurrentExe(#[source] std::io::Error),
    #[error("current executable path has no parent directory: {0}")]
    ExeHasNoParent(PathBuf),
    #[error("failed to create cache directory at {path}: {source}")]
    CreateCacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "VIEWER_ROOT is set but does not point to a viewer root: {path}\n\
A viewer root must contain Cargo.toml and either crates/ or settings.json."
    )]
    InvalidEnvRoot { path: PathBuf },
    #[error(
        "Could not find the viewer root above the executable directory: {start_dir}\n\
Expected a directory containing Cargo.toml and either crates/ or settings.json.\n\
Set {env_var} explicitly, for example:\n\
Bash/zsh: export {env_var}=\"/path/to/viewer\""
    )]
    RootNotFound {
        start_dir: PathBuf,
        env_var: &'static str,
    },
}

pub(crate) fn resolve_viewer_paths() -> Result<ViewerPaths, StartupError> {
    let root = resolve_root()?;
    let settings_override = read_env_path(SETTINGS_ENV_VAR)?;
    viewer_paths_under(root, settings_override)
}

fn viewer_paths_under(
    root: PathBuf,
    settings_override: Option<PathBuf>,
) -> Result<ViewerPaths, StartupError> {
    let cache_dir = root.join("cache");
    fs::create_dir_all(&cache_dir).map_err(|source| StartupError::CreateCacheDir {
        path: cache_dir.clone(),
        source,
    })?;

    Ok(ViewerPaths {
        settings_file: settings_override.unwrap_or_else(|| root.join(SETTINGS_FILE_NAME)),
        logout_marker: cache_dir.join("logout.marker"),
        final_snapshot: cache_dir.join("final_snapshot.json"),
        chat_log: cache_dir.join("chat.log"),
        cache_dir,
        root,
    })
}

fn resolve_root() -> Result<PathBuf, StartupError> {
    if let Some(raw) = read_env_path(ROOT_ENV_VAR)? {
        let normalized = normalize_path(&raw);
        return if is_root_marker(&normalized) {
            Ok(normalized)
        } else {
            Err(StartupError::InvalidEnvRoot { path: normalized })
        };
    }

    let exe = env::current_exe().map_err(StartupError::CurrentExe)?;
    let exe_dir = exe
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| StartupError::ExeHasNoParent(exe.clone()))?;
    find_root_above(&exe_dir).ok_or_else(|| StartupError::RootNotFound {
        start_dir: normalize_path(&exe_dir),
        env_var: ROOT_ENV_VAR,
    })
}

fn read_env_path(var: &'static str) -> Result<Option<PathBuf>, StartupError> {
    match env::var(var) {
        Ok(value) => Ok(Some(PathBuf::from(value))),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(source) => Err(StartupError::EnvVar { var, source }),
    }
}

fn find_root_above(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|candidate| is_root_marker(candidate))
        .map(normalize_path)
}

fn is_root_marker(path: &Path) -> bool {
    let cargo_toml = path.join("Cargo.toml").is_file();
    let has_crates = path.join("crates").is_dir();
    let has_settings = path.join(SETTINGS_FILE_NAME).is_file();

    cargo_toml && (has_crates || has_settings)
}

fn normalize_path(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn root_marker_requires_cargo_toml() {
        let dir = TempDir::new().expect("temp dir");
        fs::create_dir_all(dir.path().join("crates")).expect("crates dir");
        assert!(!is_root_marker(dir.path()));

        fs::write(dir.path().join("Cargo.toml"), "[workspace]\n").expect("cargo toml");
        assert!(is_root_marker(dir.path()));
    }

    #[test]
    fn settings_file_alone_also_marks_a_root() {
        let dir = TempDir::new().expect("temp dir");
        fs::write(dir.path().join("Cargo.toml"), "[workspace]\n").expect("cargo toml");
        assert!(!is_root_marker(dir.path()));

        fs::write(dir.path().join(SETTINGS_FILE_NAME), "{}").expect("settings");
        assert!(is_root_marker(dir.path()));
    }

    #[test]
    fn root_is_found_by_walking_up_from_a_nested_dir() {
        let dir = TempDir::new().expect("temp dir");
        fs::write(dir.path().join("Cargo.toml"), "[workspace]\n").expect("cargo toml");
        fs::create_dir_all(dir.path().join("crates")).expect("crates dir");
        let nested = dir.path().join("target").join("debug");
        fs::create_dir_all(&nested).expect("nested dir");

        assert_eq!(find_root_above(&nested), Some(normalize_path(dir.path())));
    }

    #[test]
    fn paths_are_laid_out_under_the_cache_dir() {
        let dir = TempDir::new().expect("temp dir");
        let paths = viewer_paths_under(dir.path().to_path_buf(), None).expect("paths");

        assert!(paths.cache_dir.is_dir());
        assert_eq!(paths.settings_file, dir.path().join("settings.json"));
        assert_eq!(paths.logout_marker, paths.cache_dir.join("logout.marker"));
        assert_eq!(paths.final_snapshot, paths.cache_dir.join("final_snapshot.json"));
    }

    #[test]
    fn settings_override_replaces_the_default_location() {
        let dir = TempDir::new().expect("temp dir");
        let custom = dir.path().join("alt.json");
        let paths =
            viewer_paths_under(dir.path().to_path_buf(), Some(custom.clone())).expect("paths");
        assert_eq!(paths.settings_file, custom);
    }
}
