use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// What the session looked like when it was last saved on the way out.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub(crate) struct FinalSnapshot {
    pub(crate) session_id: u64,
    pub(crate) objects_seen: u64,
    pub(crate) chat_lines: u64,
    pub(crate) textures_requested: u64,
    pub(crate) uploads_completed: u64,
    pub(crate) uploads_pending: usize,
    pub(crate) disconnected: bool,
}

pub(crate) fn write_final_snapshot(path: &Path, snapshot: &FinalSnapshot) -> io::Result<()> {
    let text = serde_json::to_string_pretty(snapshot).map_err(io::Error::other)?;
    write_text_atomic(path, &text)
}

pub(crate) fn write_logout_marker(path: &Path, session_id: u64) -> io::Result<()> {
    write_text_atomic(path, &format!("logout_in_progress session:{session_id}\n"))
}

/// Returns `true` when a marker was actually removed.
pub(crate) fn remove_marker(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}

pub(crate) fn write_text_atomic(path: &Path, text: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let staged = staging_path_for(path);
    fs::write(&staged, text.as_bytes())?;
    swap_into_place(&staged, path)
}

fn swap_into_place(staged: &Path, final_path: &Path) -> io::Result<()> {
    match fs::remove_file(final_path) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => {
            let _ = fs::remove_file(staged);
            return Err(error);
        }
    }

    fs::rename(staged, final_path).inspect_err(|_| {
        let _ = fs::remove_file(staged);
    })
}

fn staging_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("marker");
    path.with_file_name(format!("{file_name}.tmp"))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn atomic_write_replaces_existing_content_and_leaves_no_staging_file() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("nested").join("logout.marker");

        write_text_atomic(&path, "first").expect("first write");
        write_text_atomic(&path, "second").expect("second write");

        assert_eq!(fs::read_to_string(&path).expect("read"), "second");
        assert!(!dir.path().join("nested").join("logout.marker.tmp").exists());
    }

    #[test]
    fn logout_marker_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("logout.marker");

        assert!(!remove_marker(&path).expect("remove missing"));
        write_logout_marker(&path, 42).expect("write");
        assert!(fs::read_to_string(&path)
            .expect("read")
            .contains("session:42"));
        assert!(remove_marker(&path).expect("remove"));
        assert!(!path.exists());
    }

    #[test]
    fn final_snapshot_is_written_as_json() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("final_snapshot.json");
        let snapshot = FinalSnapshot {
            session_id: 7,
            objects_seen: 120,
            chat_lines: 3,
            uploads_pending: 2,
            ..FinalSnapshot::default()
        };

        write_final_snapshot(&path, &snapshot).expect("write");
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(value["session_id"], 7);
        assert_eq!(value["objects_seen"], 120);
        assert_eq!(value["uploads_pending"], 2);
        assert_eq!(value["disconnected"], false);
    }
}
