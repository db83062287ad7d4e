//! Artifact directory layout and atomic file I/O.
//!
//! Every file kiln writes inside an artifact directory goes through
//! [`write_atomic`]: write to a `.tmp` sibling, `fsync`, then rename over the
//! destination. A reader never observes a partially written file.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::error::{KilnError, Result};

pub const STATE_FILE: &str = "state.json";
pub const SUCCESS_FILE: &str = "SUCCESS.json";
pub const METADATA_FILE: &str = "metadata.json";
pub const MIGRATION_FILE: &str = "migration.json";
pub const EVENTS_FILE: &str = "events.jsonl";

pub const STATE_LOCK_FILE: &str = ".state.lock";
pub const COMPUTE_LOCK_FILE: &str = ".compute.lock";
pub const SUBMIT_LOCK_FILE: &str = ".submit.lock";

pub fn state_path(dir: &Path) -> PathBuf {
    dir.join(STATE_FILE)
}

pub fn success_path(dir: &Path) -> PathBuf {
    dir.join(SUCCESS_FILE)
}

pub fn metadata_path(dir: &Path) -> PathBuf {
    dir.join(METADATA_FILE)
}

pub fn migration_path(dir: &Path) -> PathBuf {
    dir.join(MIGRATION_FILE)
}

pub fn events_path(dir: &Path) -> PathBuf {
    dir.join(EVENTS_FILE)
}

pub fn state_lock_path(dir: &Path) -> PathBuf {
    dir.join(STATE_LOCK_FILE)
}

pub fn compute_lock_path(dir: &Path) -> PathBuf {
    dir.join(COMPUTE_LOCK_FILE)
}

pub fn submit_lock_path(dir: &Path) -> PathBuf {
    dir.join(SUBMIT_LOCK_FILE)
}

/// Directory root for a single artifact: `<root>/<namespace>/<hash>`.
pub fn directory_for(root: &Path, namespace: &str, hash: &str) -> PathBuf {
    root.join(namespace).join(hash)
}

fn io_err(path: &Path, source: std::io::Error) -> KilnError {
    KilnError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `contents` to `path` atomically: write a `.tmp` sibling, sync it,
/// then rename over `path`. Creates parent directories as needed.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;

    let tmp_path = tmp_sibling(path);
    {
        let mut tmp = File::create(&tmp_path).map_err(|e| io_err(&tmp_path, e))?;
        tmp.write_all(contents).map_err(|e| io_err(&tmp_path, e))?;
        tmp.sync_all().map_err(|e| io_err(&tmp_path, e))?;
    }
    fs::rename(&tmp_path, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically to `path`.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| KilnError::CorruptState {
        path: path.to_path_buf(),
        reason: format!("failed to serialize: {e}"),
    })?;
    write_atomic(path, &bytes)
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let pid = std::process::id();
    path.with_file_name(format!(".{file_name}.{pid}.tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_atomic_creates_file_and_no_tmp_residue() {
        let td = tempdir().unwrap();
        let path = td.path().join("sub").join("state.json");
        write_atomic(&path, b"{}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{}");
        let entries: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn write_atomic_overwrites_existing_file() {
        let td = tempdir().unwrap();
        let path = td.path().join("state.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn directory_for_joins_namespace_and_hash() {
        let root = Path::new("/data-kiln/data");
        assert_eq!(
            directory_for(root, "builds", "abc123"),
            PathBuf::from("/data-kiln/data/builds/abc123")
        );
    }
}
