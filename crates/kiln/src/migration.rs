//! Migration overlay: alias/move/copy policies and alias detachment.
//!
//! Mirrors `migrate()` in the original implementation's migration module:
//! `alias` writes only a redirect record (`T`'s `state.json` becomes
//! `result = migrated`, no bytes move); `move`/`copy` transfer the payload
//! (everything under `from` except its internal subdirectory) and give `to`
//! a `migration.json`, with `move` additionally leaving a reciprocal
//! `migrated` record on `from` and marking it `migrated` too.

use std::fs;
use std::path::Path;

use chrono::Utc;
use kiln_types::{DirectoryRef, MigrationKind, MigrationPolicy, MigrationRecord, ResultState};
use tracing::info;

use crate::error::{KilnError, Result};
use crate::paths::{self, migration_path, success_path};
use crate::state_store;

const INTERNAL_DIR: &str = ".kiln";

/// Migrate `from` into `to` under `policy`. Returns the record written into `to`.
pub fn migrate(
    from: &Path,
    from_ref: DirectoryRef,
    to: &Path,
    to_ref: DirectoryRef,
    policy: MigrationPolicy,
    origin: Option<String>,
    note: Option<String>,
) -> Result<MigrationRecord> {
    fs::create_dir_all(to).map_err(|e| KilnError::Io {
        path: to.to_path_buf(),
        source: e,
    })?;

    let now = Utc::now();
    let record = MigrationRecord {
        kind: MigrationKind::Alias,
        policy,
        from: from_ref.clone(),
        to: to_ref.clone(),
        migrated_at: now,
        overwritten_at: None,
        default_values: None,
        origin: origin.clone(),
        note: note.clone(),
    };

    match policy {
        MigrationPolicy::Alias => {
            write_migrated_state(to)?;
        }
        MigrationPolicy::Move | MigrationPolicy::Copy => {
            transfer_payload(from, to, policy)?;
            copy_state(from, to)?;
        }
    }

    paths::write_json_atomic(&migration_path(to), &record)?;
    state_store::append_event(
        to,
        serde_json::json!({
            "type": "migrated",
            "policy": policy,
            "from": format!("{}:{}", from_ref.namespace, from_ref.hash),
            "to": format!("{}:{}", to_ref.namespace, to_ref.hash),
        }),
    );

    if policy != MigrationPolicy::Copy {
        // Informational only: `from`'s own `result` is untouched so an
        // alias source that is still `success` keeps serving reads through
        // the overlay. Only the reciprocal record marks the relationship.
        let reciprocal = MigrationRecord {
            kind: MigrationKind::Migrated,
            policy,
            from: from_ref.clone(),
            to: to_ref.clone(),
            migrated_at: now,
            overwritten_at: None,
            default_values: None,
            origin,
            note,
        };
        paths::write_json_atomic(&migration_path(from), &reciprocal)?;
    }

    state_store::append_event(
        from,
        serde_json::json!({
            "type": "migrated",
            "policy": policy,
            "from": format!("{}:{}", from_ref.namespace, from_ref.hash),
            "to": format!("{}:{}", to_ref.namespace, to_ref.hash),
        }),
    );

    info!(?policy, from = %from.display(), to = %to.display(), "migration complete");
    Ok(record)
}

fn write_migrated_state(to: &Path) -> Result<()> {
    state_store::update(to, |mut state| {
        state.result = ResultState::Migrated {
            migrated_at: Utc::now(),
        };
        state.attempt = None;
        state
    })?;
    Ok(())
}

fn transfer_payload(from: &Path, to: &Path, policy: MigrationPolicy) -> Result<()> {
    let entries = fs::read_dir(from).map_err(|e| KilnError::Io {
        path: from.to_path_buf(),
        source: e,
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| KilnError::Io {
            path: from.to_path_buf(),
            source: e,
        })?;
        if entry.file_name() == INTERNAL_DIR {
            continue;
        }
        let destination = to.join(entry.file_name());
        let metadata = entry.metadata().map_err(|e| KilnError::Io {
            path: entry.path(),
            source: e,
        })?;
        if policy == MigrationPolicy::Move {
            fs::rename(entry.path(), &destination).map_err(|e| KilnError::Io {
                path: entry.path(),
                source: e,
            })?;
        } else if metadata.is_dir() {
            copy_dir_recursive(&entry.path(), &destination)?;
        } else {
            fs::copy(entry.path(), &destination).map_err(|e| KilnError::Io {
                path: entry.path(),
                source: e,
            })?;
        }
    }
    Ok(())
}

fn copy_dir_recursive(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).map_err(|e| KilnError::Io {
        path: to.to_path_buf(),
        source: e,
    })?;
    for entry in fs::read_dir(from).map_err(|e| KilnError::Io {
        path: from.to_path_buf(),
        source: e,
    })? {
        let entry = entry.map_err(|e| KilnError::Io {
            path: from.to_path_buf(),
            source: e,
        })?;
        let destination = to.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir_recursive(&entry.path(), &destination)?;
        } else {
            fs::copy(entry.path(), &destination).map_err(|e| KilnError::Io {
                path: entry.path(),
                source: e,
            })?;
        }
    }
    Ok(())
}

fn copy_state(from: &Path, to: &Path) -> Result<()> {
    let src_internal = from.join(INTERNAL_DIR);
    if !src_internal.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(to.join(INTERNAL_DIR)).map_err(|e| KilnError::Io {
        path: to.join(INTERNAL_DIR),
        source: e,
    })?;

    let src_state = paths::state_path(from);
    if src_state.is_file() {
        fs::copy(&src_state, paths::state_path(to)).map_err(|e| KilnError::Io {
            path: src_state,
            source: e,
        })?;
    }
    let src_success = success_path(from);
    if src_success.is_file() {
        fs::copy(&src_success, success_path(to)).map_err(|e| KilnError::Io {
            path: src_success,
            source: e,
        })?;
    }
    Ok(())
}

/// Read `migration.json` for `dir`, if present.
pub fn read_migration(dir: &Path) -> Result<Option<MigrationRecord>> {
    let path = migration_path(dir);
    match fs::read(&path) {
        Ok(bytes) => {
            let record = serde_json::from_slice(&bytes).map_err(|e| KilnError::CorruptState {
                path,
                reason: format!("invalid migration.json: {e}"),
            })?;
            Ok(Some(record))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(KilnError::Io { path, source: e }),
    }
}

/// Detach an active alias on `dir` and on the `from` side it points to,
/// setting `overwritten_at` on both records and journaling a
/// `migration_overwrite` event in both directories. A no-op if `dir` has no
/// active alias.
pub fn detach(dir: &Path, from_dir: &Path, reason: &str) -> Result<()> {
    let Some(mut record) = read_migration(dir)? else {
        return Ok(());
    };
    if !record.is_active_alias() {
        return Ok(());
    }
    let now = Utc::now();
    record.overwritten_at = Some(now);
    paths::write_json_atomic(&migration_path(dir), &record)?;

    if let Some(mut reciprocal) = read_migration(from_dir)? {
        reciprocal.overwritten_at = Some(now);
        paths::write_json_atomic(&migration_path(from_dir), &reciprocal)?;
    }

    for d in [dir, from_dir] {
        state_store::append_event(d, serde_json::json!({"type": "migration_overwrite", "reason": reason}));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn dir_ref(namespace: &str, hash: &str) -> DirectoryRef {
        DirectoryRef {
            namespace: namespace.to_string(),
            hash: hash.to_string(),
            root: "data".to_string(),
        }
    }

    #[test]
    fn alias_migration_sets_migrated_result_and_no_bytes_move() {
        let root = tempdir().unwrap();
        let from = root.path().join("from");
        let to = root.path().join("to");
        fs::create_dir_all(&from).unwrap();
        fs::write(from.join("data.txt"), b"hello\n").unwrap();

        migrate(
            &from,
            dir_ref("ns", "h1"),
            &to,
            dir_ref("ns", "h2"),
            MigrationPolicy::Alias,
            None,
            None,
        )
        .unwrap();

        assert!(!to.join("data.txt").exists());
        let state = state_store::read_state(&to).unwrap();
        assert!(matches!(state.result, ResultState::Migrated { .. }));
        let record = read_migration(&to).unwrap().unwrap();
        assert!(record.is_active_alias());
    }

    #[test]
    fn move_migration_transfers_payload_and_marks_source_migrated() {
        let root = tempdir().unwrap();
        let from = root.path().join("from");
        let to = root.path().join("to");
        fs::create_dir_all(&from).unwrap();
        fs::write(from.join("data.txt"), b"payload").unwrap();

        migrate(
            &from,
            dir_ref("ns", "h1"),
            &to,
            dir_ref("ns", "h2"),
            MigrationPolicy::Move,
            None,
            None,
        )
        .unwrap();

        assert!(to.join("data.txt").exists());
        assert!(!from.join("data.txt").exists());
        assert!(read_migration(&from).unwrap().unwrap().kind == MigrationKind::Migrated);
    }

    #[test]
    fn copy_migration_leaves_source_untouched_and_unrecorded() {
        let root = tempdir().unwrap();
        let from = root.path().join("from");
        let to = root.path().join("to");
        fs::create_dir_all(&from).unwrap();
        fs::write(from.join("data.txt"), b"payload").unwrap();

        migrate(
            &from,
            dir_ref("ns", "h1"),
            &to,
            dir_ref("ns", "h2"),
            MigrationPolicy::Copy,
            None,
            None,
        )
        .unwrap();

        assert!(to.join("data.txt").exists());
        assert!(from.join("data.txt").exists());
        assert!(read_migration(&from).unwrap().is_none());
    }

    #[test]
    fn detach_sets_overwritten_at_on_both_sides() {
        let root = tempdir().unwrap();
        let from = root.path().join("from");
        let to = root.path().join("to");
        fs::create_dir_all(&from).unwrap();

        migrate(
            &from,
            dir_ref("ns", "h1"),
            &to,
            dir_ref("ns", "h2"),
            MigrationPolicy::Alias,
            None,
            None,
        )
        .unwrap();

        detach(&to, &from, "source invalidated").unwrap();
        assert!(!read_migration(&to).unwrap().unwrap().is_active_alias());
        assert!(read_migration(&from).unwrap().unwrap().overwritten_at.is_some());
    }
}
