//! Core domain types shared across the kiln workspace.
//!
//! This crate defines the wire-level shape of a single artifact directory's
//! coordination state: [`State`], [`ResultState`], [`Attempt`], and the
//! [`MigrationRecord`] overlay. Sentinel strings (`"queued"`, `"crashed"`, ...)
//! are the on-disk wire form; in memory they are a closed set of variants so
//! reconciler transitions are checked by the type system rather than by
//! string comparison.
//!
//! ## Serialization
//!
//! All types implement `Serialize`/`Deserialize` via serde and round-trip
//! through the canonical JSON written by kiln's state store. Unknown
//! top-level fields in `state.json` are rejected by the state store (not
//! here) so that a corrupt or foreign file never silently resets.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current `state.json` schema version. Unknown versions are a fatal read error.
pub const SCHEMA_VERSION: u32 = 1;

/// Where an attempt is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Local,
    Remote,
}

/// The three non-success terminal outcomes an attempt can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Cancelled,
    Preempted,
    Crashed,
}

impl TerminalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminalStatus::Cancelled => "cancelled",
            TerminalStatus::Preempted => "preempted",
            TerminalStatus::Crashed => "crashed",
        }
    }
}

/// Identity of whoever is holding an attempt or a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub pid: u32,
    pub host: String,
    pub user: String,
    pub command: String,
}

/// Structured error captured on a failed or terminalized attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl AttemptError {
    pub fn signal(signum: i32) -> Self {
        Self {
            kind: "signal".to_string(),
            message: format!("signal:{signum}"),
            traceback: None,
        }
    }
}

/// Fields common to every attempt status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptHeader {
    pub id: String,
    pub number: u64,
    pub backend: Backend,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub lease_duration_sec: f64,
    pub lease_expires_at: DateTime<Utc>,
    pub owner: Owner,
    /// Free-form scheduler metadata (e.g. a remote job id). Merged in place
    /// by the reconciler whenever a scheduler probe returns extra keys.
    #[serde(default)]
    pub scheduler: BTreeMap<String, serde_json::Value>,
}

/// A single execution of `_create` for one artifact directory.
///
/// The wire form is a sentinel `status` string (`"queued"`, `"running"`,
/// `"success"`, `"failed"`, `"cancelled"`, `"preempted"`, `"crashed"`); the
/// in-memory form is this closed enum, so a caller can never construct an
/// attempt with a status the reconciler doesn't know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Attempt {
    Queued {
        #[serde(flatten)]
        header: AttemptHeader,
    },
    Running {
        #[serde(flatten)]
        header: AttemptHeader,
    },
    Success {
        #[serde(flatten)]
        header: AttemptHeader,
        ended_at: DateTime<Utc>,
    },
    Failed {
        #[serde(flatten)]
        header: AttemptHeader,
        ended_at: DateTime<Utc>,
        error: AttemptError,
    },
    Cancelled {
        #[serde(flatten)]
        header: AttemptHeader,
        ended_at: DateTime<Utc>,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<AttemptError>,
    },
    Preempted {
        #[serde(flatten)]
        header: AttemptHeader,
        ended_at: DateTime<Utc>,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<AttemptError>,
    },
    Crashed {
        #[serde(flatten)]
        header: AttemptHeader,
        ended_at: DateTime<Utc>,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<AttemptError>,
    },
}

impl Attempt {
    pub fn header(&self) -> &AttemptHeader {
        match self {
            Attempt::Queued { header }
            | Attempt::Running { header }
            | Attempt::Success { header, .. }
            | Attempt::Failed { header, .. }
            | Attempt::Cancelled { header, .. }
            | Attempt::Preempted { header, .. }
            | Attempt::Crashed { header, .. } => header,
        }
    }

    pub fn id(&self) -> &str {
        &self.header().id
    }

    /// True for the `{queued, running}` set: the at-most-one-active set.
    pub fn is_active(&self) -> bool {
        matches!(self, Attempt::Queued { .. } | Attempt::Running { .. })
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Attempt::Running { .. })
    }

    pub fn terminal_status(&self) -> Option<TerminalStatus> {
        match self {
            Attempt::Cancelled { .. } => Some(TerminalStatus::Cancelled),
            Attempt::Preempted { .. } => Some(TerminalStatus::Preempted),
            Attempt::Crashed { .. } => Some(TerminalStatus::Crashed),
            _ => None,
        }
    }
}

/// `result` half of [`State`]: only `Success` is loadable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResultState {
    #[default]
    Absent,
    Incomplete,
    Success {
        created_at: DateTime<Utc>,
    },
    Failed,
    Migrated {
        migrated_at: DateTime<Utc>,
    },
}

impl ResultState {
    pub fn is_success(&self) -> bool {
        matches!(self, ResultState::Success { .. })
    }

    pub fn is_sticky(&self) -> bool {
        matches!(
            self,
            ResultState::Success { .. } | ResultState::Failed | ResultState::Migrated { .. }
        )
    }
}

/// The full contents of `state.json` for one artifact directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub schema_version: u32,
    #[serde(default)]
    pub result: ResultState,
    #[serde(default)]
    pub attempt: Option<Attempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            result: ResultState::Absent,
            attempt: None,
            updated_at: None,
        }
    }
}

/// How a migration target reuses a source directory's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPolicy {
    Alias,
    Move,
    Copy,
}

/// What kind of migration record this is, from the perspective of the
/// directory it is written into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationKind {
    Alias,
    Moved,
    Migrated,
}

/// Identifies one side of a migration: namespace, hash, and root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRef {
    pub namespace: String,
    pub hash: String,
    pub root: String,
}

/// `migration.json`: a per-directory overlay redirecting reads to another directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub kind: MigrationKind,
    pub policy: MigrationPolicy,
    pub from: DirectoryRef,
    pub to: DirectoryRef,
    pub migrated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwritten_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_values: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl MigrationRecord {
    pub fn is_active_alias(&self) -> bool {
        self.kind == MigrationKind::Alias && self.overwritten_at.is_none()
    }
}

/// Terminal verdict a remote-scheduler probe can report for a running attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeTerminal {
    Success,
    Failed,
    Cancelled,
    Preempted,
    Crashed,
}

/// The result of probing a remote scheduler about an in-flight attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerVerdict {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_status: Option<ProbeTerminal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Extra keys merged into `attempt.scheduler` verbatim.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> AttemptHeader {
        let now = Utc::now();
        AttemptHeader {
            id: "abc123".to_string(),
            number: 1,
            backend: Backend::Local,
            started_at: now,
            heartbeat_at: now,
            lease_duration_sec: 60.0,
            lease_expires_at: now,
            owner: Owner {
                pid: 1,
                host: "h".to_string(),
                user: "u".to_string(),
                command: "cmd".to_string(),
            },
            scheduler: BTreeMap::new(),
        }
    }

    #[test]
    fn running_attempt_round_trips_with_flat_status() {
        let attempt = Attempt::Running {
            header: sample_header(),
        };
        let json = serde_json::to_value(&attempt).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["id"], "abc123");
        let back: Attempt = serde_json::from_value(json).unwrap();
        assert!(back.is_running());
    }

    #[test]
    fn crashed_attempt_round_trips_with_reason() {
        let attempt = Attempt::Crashed {
            header: sample_header(),
            ended_at: Utc::now(),
            reason: "pid_dead".to_string(),
            error: None,
        };
        let json = serde_json::to_value(&attempt).unwrap();
        assert_eq!(json["status"], "crashed");
        assert_eq!(json["reason"], "pid_dead");
        assert_eq!(attempt.terminal_status(), Some(TerminalStatus::Crashed));
    }

    #[test]
    fn result_state_default_is_absent() {
        assert_eq!(ResultState::default(), ResultState::Absent);
        assert!(!ResultState::default().is_sticky());
    }

    #[test]
    fn success_and_failed_and_migrated_are_sticky() {
        assert!(
            ResultState::Success {
                created_at: Utc::now()
            }
            .is_sticky()
        );
        assert!(ResultState::Failed.is_sticky());
        assert!(
            ResultState::Migrated {
                migrated_at: Utc::now()
            }
            .is_sticky()
        );
        assert!(!ResultState::Incomplete.is_sticky());
    }

    #[test]
    fn state_default_has_current_schema_version() {
        let state = State::default();
        assert_eq!(state.schema_version, SCHEMA_VERSION);
        assert!(state.attempt.is_none());
    }

    #[test]
    fn migration_record_alias_is_active_until_overwritten() {
        let mut record = MigrationRecord {
            kind: MigrationKind::Alias,
            policy: MigrationPolicy::Alias,
            from: DirectoryRef {
                namespace: "a".to_string(),
                hash: "h1".to_string(),
                root: "data".to_string(),
            },
            to: DirectoryRef {
                namespace: "b".to_string(),
                hash: "h2".to_string(),
                root: "data".to_string(),
            },
            migrated_at: Utc::now(),
            overwritten_at: None,
            default_values: None,
            origin: None,
            note: None,
        };
        assert!(record.is_active_alias());
        record.overwritten_at = Some(Utc::now());
        assert!(!record.is_active_alias());
    }
}
