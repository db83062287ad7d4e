//! Read/write access to `state.json` and the attempt-transition family.
//!
//! Every mutation goes through [`update`]: read the current state (or the
//! schema default if the file doesn't exist yet), hold `.state.lock` across a
//! caller-supplied transform, then write the result back atomically and
//! append a journal entry. A corrupt `state.json` — unparseable JSON or an
//! unrecognized `schema_version` — is always a fatal [`KilnError::CorruptState`];
//! unlike the original implementation this store never silently falls back
//! to a fresh default on a read error, since doing so would make the
//! at-most-one-active invariant unenforceable against a file someone else
//! half-wrote.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use kiln_types::{Attempt, AttemptError, AttemptHeader, Backend, Owner, ResultState, State, SCHEMA_VERSION};
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::error::{KilnError, Result};
use crate::lock;
use crate::paths::{self, state_path, success_path};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(300);

fn corrupt(path: &Path, reason: impl Into<String>) -> KilnError {
    KilnError::CorruptState {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Read `state.json`, or the schema default if it doesn't exist yet.
///
/// A file that exists but fails to parse, or whose `schema_version` this
/// build doesn't recognize, is a fatal error — never silently reset.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn read_state(dir: &Path) -> Result<State> {
    let path = state_path(dir);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(State::default()),
        Err(e) => return Err(KilnError::Io { path, source: e }),
    };

    let state: State = serde_json::from_slice(&bytes)
        .map_err(|e| corrupt(&path, format!("invalid json: {e}")))?;

    if state.schema_version != SCHEMA_VERSION {
        return Err(corrupt(
            &path,
            format!(
                "unrecognized schema_version {} (expected {SCHEMA_VERSION})",
                state.schema_version
            ),
        ));
    }

    Ok(state)
}

fn write_state(dir: &Path, state: &State) -> Result<()> {
    paths::write_json_atomic(&state_path(dir), state)
}

/// Read-modify-write `state.json` under `.state.lock`. `transform` receives
/// the current state and returns the new one; its return value is also
/// returned to the caller.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn update(dir: &Path, transform: impl FnOnce(State) -> State) -> Result<State> {
    let handle = lock::acquire_state_lock(dir, DEFAULT_LOCK_TIMEOUT, DEFAULT_LOCK_STALE_AFTER)?;
    let current = read_state(dir)?;
    let mut next = transform(current);
    next.schema_version = SCHEMA_VERSION;
    next.updated_at = Some(Utc::now());
    write_state(dir, &next)?;
    handle.release();
    Ok(next)
}

/// Append one line to `events.jsonl`. Best-effort: failures are logged, never
/// propagated, since correctness never depends on the journal.
pub fn append_event(dir: &Path, event: serde_json::Value) {
    if let Err(e) = kiln_events::append_event(dir, event) {
        tracing::warn!(error = %e, dir = %dir.display(), "failed to append event");
    }
}

/// Whether `SUCCESS.json` exists for this directory.
pub fn success_marker_exists(dir: &Path) -> bool {
    success_path(dir).exists()
}

/// Write `SUCCESS.json`. Idempotent: safe to call more than once.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn write_success_marker(dir: &Path) -> Result<()> {
    paths::write_json_atomic(&success_path(dir), &json!({"created_at": Utc::now()}))
}

/// Unlink `SUCCESS.json` and reset `result` to `absent`, discarding a cached
/// success outright (used by `always_rerun`, never by the reconciler).
#[instrument(skip_all, fields(dir = %dir.display(), reason))]
pub fn invalidate_success(dir: &Path, reason: &str) -> Result<State> {
    let _ = std::fs::remove_file(success_path(dir));
    let state = update(dir, |mut state| {
        state.result = ResultState::Absent;
        state
    })?;
    tracing::warn!(dir = %dir.display(), reason, "invalidated cached success");
    append_event(dir, json!({"type": "success_invalidated", "reason": reason}));
    Ok(state)
}

fn new_attempt_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{nanos:x}")
}

fn owner_for_here(command: String) -> Owner {
    Owner {
        pid: std::process::id(),
        host: gethostname::gethostname().to_string_lossy().into_owned(),
        user: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
        command,
    }
}

/// Start a new attempt in `queued` status, bumping the attempt number from
/// whatever the previous attempt (if any) recorded.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn start_queued(
    dir: &Path,
    backend: Backend,
    lease_duration: Duration,
    command: String,
) -> Result<State> {
    let state = update(dir, |mut state| {
        let number = state.attempt.as_ref().map(|a| a.header().number + 1).unwrap_or(1);
        if let Some(prev) = &state.attempt {
            if prev.terminal_status().is_some() {
                debug!(prev_status = ?prev.terminal_status(), "starting new attempt after terminal predecessor");
            }
        }
        let now = Utc::now();
        let header = AttemptHeader {
            id: new_attempt_id(),
            number,
            backend,
            started_at: now,
            heartbeat_at: now,
            lease_duration_sec: lease_duration.as_secs_f64(),
            lease_expires_at: now + chrono::Duration::from_std(lease_duration).unwrap_or_default(),
            owner: owner_for_here(command.clone()),
            scheduler: Default::default(),
        };
        state.attempt = Some(Attempt::Queued { header });
        state
    })?;
    append_event(dir, json!({"type": "attempt_queued", "attempt_id": state.attempt.as_ref().map(|a| a.id())}));
    Ok(state)
}

/// Transition the current attempt from `queued` to `running`.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn start_running(dir: &Path) -> Result<State> {
    let state = update(dir, |mut state| {
        if let Some(Attempt::Queued { header }) = state.attempt {
            state.attempt = Some(Attempt::Running { header });
        }
        state
    })?;
    append_event(dir, json!({"type": "attempt_running", "attempt_id": state.attempt.as_ref().map(|a| a.id())}));
    Ok(state)
}

/// Refresh `heartbeat_at`/`lease_expires_at` for the attempt matching `attempt_id`.
/// No-ops (returns the unchanged state) if the ids don't match or it isn't running.
pub fn heartbeat(dir: &Path, attempt_id: &str, lease_duration: Duration) -> Result<State> {
    update(dir, |mut state| {
        if let Some(Attempt::Running { header }) = &mut state.attempt {
            if header.id == attempt_id {
                let now = Utc::now();
                header.heartbeat_at = now;
                header.lease_duration_sec = lease_duration.as_secs_f64();
                header.lease_expires_at =
                    now + chrono::Duration::from_std(lease_duration).unwrap_or_default();
            }
        }
        state
    })
}

/// Merge extra scheduler metadata into the current attempt's `scheduler` map.
pub fn set_scheduler_fields(dir: &Path, fields: std::collections::BTreeMap<String, serde_json::Value>) -> Result<State> {
    update(dir, |mut state| {
        if let Some(attempt) = &mut state.attempt {
            header_mut(attempt).scheduler.extend(fields);
        }
        state
    })
}

fn header_mut(attempt: &mut Attempt) -> &mut AttemptHeader {
    match attempt {
        Attempt::Queued { header }
        | Attempt::Running { header }
        | Attempt::Success { header, .. }
        | Attempt::Failed { header, .. }
        | Attempt::Cancelled { header, .. }
        | Attempt::Preempted { header, .. }
        | Attempt::Crashed { header, .. } => header,
    }
}

/// True if `state`'s current attempt matches `attempt_id`. All three
/// `finish_*` transitions below no-op when this doesn't hold, the same way
/// [`heartbeat`] already guards against a stale writer: without this check,
/// a process whose attempt was already reconciled away (e.g. lease-expired
/// and reclaimed by a new attempt) could finish a stale compute and
/// overwrite a newer attempt's in-flight state.
fn attempt_matches(state: &State, attempt_id: &str) -> bool {
    matches!(&state.attempt, Some(attempt) if attempt.id() == attempt_id)
}

/// Finish the current attempt as `success`, writing `result = success`.
/// No-ops (returns the unchanged state) if `attempt_id` doesn't match the
/// current attempt.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn finish_success(dir: &Path, attempt_id: &str) -> Result<State> {
    let state = update(dir, |mut state| {
        if !attempt_matches(&state, attempt_id) {
            return state;
        }
        let now = Utc::now();
        if let Some(attempt) = state.attempt.take() {
            let header = header_owned(attempt);
            state.attempt = Some(Attempt::Success { header, ended_at: now });
        }
        state.result = ResultState::Success { created_at: now };
        state
    })?;
    info!(dir = %dir.display(), "attempt finished: success");
    append_event(dir, json!({"type": "attempt_finished", "status": "success"}));
    Ok(state)
}

/// Finish the current attempt as `failed`, with a structured error payload.
/// No-ops (returns the unchanged state) if `attempt_id` doesn't match the
/// current attempt.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn finish_failed(dir: &Path, attempt_id: &str, error: AttemptError) -> Result<State> {
    let state = update(dir, |mut state| {
        if !attempt_matches(&state, attempt_id) {
            return state;
        }
        let now = Utc::now();
        if let Some(attempt) = state.attempt.take() {
            let header = header_owned(attempt);
            state.attempt = Some(Attempt::Failed {
                header,
                ended_at: now,
                error: error.clone(),
            });
        }
        state.result = ResultState::Failed;
        state
    })?;
    info!(dir = %dir.display(), error = ?error, "attempt finished: failed");
    append_event(dir, json!({"type": "attempt_finished", "status": "failed", "error": error}));
    Ok(state)
}

/// Finish the current attempt with a non-`failed` terminal status
/// (`cancelled`/`preempted`/`crashed`). `result` becomes `incomplete`,
/// leaving any prior sticky result untouched only if it was already sticky.
/// No-ops (returns the unchanged state) if `attempt_id` doesn't match the
/// current attempt.
#[instrument(skip_all, fields(dir = %dir.display(), ?status))]
pub fn finish_terminal(
    dir: &Path,
    attempt_id: &str,
    status: kiln_types::TerminalStatus,
    reason: String,
    error: Option<AttemptError>,
) -> Result<State> {
    let state = update(dir, |mut state| {
        if !attempt_matches(&state, attempt_id) {
            return state;
        }
        let now = Utc::now();
        if let Some(attempt) = state.attempt.take() {
            let header = header_owned(attempt);
            state.attempt = Some(match status {
                kiln_types::TerminalStatus::Cancelled => Attempt::Cancelled {
                    header,
                    ended_at: now,
                    reason: reason.clone(),
                    error: error.clone(),
                },
                kiln_types::TerminalStatus::Preempted => Attempt::Preempted {
                    header,
                    ended_at: now,
                    reason: reason.clone(),
                    error: error.clone(),
                },
                kiln_types::TerminalStatus::Crashed => Attempt::Crashed {
                    header,
                    ended_at: now,
                    reason: reason.clone(),
                    error: error.clone(),
                },
            });
        }
        if !state.result.is_sticky() {
            state.result = ResultState::Incomplete;
        }
        state
    })?;
    info!(dir = %dir.display(), status = status.as_str(), reason, "attempt finished (terminal)");
    append_event(
        dir,
        json!({"type": "attempt_finished", "status": status.as_str(), "reason": reason}),
    );
    Ok(state)
}

fn header_owned(attempt: Attempt) -> AttemptHeader {
    match attempt {
        Attempt::Queued { header }
        | Attempt::Running { header }
        | Attempt::Success { header, .. }
        | Attempt::Failed { header, .. }
        | Attempt::Cancelled { header, .. }
        | Attempt::Preempted { header, .. }
        | Attempt::Crashed { header, .. } => header,
    }
}
