//! # kiln
//!
//! Per-artifact-directory coordination engine for a content-addressed
//! durable cache: one filesystem directory represents one computation,
//! identified by a fingerprint over its configuration. `kiln` answers "has
//! this already been computed, is someone else computing it right now, or
//! should I compute it myself" for that one directory, and makes the answer
//! crash-safe under concurrent local processes and (via the [`scheduler`]
//! probe seam) a remote batch scheduler.
//!
//! ## Composition
//!
//! - [`paths`] names the files under an artifact directory and provides the
//!   temp-then-rename atomic write every other module builds on.
//! - [`fingerprint`] turns a canonicalized configuration value into the
//!   20-hex-character content address that names a directory.
//! - [`lock`] wires the generic exclusive-create primitive in
//!   [`kiln_lock`] onto the three named locks (`.state.lock`,
//!   `.compute.lock`, `.submit.lock`).
//! - [`state_store`] owns `state.json` and the attempt-transition family,
//!   serialized through `.state.lock`.
//! - [`reconciler`] is a pure classifier: given the current state (and an
//!   optional [`scheduler::SchedulerProbe`]), decides whether an in-doubt
//!   attempt should terminalize.
//! - [`compute_lock`] is the scoped entry point: acquire-or-wait, run the
//!   caller's compute closure, and guarantee finalization on every exit path
//!   including a terminating signal.
//! - [`migration`] lets one directory alias, move from, or copy from
//!   another, with automatic alias detachment.
//!
//! [`config`] and [`environment`] are thin re-exports of their own crates,
//! kept as modules here so call sites read consistently alongside the rest.

pub mod compute_lock;
pub mod config;
pub mod environment;
pub mod error;
pub mod fingerprint;
pub mod lock;
pub mod migration;
pub mod paths;
pub mod reconciler;
pub mod scheduler;
pub mod state_store;

pub use error::{KilnError, LockNotAcquiredCause, Result};
pub use kiln_types::{
    Attempt, AttemptError, AttemptHeader, Backend, DirectoryRef, MigrationKind, MigrationPolicy,
    MigrationRecord, Owner, ProbeTerminal, ResultState, SchedulerVerdict, State, TerminalStatus,
    SCHEMA_VERSION,
};

use std::path::{Path, PathBuf};

use tracing::{info_span, instrument};

use crate::config::Config;
use crate::scheduler::SchedulerProbe;

/// Resolve `dir`'s effective directory for reads: if `dir` carries an active
/// (non-detached) alias record, returns the aliased-to source directory as
/// long as it is still `success`; otherwise detaches the alias and returns
/// `dir` itself.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn resolve_read_path(dir: &Path, alias_root: impl Fn(&kiln_types::DirectoryRef) -> PathBuf) -> Result<PathBuf> {
    let Some(record) = migration::read_migration(dir)? else {
        return Ok(dir.to_path_buf());
    };
    if !record.is_active_alias() {
        return Ok(dir.to_path_buf());
    }

    let source_dir = alias_root(&record.from);
    let source_state = state_store::read_state(&source_dir)?;
    if source_state.result.is_success() {
        Ok(source_dir)
    } else {
        migration::detach(dir, &source_dir, "alias source no longer success")?;
        Ok(dir.to_path_buf())
    }
}

/// Default `alias_root` resolver for [`resolve_read_path`]: a [`DirectoryRef`]
/// names its root, namespace, and hash exactly as [`paths::directory_for`]
/// expects them.
fn default_alias_root(r: &kiln_types::DirectoryRef) -> PathBuf {
    paths::directory_for(Path::new(&r.root), &r.namespace, &r.hash)
}

/// Resolve `dir`'s effective directory the way [`get_or_create`] needs it:
/// chase an active alias via [`resolve_read_path`], then, if `always_rerun`
/// names `command`, force a fresh compute by detaching the alias (if any)
/// and falling back to `dir` itself rather than the aliased-to source.
fn resolve_effective_dir(dir: &Path, config: &Config, command: &str) -> Result<PathBuf> {
    let effective = resolve_read_path(dir, default_alias_root)?;
    if effective != dir && config.always_rerun.matches(command) {
        migration::detach(dir, &effective, "always_rerun")?;
        return Ok(dir.to_path_buf());
    }
    Ok(effective)
}

/// The full `get_or_create(D)` control flow: resolve `D` through any active
/// alias, honor `always_rerun` by invalidating a cached success (or
/// detaching an alias) before it is ever returned, then return cached
/// success immediately, reconcile and wait out an active attempt, surface a
/// sticky failure, or acquire the compute lock and run `compute` — all
/// against the resolved effective directory, so aliasing is transparent to
/// the caller.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn get_or_create(
    dir: &Path,
    config: &Config,
    probe: Option<&dyn SchedulerProbe>,
    command: String,
    compute: impl FnOnce() -> std::result::Result<(), AttemptError>,
) -> Result<State> {
    let _span = info_span!("get_or_create", dir = %dir.display()).entered();

    let effective_dir = resolve_effective_dir(dir, config, &command)?;

    if state_store::success_marker_exists(&effective_dir) {
        if config.always_rerun.matches(&command) {
            state_store::invalidate_success(&effective_dir, "always_rerun enabled")?;
        } else {
            let state = state_store::read_state(&effective_dir)?;
            if state.result.is_success() {
                return Ok(state);
            }
        }
    }

    compute_lock::run(&effective_dir, config, probe, command, compute)
}

#[cfg(test)]
mod property_tests;
#[cfg(test)]
mod stress_tests;
