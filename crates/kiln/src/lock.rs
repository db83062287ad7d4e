//! Named wiring of [`kiln_lock`] onto the three locks an artifact directory uses.
//!
//! `.state.lock` serializes reads/writes of `state.json` itself (held only
//! for the duration of a single read-modify-write, never across a compute);
//! `.compute.lock` is held for the lifetime of a running attempt and is what
//! `compute_lock::run` wraps; `.submit.lock` guards handoff to a remote
//! scheduler so two callers can't both submit the same directory.

use std::path::Path;
use std::time::Duration;

use kiln_lock::LockHandle;

use crate::error::{KilnError, Result};
use crate::paths::{compute_lock_path, state_lock_path, submit_lock_path};

fn wrap<T>(dir: &Path, name: &'static str, result: anyhow::Result<T>) -> Result<T> {
    result.map_err(|source| KilnError::Io {
        path: dir.to_path_buf(),
        source: std::io::Error::other(format!("{name} lock: {source}")),
    })
}

/// Acquire `.state.lock`, reclaiming a dead-pid or stale holder, up to `timeout`.
pub fn acquire_state_lock(dir: &Path, timeout: Duration, stale_after: Duration) -> Result<LockHandle> {
    let path = state_lock_path(dir);
    wrap(dir, "state", kiln_lock::acquire_blocking(&path, timeout, stale_after))
}

/// Try to acquire `.compute.lock` without blocking; `None` means another
/// attempt already holds it.
pub fn try_acquire_compute_lock(dir: &Path) -> Result<Option<LockHandle>> {
    let path = compute_lock_path(dir);
    wrap(dir, "compute", kiln_lock::try_acquire(&path))
}

/// Acquire `.compute.lock`, reclaiming a dead-pid or stale holder, up to `timeout`.
pub fn acquire_compute_lock(dir: &Path, timeout: Duration, stale_after: Duration) -> Result<LockHandle> {
    let path = compute_lock_path(dir);
    wrap(dir, "compute", kiln_lock::acquire_blocking(&path, timeout, stale_after))
}

/// Try to acquire `.submit.lock` without blocking.
pub fn try_acquire_submit_lock(dir: &Path) -> Result<Option<LockHandle>> {
    let path = submit_lock_path(dir);
    wrap(dir, "submit", kiln_lock::try_acquire(&path))
}

/// Whether `.compute.lock` is currently held by a live process on this host.
pub fn compute_lock_is_live(dir: &Path) -> bool {
    let path = compute_lock_path(dir);
    if !path.exists() {
        return false;
    }
    match kiln_lock::read_lock_info(&path) {
        Some(info) => crate::reconciler::pid_alive_on_this_host_generic(&info.host, info.pid),
        None => true,
    }
}
