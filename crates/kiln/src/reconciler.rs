//! Pure decision procedure for resolving an in-doubt attempt.
//!
//! `reconcile` never runs the compute itself; it only classifies whatever
//! state is already on disk. The fast path promotes a `SUCCESS.json` marker
//! that a crashed writer left behind without having updated `state.json`.
//! Otherwise a `local` attempt is checked against local pid liveness and
//! lease expiry; a `remote` attempt is checked against a [`SchedulerProbe`],
//! falling back to lease expiry if the probe has nothing to say. Whenever
//! the outcome terminalizes (`crashed`, `cancelled`, `preempted`), the
//! now-orphaned `.compute.lock` is unlinked so a future caller doesn't wait
//! out its staleness window for nothing.

use std::path::Path;

use chrono::Utc;
use kiln_types::{Backend, Owner, ProbeTerminal, SchedulerVerdict, State, TerminalStatus};
use tracing::debug;

use crate::error::Result;
use crate::paths::compute_lock_path;
use crate::scheduler::SchedulerProbe;
use crate::state_store;

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

fn this_host() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// True if `owner` names a process alive on this host. Cross-host owners are
/// never declared dead locally — only the lease-expiry path can terminalize them.
pub(crate) fn pid_alive_on_this_host(owner: &Owner) -> bool {
    owner.host == this_host() && pid_alive(owner.pid)
}

/// Same check against a `kiln_lock::LockInfo` payload, used by `lock.rs`.
pub(crate) fn pid_alive_on_this_host_generic(host: &str, pid: u32) -> bool {
    host == this_host() && pid_alive(pid)
}

fn lease_expired(header: &kiln_types::AttemptHeader) -> bool {
    Utc::now() >= header.lease_expires_at
}

/// Reconcile the on-disk state of `dir`, returning the (possibly unchanged)
/// resulting state. `probe` is consulted only for `remote`-backend attempts;
/// pass `None` if no scheduler adapter is configured (remote attempts then
/// fall back to lease-expiry classification, per the `allow_missing_remote`
/// design note).
pub fn reconcile(dir: &Path, config: &crate::config::Config, probe: Option<&dyn SchedulerProbe>) -> Result<State> {
    let state = state_store::read_state(dir)?;

    if state_store::success_marker_exists(dir) && !state.result.is_success() {
        if let Some(attempt) = &state.attempt {
            debug!(dir = %dir.display(), "promoting orphaned success marker");
            let promoted = state_store::finish_success(dir, attempt.id())?;
            unlink_compute_lock(dir);
            return Ok(promoted);
        }
        return Ok(state);
    }

    let Some(attempt) = &state.attempt else {
        return Ok(state);
    };
    if !attempt.is_active() {
        return Ok(state);
    }

    let header = attempt.header();
    let outcome = match header.backend {
        Backend::Local => classify_local(header),
        Backend::Remote => classify_remote(dir, header, probe, config.cancelled_is_preempted)?,
    };

    let Some((status, reason)) = outcome else {
        return Ok(state);
    };

    debug!(dir = %dir.display(), status = status.as_str(), reason, "reconciler terminalizing attempt");
    let next = state_store::finish_terminal(dir, &header.id, status, reason, None)?;

    if matches!(
        status,
        TerminalStatus::Crashed | TerminalStatus::Cancelled | TerminalStatus::Preempted
    ) {
        unlink_compute_lock(dir);
    }

    Ok(next)
}

fn classify_local(header: &kiln_types::AttemptHeader) -> Option<(TerminalStatus, String)> {
    if !pid_alive_on_this_host(&header.owner) {
        return Some((TerminalStatus::Crashed, "pid_dead".to_string()));
    }
    if lease_expired(header) {
        return Some((TerminalStatus::Crashed, "lease_expired".to_string()));
    }
    None
}

fn classify_remote(
    dir: &Path,
    header: &kiln_types::AttemptHeader,
    probe: Option<&dyn SchedulerProbe>,
    cancelled_is_preempted: bool,
) -> Result<Option<(TerminalStatus, String)>> {
    let Some(probe) = probe else {
        return Ok(lease_expired(header).then(|| (TerminalStatus::Crashed, "lease_expired".to_string())));
    };

    let verdict: SchedulerVerdict = probe.probe(dir, header)?;
    if !verdict.extra.is_empty() || verdict.scheduler_state.is_some() {
        let mut fields = verdict.extra.clone();
        if let Some(scheduler_state) = &verdict.scheduler_state {
            fields.insert("scheduler_state".to_string(), serde_json::json!(scheduler_state));
        }
        state_store::set_scheduler_fields(dir, fields)?;
    }

    let Some(terminal) = verdict.terminal_status else {
        return Ok(lease_expired(header).then(|| (TerminalStatus::Crashed, "lease_expired".to_string())));
    };

    let reason = verdict.reason.unwrap_or_else(|| "scheduler_verdict".to_string());
    let outcome = match terminal {
        ProbeTerminal::Success if !state_store::success_marker_exists(dir) => {
            (TerminalStatus::Crashed, "success_without_marker".to_string())
        }
        ProbeTerminal::Success => return Ok(None),
        ProbeTerminal::Failed => {
            // A scheduler-reported failure is a real `failed` result, not a
            // terminal-status classification, so finalize it here directly.
            state_store::finish_failed(
                dir,
                &header.id,
                kiln_types::AttemptError {
                    kind: "scheduler_failed".to_string(),
                    message: reason,
                    traceback: None,
                },
            )?;
            return Ok(None);
        }
        ProbeTerminal::Cancelled if cancelled_is_preempted => (TerminalStatus::Preempted, reason),
        ProbeTerminal::Cancelled => (TerminalStatus::Cancelled, reason),
        ProbeTerminal::Preempted => (TerminalStatus::Preempted, reason),
        ProbeTerminal::Crashed => (TerminalStatus::Crashed, reason),
    };
    Ok(Some(outcome))
}

fn unlink_compute_lock(dir: &Path) {
    let _ = std::fs::remove_file(compute_lock_path(dir));
}
