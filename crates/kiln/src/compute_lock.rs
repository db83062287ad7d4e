//! Scoped compute-lock acquisition: lock + attempt bookkeeping + heartbeat +
//! signal handling, fused into one call the way `_run_locally` does in the
//! original implementation.
//!
//! [`run`] is the only entry point. It loops waiting for the compute lock
//! (reconciling and re-checking terminal state each iteration, so a
//! concurrent holder's crash is noticed promptly rather than only after its
//! lease expires), then once held: writes `metadata.json`, transitions the
//! attempt `queued -> running`, starts a heartbeat thread, installs
//! SIGTERM/SIGINT handling for the duration of the compute, runs the
//! caller's closure, and finalizes the attempt on every exit path —
//! including a signal, which exits the process after recording `preempted`
//! rather than returning.

use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use kiln_types::{AttemptError, Backend, State, TerminalStatus};
use tracing::{debug, error, info, instrument};

use crate::config::Config;
use crate::error::{KilnError, LockNotAcquiredCause, Result};
use crate::lock;
use crate::paths::metadata_path;
use crate::reconciler::reconcile;
use crate::scheduler::SchedulerProbe;
use crate::state_store;

/// Runs `compute` under the artifact directory's compute lock, handling the
/// full queued -> running -> terminal lifecycle. Returns the final [`State`]
/// on success or a sticky prior failure (if `retry_failed` is false);
/// returns `Err` for everything else, including the compute closure's own
/// failure (after it has been durably recorded as `failed`).
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn run(
    dir: &Path,
    config: &Config,
    probe: Option<&dyn SchedulerProbe>,
    command: String,
    compute: impl FnOnce() -> std::result::Result<(), AttemptError>,
) -> Result<State> {
    let deadline = Instant::now() + config.max_wait;

    loop {
        let state = reconcile(dir, config, probe)?;

        if state.result.is_success() {
            return Ok(state);
        }
        if state.result == kiln_types::ResultState::Failed && !config.retry_failed {
            return Err(KilnError::LockNotAcquired {
                cause: LockNotAcquiredCause::Failed,
            });
        }

        match lock::try_acquire_compute_lock(dir)? {
            Some(handle) => return run_holding_lock(dir, config, command, compute, handle),
            None => {
                if Instant::now() >= deadline {
                    return Err(KilnError::WaitTimeout {
                        directory: dir.to_path_buf(),
                        waited_secs: config.max_wait.as_secs_f64(),
                        hint: "another process held the compute lock for the entire wait",
                    });
                }
                thread::sleep(config.poll_interval);
            }
        }
    }
}

fn run_holding_lock(
    dir: &Path,
    config: &Config,
    command: String,
    compute: impl FnOnce() -> std::result::Result<(), AttemptError>,
    lock_handle: kiln_lock::LockHandle,
) -> Result<State> {
    if let Err(e) = write_metadata(dir, config) {
        error!(dir = %dir.display(), error = %e, "failed to write metadata.json");
    }

    state_store::start_queued(dir, Backend::Local, config.lease_duration, command)?;
    state_store::start_running(dir)?;

    let attempt_id = state_store::read_state(dir)?
        .attempt
        .map(|a| a.id().to_string())
        .unwrap_or_default();

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let heartbeat_dir = dir.to_path_buf();
    let heartbeat_id = attempt_id.clone();
    let heartbeat_interval = config.heartbeat_interval;
    let lease_duration = config.lease_duration;
    let heartbeat_handle = thread::spawn(move || loop {
        match stop_rx.recv_timeout(heartbeat_interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if let Err(e) = state_store::heartbeat(&heartbeat_dir, &heartbeat_id, lease_duration) {
                    debug!(error = %e, "heartbeat write failed");
                }
            }
        }
    });

    #[cfg(unix)]
    let signal_guard = signal::install(dir.to_path_buf(), attempt_id.clone());

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(compute));

    #[cfg(unix)]
    signal::uninstall(signal_guard);

    let _ = stop_tx.send(());
    let _ = heartbeat_handle.join();

    match outcome {
        Ok(Ok(())) => {
            state_store::write_success_marker(dir)?;
            let state = state_store::finish_success(dir, &attempt_id)?;
            lock_handle.release();
            Ok(state)
        }
        Ok(Err(attempt_error)) => {
            state_store::finish_failed(dir, &attempt_id, attempt_error.clone())?;
            lock_handle.release();
            Err(KilnError::ComputeError {
                state_path: crate::paths::state_path(dir),
                original: Some(attempt_error),
            })
        }
        Err(panic) => {
            let attempt_error = AttemptError {
                kind: "panic".to_string(),
                message: panic_message(&*panic),
                traceback: None,
            };
            state_store::finish_terminal(
                dir,
                &attempt_id,
                TerminalStatus::Crashed,
                "panic".to_string(),
                Some(attempt_error.clone()),
            )?;
            lock_handle.release();
            info!(dir = %dir.display(), "compute panicked, recorded as crashed");
            Err(KilnError::ComputeError {
                state_path: crate::paths::state_path(dir),
                original: Some(attempt_error),
            })
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn write_metadata(dir: &Path, config: &Config) -> Result<()> {
    let env = kiln_environment::collect_environment();
    let git = if config.record_git {
        kiln_environment::collect_git_info(dir, kiln_environment::DiffPolicy::Include)
    } else {
        None
    };
    let mut value = serde_json::to_value(&env).unwrap_or_default();
    if let Some(git) = git {
        if let serde_json::Value::Object(map) = &mut value {
            map.insert("git".to_string(), serde_json::to_value(&git).unwrap_or_default());
        }
    }
    crate::paths::write_json_atomic(&metadata_path(dir), &value)
}

#[cfg(unix)]
mod signal {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use tracing::error;

    use crate::state_store;

    pub struct Guard {
        stop: Arc<AtomicBool>,
        join: Option<std::thread::JoinHandle<()>>,
    }

    /// Spawn a thread blocking on SIGTERM/SIGINT. On delivery, records the
    /// attempt as `preempted` and exits the process immediately with the
    /// conventional shell exit code (143 for SIGTERM, 130 for SIGINT) — it
    /// never returns control to the caller, matching the one-mutation,
    /// no-further-locking constraint on signal handling.
    pub fn install(dir: PathBuf, attempt_id: String) -> Guard {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();

        let mut signals = match Signals::new([SIGTERM, SIGINT]) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install signal handlers");
                return Guard { stop, join: None };
            }
        };

        let join = std::thread::spawn(move || {
            for signal in signals.forever() {
                if stop_clone.load(Ordering::SeqCst) {
                    return;
                }
                let (reason, code) = match signal {
                    SIGTERM => ("sigterm", 143),
                    SIGINT => ("sigint", 130),
                    _ => ("signal", 1),
                };
                let _ = state_store::finish_terminal(
                    &dir,
                    &attempt_id,
                    kiln_types::TerminalStatus::Preempted,
                    reason.to_string(),
                    Some(kiln_types::AttemptError::signal(code)),
                );
                std::process::exit(code);
            }
        });

        Guard {
            stop,
            join: Some(join),
        }
    }

    pub fn uninstall(guard: Guard) {
        guard.stop.store(true, Ordering::SeqCst);
        // The signal-watcher thread blocks in `forever()` until a signal
        // arrives; we don't join it here since that would hang the common
        // case where no signal was ever delivered. It's a daemon thread for
        // the remaining process lifetime.
        drop(guard.join);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn run_succeeds_and_writes_success_marker() {
        let td = tempdir().unwrap();
        let config = Config {
            max_wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(50),
            lease_duration: Duration::from_secs(60),
            ..Config::default()
        };
        let state = run(td.path(), &config, None, "cmd".into(), || Ok(())).unwrap();
        assert!(state.result.is_success());
        assert!(state_store::success_marker_exists(td.path()));
    }

    #[test]
    fn run_records_failure_and_propagates_error() {
        let td = tempdir().unwrap();
        let config = Config {
            max_wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(50),
            lease_duration: Duration::from_secs(60),
            ..Config::default()
        };
        let err = run(td.path(), &config, None, "cmd".into(), || {
            Err(AttemptError {
                kind: "value_error".into(),
                message: "boom".into(),
                traceback: None,
            })
        })
        .unwrap_err();
        assert!(matches!(err, KilnError::ComputeError { .. }));

        let state = state_store::read_state(td.path()).unwrap();
        assert_eq!(state.result, kiln_types::ResultState::Failed);
    }

    #[test]
    fn run_short_circuits_on_existing_success() {
        let td = tempdir().unwrap();
        let config = Config {
            max_wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(50),
            lease_duration: Duration::from_secs(60),
            ..Config::default()
        };
        run(td.path(), &config, None, "cmd".into(), || Ok(())).unwrap();

        let mut calls = 0;
        let state = run(td.path(), &config, None, "cmd".into(), || {
            calls += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(calls, 0);
        assert!(state.result.is_success());
    }
}
