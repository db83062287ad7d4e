//! Stress tests for concurrent compute-lock contention and lock-file cleanup.
//!
//! These exercise kiln's core concurrency guarantee under real threads
//! rather than mocked time: with many threads racing `get_or_create` on one
//! directory, exactly one runs the compute closure and every other thread
//! observes the resulting success.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::tempdir;

use crate::config::Config;
use crate::{get_or_create, lock, paths, state_store};

fn fast_config() -> Config {
    Config {
        max_wait: Duration::from_secs(10),
        poll_interval: Duration::from_millis(5),
        heartbeat_interval: Duration::from_millis(20),
        lease_duration: Duration::from_secs(30),
        ..Config::default()
    }
}

#[test]
fn only_one_thread_runs_compute_under_contention() {
    let td = tempdir().unwrap();
    let dir = Arc::new(td.path().to_path_buf());
    let runs = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let dir = dir.clone();
            let runs = runs.clone();
            let config = fast_config();
            thread::spawn(move || {
                get_or_create(&dir, &config, None, "stress".to_string(), || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(30));
                    Ok(())
                })
            })
        })
        .collect();

    for handle in handles {
        let state = handle.join().unwrap().unwrap();
        assert!(state.result.is_success());
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1, "compute closure ran more than once under contention");
}

#[test]
fn compute_lock_is_released_after_success_even_under_contention() {
    let td = tempdir().unwrap();
    let dir = td.path().to_path_buf();
    let config = fast_config();

    get_or_create(&dir, &config, None, "cmd".to_string(), || Ok(())).unwrap();

    assert!(!paths::compute_lock_path(&dir).exists());
    assert!(!lock::compute_lock_is_live(&dir));
}

#[test]
fn concurrent_heartbeats_never_corrupt_state_json() {
    let td = tempdir().unwrap();
    let dir = Arc::new(td.path().to_path_buf());

    state_store::start_queued(&dir, kiln_types::Backend::Local, Duration::from_secs(5), "cmd".into()).unwrap();
    let state = state_store::start_running(&dir).unwrap();
    let attempt_id = state.attempt.unwrap().id().to_string();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let dir = dir.clone();
            let attempt_id = attempt_id.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    state_store::heartbeat(&dir, &attempt_id, Duration::from_secs(5)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let final_state = state_store::read_state(&dir).unwrap();
    assert!(final_state.attempt.unwrap().is_running());
}
