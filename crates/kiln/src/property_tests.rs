//! Property-based tests for kiln's core invariants:
//! - at-most-one-active attempt per directory
//! - attempt-number monotonicity across restarts
//! - fingerprint stability under key reordering and serialize/deserialize round-trips

use proptest::prelude::*;

use crate::fingerprint::fingerprint;
use crate::state_store;
use kiln_types::Backend;
use std::time::Duration;

fn json_object_strategy() -> impl Strategy<Value = serde_json::Value> {
    prop::collection::btree_map("[a-z][a-z0-9_]{0,9}", 0i64..1000, 0..6)
        .prop_map(|map| serde_json::to_value(map).unwrap())
}

proptest! {
    /// Property 10: fingerprint is stable across key insertion order and a
    /// serialize/deserialize round-trip.
    #[test]
    fn fingerprint_stable_under_round_trip(value in json_object_strategy()) {
        let serialized = serde_json::to_string(&value).unwrap();
        let roundtripped: serde_json::Value = serde_json::from_str(&serialized).unwrap();
        prop_assert_eq!(fingerprint(&value), fingerprint(&roundtripped));
    }

    /// Property 10 (continued): shuffling object key insertion order never
    /// changes the fingerprint, since canonicalization sorts keys.
    #[test]
    fn fingerprint_ignores_key_insertion_order(
        pairs in prop::collection::vec(("[a-z][a-z0-9_]{0,9}", 0i64..1000), 0..6)
    ) {
        let mut forward = serde_json::Map::new();
        for (k, v) in &pairs {
            forward.insert(k.clone(), serde_json::json!(v));
        }
        let mut reversed = serde_json::Map::new();
        for (k, v) in pairs.iter().rev() {
            reversed.insert(k.clone(), serde_json::json!(v));
        }
        prop_assert_eq!(
            fingerprint(&serde_json::Value::Object(forward)),
            fingerprint(&serde_json::Value::Object(reversed))
        );
    }

    /// Property 1/2: starting successive attempts on one directory always
    /// strictly increments the attempt number, and the directory never has
    /// more than one `Attempt` record active (queued or running) at a time.
    #[test]
    fn attempt_number_strictly_increases_across_restarts(restarts in 1usize..6) {
        let td = tempfile::tempdir().unwrap();
        let mut last_number = 0u64;
        for _ in 0..restarts {
            let state = state_store::start_queued(
                td.path(),
                Backend::Local,
                Duration::from_secs(60),
                "cmd".to_string(),
            ).unwrap();
            let number = state.attempt.as_ref().unwrap().header().number;
            prop_assert!(number > last_number);
            last_number = number;

            prop_assert!(state.attempt.as_ref().unwrap().is_active());
            let id = state.attempt.as_ref().unwrap().id().to_string();

            state_store::finish_terminal(
                td.path(),
                &id,
                kiln_types::TerminalStatus::Crashed,
                "pid_dead".to_string(),
                None,
            ).unwrap();
        }
    }
}
