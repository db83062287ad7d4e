//! Remote-scheduler probe contract.
//!
//! Submitting work to a remote batch scheduler and polling its job queue are
//! out of scope here; this module only defines the seam the reconciler calls
//! through. A real adapter (e.g. for a specific cluster scheduler) implements
//! [`SchedulerProbe`] and is handed to [`crate::reconciler::reconcile`] by
//! the embedding application.

use std::path::Path;

use kiln_types::{AttemptHeader, SchedulerVerdict};

use crate::error::Result;

/// Asks a remote scheduler what it knows about an in-flight `remote`-backend attempt.
pub trait SchedulerProbe {
    /// Probe the scheduler about the attempt described by `header`, whose
    /// artifact directory is `dir`. Returning a [`SchedulerVerdict`] with no
    /// `terminal_status` and no extra fields means "scheduler has nothing
    /// new to say" — the reconciler then falls back to lease-expiry
    /// classification.
    fn probe(&self, dir: &Path, header: &AttemptHeader) -> Result<SchedulerVerdict>;
}

/// A probe that never has anything to report, for embedders with no remote
/// scheduler configured (`allow_missing_remote`).
pub struct NullProbe;

impl SchedulerProbe for NullProbe {
    fn probe(&self, _dir: &Path, _header: &AttemptHeader) -> Result<SchedulerVerdict> {
        Ok(SchedulerVerdict::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_types::{Backend, Owner};
    use tempfile::tempdir;

    #[test]
    fn null_probe_reports_nothing() {
        let td = tempdir().unwrap();
        let now = chrono::Utc::now();
        let header = AttemptHeader {
            id: "a".into(),
            number: 1,
            backend: Backend::Remote,
            started_at: now,
            heartbeat_at: now,
            lease_duration_sec: 60.0,
            lease_expires_at: now,
            owner: Owner {
                pid: 1,
                host: "h".into(),
                user: "u".into(),
                command: "c".into(),
            },
            scheduler: Default::default(),
        };
        let verdict = NullProbe.probe(td.path(), &header).unwrap();
        assert!(verdict.terminal_status.is_none());
    }
}
