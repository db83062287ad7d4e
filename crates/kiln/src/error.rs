//! Error kinds for the coordination core.
//!
//! Names describe meaning, not implementation: `CorruptState` is always
//! fatal and is never auto-repaired; `LockNotAcquired` signals a cache hit
//! or a sticky failure, not a bug; `WaitTimeout` and `ComputeError` carry
//! enough context to name the offending directory.

use std::path::PathBuf;

use kiln_types::AttemptError;
use thiserror::Error;

/// Why a caller failed to acquire the compute lock without waiting further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockNotAcquiredCause {
    /// The target already has `result = success`; treat as a cache hit.
    Success,
    /// The target has `result = failed` and retries are disabled.
    Failed,
}

#[derive(Debug, Error)]
pub enum KilnError {
    #[error("corrupt state at {path}: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    #[error("lock not acquired: {cause:?}")]
    LockNotAcquired { cause: LockNotAcquiredCause },

    #[error("timed out after {waited_secs:.1}s waiting for {directory} ({hint})")]
    WaitTimeout {
        directory: PathBuf,
        waited_secs: f64,
        hint: &'static str,
    },

    #[error("compute failed for {state_path}: {original:?}")]
    ComputeError {
        state_path: PathBuf,
        original: Option<AttemptError>,
    },

    #[error("migration error: {0}")]
    MigrationError(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, KilnError>;
