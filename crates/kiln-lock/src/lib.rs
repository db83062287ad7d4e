//! Exclusive-create file locks with self-describing payload and staleness detection.
//!
//! A lock is an `O_CREAT | O_EXCL` file whose contents are a single JSON line
//! identifying the holder. This crate is the generic primitive; `kiln` wires
//! it to the three named locks a coordination directory uses
//! (`.state.lock`, `.compute.lock`, `.submit.lock`).

use std::fs::{self, File, OpenOptions};
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

/// Payload written into a lock file, identifying its holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub host: String,
    pub created_at: DateTime<Utc>,
    pub lock_id: String,
}

impl LockInfo {
    fn for_here() -> Self {
        Self {
            pid: std::process::id(),
            host: gethostname::gethostname().to_string_lossy().into_owned(),
            created_at: Utc::now(),
            lock_id: new_lock_id(),
        }
    }
}

fn new_lock_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{nanos:032x}")
}

/// A held lock. Unlinks the lock file on drop (best-effort).
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    released: bool,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close and unlink the lock file. Idempotent; errors are swallowed.
    pub fn release(mut self) {
        self.release_mut();
    }

    fn release_mut(&mut self) {
        if self.released {
            return;
        }
        let _ = fs::remove_file(&self.path);
        self.released = true;
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release_mut();
    }
}

/// Attempt an exclusive-create of `path`. Returns `None` if the file already exists.
pub fn try_acquire(path: &Path) -> Result<Option<LockHandle>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create lock parent dir {}", parent.display()))?;
    }

    let mut opts = OpenOptions::new();
    opts.create_new(true).write(true);
    #[cfg(unix)]
    opts.mode(0o644);

    let mut file = match opts.open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to create lock file {}", path.display()));
        }
    };

    let info = LockInfo::for_here();
    let line = serde_json::to_string(&info).context("failed to serialize lock info")?;
    writeln!(file, "{line}").with_context(|| format!("failed to write lock file {}", path.display()))?;

    Ok(Some(LockHandle {
        path: path.to_path_buf(),
        released: false,
    }))
}

/// Read the payload of a lock file, tolerating malformed contents by returning `None`.
pub fn read_lock_info(path: &Path) -> Option<LockInfo> {
    let mut content = String::new();
    File::open(path).ok()?.read_to_string(&mut content).ok()?;
    let first_line = content.lines().next()?;
    serde_json::from_str(first_line).ok()
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // kill(pid, 0) checks existence/permission without sending a signal.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

/// Loop on [`try_acquire`], reclaiming a stale lock (dead owning pid on this
/// host, or mtime older than `stale_after`) until `timeout` elapses.
pub fn acquire_blocking(path: &Path, timeout: Duration, stale_after: Duration) -> Result<LockHandle> {
    let deadline = Instant::now() + timeout;
    let this_host = gethostname::gethostname().to_string_lossy().into_owned();

    loop {
        if let Some(handle) = try_acquire(path)? {
            return Ok(handle);
        }

        let mut reclaim = false;
        if let Some(info) = read_lock_info(path) {
            if info.host == this_host && !pid_alive(info.pid) {
                reclaim = true;
            }
        }
        if !reclaim {
            if let Ok(meta) = fs::metadata(path) {
                if let Ok(modified) = meta.modified() {
                    if modified.elapsed().unwrap_or_default() > stale_after {
                        reclaim = true;
                    }
                }
            }
        }

        if reclaim {
            let _ = fs::remove_file(path);
            continue;
        }

        if Instant::now() >= deadline {
            anyhow::bail!("timeout acquiring lock: {}", path.display());
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
