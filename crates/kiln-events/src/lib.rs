//! Append-only JSONL event journal for a kiln coordination directory.
//!
//! `events.jsonl` is observational only: correctness never depends on
//! reading it back. Every append is best-effort — callers log and swallow
//! failures rather than letting a journal write fail an otherwise-successful
//! state transition.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const EVENTS_FILE: &str = "events.jsonl";

pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// One journaled line: `{ts, pid, host, ...fields}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub ts: DateTime<Utc>,
    pub pid: u32,
    pub host: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Append one event to `events.jsonl` under `dir`, stamping `ts`/`pid`/`host`.
///
/// `event` must serialize to a JSON object; its keys are merged alongside the
/// stamped fields. Returns an error on I/O or serialization failure so the
/// caller can log it, but the error is never allowed to abort a state
/// transition that already succeeded.
pub fn append_event(dir: &Path, event: Value) -> Result<()> {
    let mut fields = match event {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    fields.remove("ts");
    fields.remove("pid");
    fields.remove("host");

    let entry = JournalEntry {
        ts: Utc::now(),
        pid: std::process::id(),
        host: gethostname::gethostname().to_string_lossy().into_owned(),
        fields,
    };

    let path = events_path(dir);
    let line = serde_json::to_string(&entry).context("failed to serialize event")?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open events file {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append to {}", path.display()))?;
    Ok(())
}

/// Read all journal entries. A missing file yields an empty vec. Malformed
/// lines are skipped rather than failing the whole read, matching the
/// journal's observational-only status.
pub fn read_events(dir: &Path) -> Result<Vec<JournalEntry>> {
    let path = events_path(dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = std::fs::File::open(&path)
        .with_context(|| format!("failed to open events file {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line.with_context(|| format!("failed to read line from {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str::<JournalEntry>(&line) {
            out.push(entry);
        }
    }
    Ok(out)
}
