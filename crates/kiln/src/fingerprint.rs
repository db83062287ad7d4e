//! Deterministic content address for a configuration object.
//!
//! A fingerprint is a canonical JSON encoding of a value, hashed with SHA-256
//! and truncated to 20 hex characters. The canonical form sorts object keys
//! and drops insignificant whitespace so the same logical configuration
//! produces the same hash regardless of field insertion order or which
//! process or language built it.
//!
//! Canonicalization of configuration *objects* (dropping `_`-prefixed
//! private fields, normalizing timestamps, substituting byte buffers with
//! their own digest) is the caller's responsibility: this module only
//! canonicalizes and hashes a `serde_json::Value` that the caller already
//! shaped that way. Keeping that step out-of-crate matches the core spec's
//! treatment of configuration introspection as an external interface (see
//! `scheduler.rs` for the analogous seam on the remote-scheduler side).

use serde_json::Value;
use sha2::{Digest, Sha256};

const FINGERPRINT_HEX_LEN: usize = 20;

/// Render `value` as canonical JSON: object keys sorted, no insignificant
/// whitespace, array order preserved.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string keys always serialize"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Hash `value`'s canonical form with SHA-256, truncated to 20 lowercase hex chars.
pub fn fingerprint(value: &Value) -> String {
    let canonical = canonicalize(value);
    let digest = Sha256::digest(canonical.as_bytes());
    let hex = hex_encode(&digest);
    hex[..FINGERPRINT_HEX_LEN].to_string()
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}
