//! Shared timestamp/identifier helpers.
//!
//! Timestamps are unix-epoch seconds rendered with a `Z` suffix
//! (e.g. `1771220592Z`) so they sort lexically within the same digit count
//! and parse back without a date library.

use serde_json::Value as JsonValue;
use ulid::Ulid;

/// Current unix-epoch seconds.
pub fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns unix-epoch seconds with `Z` suffix.
pub fn now_epoch_z() -> String {
    epoch_z(now_secs())
}

pub fn epoch_z(secs: u64) -> String {
    format!("{}Z", secs)
}

/// Parses an `NNNZ` timestamp back to seconds.
pub fn epoch_secs(ts: &str) -> Option<u64> {
    ts.trim_end_matches('Z').parse::<u64>().ok()
}

pub fn new_run_id() -> String {
    Ulid::new().to_string()
}

/// Standard command response envelope shape used by `--format json` surfaces.
pub fn command_envelope(cmd: &str, status: &str, extra: JsonValue) -> JsonValue {
    let mut base = serde_json::json!({
        "envelope_version": "1.0.0",
        "ts": now_epoch_z(),
        "cmd": cmd,
        "status": status
    });
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
    base
}
