//! Shared primitive types and clock helpers

use std::time::{SystemTime, UNIX_EPOCH};

/// Full configuration tree as exported by the authoritative store.
pub type ConfigTable = serde_json::Value;

/// Current unix time in whole seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current unix time as float seconds, the timestamp form used on the wire.
pub fn now_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
