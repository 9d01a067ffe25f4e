//! Shared wall-clock helpers.
//!
//! Records store instants as unix-epoch milliseconds so lock descriptors and
//! reputation timestamps compare without any calendar parsing.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Returns unix-epoch milliseconds for the current instant.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Age of an epoch-millisecond timestamp relative to `now_ms`, floored at zero.
pub fn age_of(created_ms: i64, now_ms: i64) -> Duration {
    Duration::from_millis(now_ms.saturating_sub(created_ms).max(0) as u64)
}

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
pub fn epoch_ms_to_z(ms: i64) -> String {
    format!("{}Z", ms.div_euclid(1000))
}
