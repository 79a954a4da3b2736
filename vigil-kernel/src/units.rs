//! Unit conversion and formatting helpers for the report pipeline.

use serde::{Deserialize, Serialize};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Round to 2 decimal places, half away from zero (matches the reporter
/// wire format, which truncates with `toFixed(2)` semantics).
pub fn round2(n: f64) -> f64 {
    (n * 100.0).round() / 100.0
}

pub fn bytes_to_gib(bytes: f64) -> f64 {
    round2(bytes / GIB)
}

/// Bytes/sec to megabits/sec, rounded to 2 decimals.
pub fn bytes_per_sec_to_mbps(bytes_per_sec: f64) -> f64 {
    round2(bytes_per_sec * 8.0 / 1e6)
}

/// Uptime broken into whole days/hours/minutes/seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationParts {
    pub d: i64,
    pub h: i64,
    pub m: i64,
    pub s: i64,
}

/// Format a seconds count as `{d,h,m,s}`.
///
/// Returns `None` for zero and non-finite input: a machine reporting
/// exactly 0 uptime is treated as having no uptime data at all.
pub fn format_duration(seconds: f64) -> Option<DurationParts> {
    if seconds == 0.0 || !seconds.is_finite() {
        return None;
    }
    let whole = seconds as i64;
    Some(DurationParts {
        d: whole / 86_400,
        h: (whole / 3_600) % 24,
        m: (whole / 60) % 60,
        s: whole % 60,
    })
}
