//! Millisecond epoch timestamps used throughout the wire protocol.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as milliseconds since the Unix epoch.
///
/// Saturates to `i64::MAX` rather than panicking on a clock set absurdly far
/// in the future; never returns a negative value for a sane system clock.
pub fn now_millis() -> i64 {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(dur.as_millis()).unwrap_or(i64::MAX)
}
