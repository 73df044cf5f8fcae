// src/utils/clock.rs
//! Wall-clock helpers
//!
//! Timestamps are truncated to millisecond precision so that the in-memory
//! and SQLite repositories round-trip identical values.

use chrono::{DateTime, SubsecRound, TimeZone, Utc};

/// Current time at millisecond precision
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Convert milliseconds since epoch back to a timestamp
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_round_trip() {
        let t = now();
        assert_eq!(from_millis(t.timestamp_millis()), t);
    }
}
