//! Timestamp utilities

use chrono::{DateTime, Utc};

/// Minute-granularity stamp used when naming stored artifacts (`YYYYMMDD-HHMM`)
pub fn minute_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d-%H%M").to_string()
}

/// Parse an RFC 3339 column value back into UTC
pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
