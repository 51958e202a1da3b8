//! Timestamp encoding for persisted job records.
//!
//! All timestamps are written as fixed-width RFC 3339 UTC strings with
//! microsecond precision, e.g. `2026-01-01T00:00:00.000000Z`. Because the width
//! never varies, lexicographic order on the strings equals chronological order,
//! which is what the retry-eligibility and FIFO queries rely on.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::DomainError;

/// Encode a timestamp in the canonical fixed-width form.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a timestamp written by [`format_timestamp`] (or any RFC 3339 string).
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, DomainError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DomainError::validation(format!("invalid timestamp '{s}': {e}")))
}

/// Truncate to the precision the store keeps, so in-memory and persisted
/// values compare equal.
pub fn truncate_to_micros(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(at.timestamp_micros()).unwrap_or(at)
}
