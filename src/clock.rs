//! Timestamp helpers for the merge clock.
//!
//! Stored timestamps arrive in several shapes: RFC 3339 with offset, naive
//! ISO-8601 without offset (treated as UTC), or epoch milliseconds. All of
//! them are parsed into `DateTime<Utc>` for comparison.

use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;

const NAIVE_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
];

/// Parse a stored timestamp value.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_str(s),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

fn parse_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// True for values the sanitation pass must replace: null, empty,
/// unparsable, or the Unix epoch itself.
pub fn needs_sanitizing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(v) => match parse_timestamp(v) {
            Some(ts) => ts.timestamp_millis() == 0,
            None => true,
        },
    }
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

pub fn now_string() -> String {
    format_timestamp(now())
}

/// A fresh `updated_at` that is strictly later than `previous`, even when
/// the previous value was written by a device whose clock runs ahead.
pub fn bump(previous: Option<&Value>) -> String {
    let now = now();
    let next = match previous.and_then(parse_timestamp) {
        Some(prev) if prev >= now => prev + Duration::milliseconds(1),
        _ => now,
    };
    format_timestamp(next)
}
