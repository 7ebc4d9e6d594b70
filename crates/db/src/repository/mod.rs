//! Repository functions: one function per database operation.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! Reads go to `pool.reader`; writes go to `pool.writer`, inside a
//! transaction whenever the write depends on the current row state.

pub mod executions;
pub mod tasks;
pub mod workflows;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::DbError;

// ---------------------------------------------------------------------------
// Column codecs shared by the repositories
// ---------------------------------------------------------------------------

/// Current time at the precision the columns store.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so lexical order in SQL equals chronological order.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::Corrupt(format!("invalid datetime '{s}': {e}")))
}

pub(crate) fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DbError> {
    s.as_deref().map(parse_datetime).transpose()
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, DbError> {
    s.parse::<Uuid>()
        .map_err(|e| DbError::Corrupt(format!("invalid UUID '{s}': {e}")))
}

pub(crate) fn parse_status<T>(s: &str) -> Result<T, DbError>
where
    T: std::str::FromStr<Err = String>,
{
    s.parse::<T>().map_err(DbError::Corrupt)
}

pub(crate) fn parse_map(s: &str) -> Result<Map<String, Value>, DbError> {
    match serde_json::from_str::<Value>(s)? {
        Value::Object(map) => Ok(map),
        other => Err(DbError::Corrupt(format!("expected JSON object, found {other}"))),
    }
}

pub(crate) fn to_json(map: &Map<String, Value>) -> Result<String, DbError> {
    Ok(serde_json::to_string(map)?)
}

pub(crate) fn to_u32(value: i64, column: &str) -> Result<u32, DbError> {
    u32::try_from(value).map_err(|_| DbError::Corrupt(format!("{column} out of range: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatted_datetimes_sort_chronologically() {
        let earlier = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let later = earlier + chrono::Duration::microseconds(1500);
        let (a, b) = (format_datetime(&earlier), format_datetime(&later));
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_datetime(&b).unwrap(), later);
    }

    #[test]
    fn parse_map_rejects_non_objects() {
        assert!(parse_map("{\"a\":1}").is_ok());
        assert!(matches!(parse_map("[1,2]"), Err(DbError::Corrupt(_))));
    }
}
