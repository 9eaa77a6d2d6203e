//! Row parsing helpers shared by the entity operation modules.

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{sqlite::SqliteRow, Row};
use td_core::{Error, Result};

/// Convert a timestamp to the epoch-millisecond form stored on disk.
#[must_use]
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Convert stored epoch milliseconds back to a timestamp.
#[must_use]
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Read a required column.
///
/// # Errors
///
/// Returns `Error::Database` when the column is missing or mistyped.
pub fn col<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| Error::database(format!("failed to read column '{name}': {e}")))
}

/// Read a required timestamp column.
///
/// # Errors
///
/// Returns `Error::Database` when the column is missing or mistyped.
pub fn col_time(row: &SqliteRow, name: &str) -> Result<DateTime<Utc>> {
    col::<i64>(row, name).map(from_millis)
}

/// Read a nullable timestamp column.
///
/// # Errors
///
/// Returns `Error::Database` when the column is missing or mistyped.
pub fn col_time_opt(row: &SqliteRow, name: &str) -> Result<Option<DateTime<Utc>>> {
    col::<Option<i64>>(row, name).map(|v| v.map(from_millis))
}

/// Parse an enum column stored as its wire string.
///
/// # Errors
///
/// Returns `Error::Database` when the stored value is not a known variant.
pub fn col_enum<T>(row: &SqliteRow, name: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = col(row, name)?;
    raw.parse()
        .map_err(|e| Error::database(format!("invalid value '{raw}' in column '{name}': {e}")))
}

/// Parse a JSON column.
///
/// # Errors
///
/// Returns `Error::Database` on read failure, `Error::Parse` on bad JSON.
pub fn col_json<T: serde::de::DeserializeOwned>(row: &SqliteRow, name: &str) -> Result<T> {
    let raw: String = col(row, name)?;
    serde_json::from_str(&raw).map_err(Error::from)
}

/// Parse a nullable JSON column.
///
/// # Errors
///
/// Returns `Error::Database` on read failure, `Error::Parse` on bad JSON.
pub fn col_json_opt<T: serde::de::DeserializeOwned>(
    row: &SqliteRow,
    name: &str,
) -> Result<Option<T>> {
    let raw: Option<String> = col(row, name)?;
    raw.map(|s| serde_json::from_str(&s).map_err(Error::from))
        .transpose()
}

/// Map a sqlx error onto the store taxonomy: unique violations become
/// `Conflict`, everything else `Database`.
#[must_use]
pub fn map_db_err(context: &str, err: &sqlx::Error) -> Error {
    let text = err.to_string();
    if text.to_lowercase().contains("unique") {
        Error::Conflict(format!("{context}: {text}"))
    } else {
        Error::database(format!("{context}: {text}"))
    }
}
