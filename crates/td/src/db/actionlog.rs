//! The append-only action log.
//!
//! One row per mutation. Client action ids are assigned here as
//! `max(id) + 1` inside the caller's write transaction, which keeps them
//! dense and strictly increasing regardless of rollbacks.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, SqliteConnection};
use td_core::{ActionKind, ActionLogEntry, EntityKind, Result};

use super::rows::{col, col_enum, col_time, col_time_opt, map_db_err, to_millis};

fn parse_entry_row(row: &SqliteRow) -> Result<ActionLogEntry> {
    let previous_data: Option<String> = col(row, "previous_data")?;
    let new_data: Option<String> = col(row, "new_data")?;
    Ok(ActionLogEntry {
        id: col(row, "id")?,
        session_id: col(row, "session_id")?,
        action: col_enum(row, "action_type")?,
        entity: EntityKind::parse(&col::<String>(row, "entity_type")?),
        entity_id: col(row, "entity_id")?,
        previous_data: previous_data
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
        new_data: new_data.map(|s| serde_json::from_str(&s)).transpose()?,
        timestamp: col_time(row, "timestamp")?,
        undone: col::<i64>(row, "undone")? != 0,
        synced_at: col_time_opt(row, "synced_at")?,
    })
}

/// Append an entry, returning the newly assigned client action id.
///
/// Must run inside the same transaction as the entity write it journals.
///
/// # Errors
///
/// Returns `Error::Database` on failure.
pub async fn append(
    conn: &mut SqliteConnection,
    session_id: &str,
    action: ActionKind,
    entity: &EntityKind,
    entity_id: &str,
    previous_data: Option<&Value>,
    new_data: Option<&Value>,
    timestamp: DateTime<Utc>,
) -> Result<i64> {
    let (next_id,): (i64,) =
        sqlx::query_as("SELECT COALESCE(MAX(id), 0) + 1 FROM action_log")
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_db_err("failed to assign client action id", &e))?;

    sqlx::query(
        "INSERT INTO action_log (id, session_id, action_type, entity_type, entity_id, \
         previous_data, new_data, timestamp, undone, synced_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, NULL)",
    )
    .bind(next_id)
    .bind(session_id)
    .bind(action.to_string())
    .bind(entity.as_str())
    .bind(entity_id)
    .bind(previous_data.map(Value::to_string))
    .bind(new_data.map(Value::to_string))
    .bind(to_millis(timestamp))
    .execute(conn)
    .await
    .map_err(|e| map_db_err("failed to append action log entry", &e))?;

    Ok(next_id)
}

/// Unsynced, non-undone entries whose entity type passes `validator`, in
/// ascending client-action-id order.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn pending_events(
    conn: &mut SqliteConnection,
    validator: impl Fn(&EntityKind) -> bool,
) -> Result<Vec<ActionLogEntry>> {
    let rows = sqlx::query(
        "SELECT id, session_id, action_type, entity_type, entity_id, previous_data, \
         new_data, timestamp, undone, synced_at \
         FROM action_log WHERE synced_at IS NULL AND undone = 0 ORDER BY id",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_db_err("failed to list pending entries", &e))?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in &rows {
        let entry = parse_entry_row(row)?;
        if validator(&entry.entity) {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// Count of unsynced, non-undone entries (validator-independent).
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn pending_count(conn: &mut SqliteConnection) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM action_log WHERE synced_at IS NULL AND undone = 0",
    )
    .fetch_one(conn)
    .await
    .map_err(|e| map_db_err("failed to count pending entries", &e))?;
    Ok(count)
}

/// Count of entries that have been acknowledged by a server.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn synced_count(conn: &mut SqliteConnection) -> Result<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM action_log WHERE synced_at IS NOT NULL")
            .fetch_one(conn)
            .await
            .map_err(|e| map_db_err("failed to count synced entries", &e))?;
    Ok(count)
}

/// Flip `synced_at` for the acknowledged `(client_action_id, server_seq)`
/// pairs. Only the acknowledged subset is marked; call inside the same
/// transaction that records the acks.
///
/// # Errors
///
/// Returns `Error::Database` on failure.
pub async fn mark_synced(
    conn: &mut SqliteConnection,
    acks: &[(i64, i64)],
    at: DateTime<Utc>,
) -> Result<()> {
    for (client_action_id, _server_seq) in acks {
        sqlx::query("UPDATE action_log SET synced_at = ? WHERE id = ?")
            .bind(to_millis(at))
            .bind(client_action_id)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_db_err("failed to mark entry synced", &e))?;
    }
    Ok(())
}

/// Clear every sync acknowledgement so a re-link replays the full journal.
///
/// # Errors
///
/// Returns `Error::Database` on failure.
pub async fn reset_sync_marks(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("UPDATE action_log SET synced_at = NULL")
        .execute(conn)
        .await
        .map(|_| ())
        .map_err(|e| map_db_err("failed to reset sync marks", &e))
}

/// Mark one entry undone so sync skips it.
///
/// # Errors
///
/// Returns `Error::NotFound` when the id does not exist.
pub async fn mark_undone(conn: &mut SqliteConnection, id: i64) -> Result<()> {
    let result = sqlx::query("UPDATE action_log SET undone = 1 WHERE id = ?")
        .bind(id)
        .execute(conn)
        .await
        .map_err(|e| map_db_err("failed to mark entry undone", &e))?;
    if result.rows_affected() == 0 {
        return Err(td_core::Error::not_found(format!("action log entry {id}")));
    }
    Ok(())
}
