//! Sync bookkeeping rows: state singleton, conflict audit, history ring.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, SqliteConnection};
use td_core::{Error, Result};

use super::rows::{col, col_json_opt, col_time, col_time_opt, map_db_err, to_millis};

/// Bound on the sync history ring.
pub const HISTORY_CAP: i64 = 500;

// ═══════════════════════════════════════════════════════════════════════════
// SYNC STATE
// ═══════════════════════════════════════════════════════════════════════════

/// Singleton row tracking replication progress for the linked project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    /// Remote project this store replicates against.
    pub project_id: String,
    /// Highest client action id acknowledged by the server.
    pub last_pushed_action_id: i64,
    /// Watermark into the global event order.
    pub last_pulled_server_seq: i64,
    /// Completion time of the last successful push or pull.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Operator kill-switch; auto-sync refuses while set.
    pub sync_disabled: bool,
}

fn parse_state_row(row: &SqliteRow) -> Result<SyncState> {
    Ok(SyncState {
        project_id: col(row, "project_id")?,
        last_pushed_action_id: col(row, "last_pushed_action_id")?,
        last_pulled_server_seq: col(row, "last_pulled_server_seq")?,
        last_sync_at: col_time_opt(row, "last_sync_at")?,
        sync_disabled: col::<i64>(row, "sync_disabled")? != 0,
    })
}

/// Fetch the singleton, if the project is linked.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn get_state(conn: &mut SqliteConnection) -> Result<Option<SyncState>> {
    sqlx::query(
        "SELECT project_id, last_pushed_action_id, last_pulled_server_seq, last_sync_at, \
         sync_disabled FROM sync_state WHERE singleton = 1",
    )
    .fetch_optional(conn)
    .await
    .map_err(|e| map_db_err("failed to read sync state", &e))
    .and_then(|opt| opt.map(|row| parse_state_row(&row)).transpose())
}

/// Fetch the singleton or fail with `NotLinked`.
///
/// # Errors
///
/// Returns `Error::NotLinked` when absent.
pub async fn require_state(conn: &mut SqliteConnection) -> Result<SyncState> {
    get_state(conn).await?.ok_or(Error::NotLinked)
}

/// Insert or overwrite the singleton.
///
/// # Errors
///
/// Returns `Error::Database` on failure.
pub async fn put_state(conn: &mut SqliteConnection, state: &SyncState) -> Result<()> {
    sqlx::query(
        "INSERT INTO sync_state (singleton, project_id, last_pushed_action_id, \
         last_pulled_server_seq, last_sync_at, sync_disabled) VALUES (1, ?, ?, ?, ?, ?) \
         ON CONFLICT(singleton) DO UPDATE SET project_id = excluded.project_id, \
         last_pushed_action_id = excluded.last_pushed_action_id, \
         last_pulled_server_seq = excluded.last_pulled_server_seq, \
         last_sync_at = excluded.last_sync_at, sync_disabled = excluded.sync_disabled",
    )
    .bind(&state.project_id)
    .bind(state.last_pushed_action_id)
    .bind(state.last_pulled_server_seq)
    .bind(state.last_sync_at.map(to_millis))
    .bind(i64::from(state.sync_disabled))
    .execute(conn)
    .await
    .map(|_| ())
    .map_err(|e| map_db_err("failed to write sync state", &e))
}

/// Remove the singleton (unlink).
///
/// # Errors
///
/// Returns `Error::Database` on failure.
pub async fn clear_state(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("DELETE FROM sync_state")
        .execute(conn)
        .await
        .map(|_| ())
        .map_err(|e| map_db_err("failed to clear sync state", &e))
}

// ═══════════════════════════════════════════════════════════════════════════
// CONFLICTS
// ═══════════════════════════════════════════════════════════════════════════

/// Audit row for a last-writer-wins overwrite.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConflict {
    /// Entity table name.
    pub entity_type: String,
    /// Row identifier.
    pub entity_id: String,
    /// Sequence of the winning remote event.
    pub server_seq: i64,
    /// Local row as it was before the overwrite.
    pub local_data: Option<Value>,
    /// Remote payload that won.
    pub remote_data: Option<Value>,
    /// When the overwrite happened.
    pub overwritten_at: DateTime<Utc>,
}

/// Record one overwrite.
///
/// # Errors
///
/// Returns `Error::Database` on failure.
pub async fn insert_conflict(conn: &mut SqliteConnection, conflict: &SyncConflict) -> Result<()> {
    sqlx::query(
        "INSERT INTO sync_conflicts (entity_type, entity_id, server_seq, local_data, \
         remote_data, overwritten_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&conflict.entity_type)
    .bind(&conflict.entity_id)
    .bind(conflict.server_seq)
    .bind(conflict.local_data.as_ref().map(Value::to_string))
    .bind(conflict.remote_data.as_ref().map(Value::to_string))
    .bind(to_millis(conflict.overwritten_at))
    .execute(conn)
    .await
    .map(|_| ())
    .map_err(|e| map_db_err("failed to record sync conflict", &e))
}

/// List recorded overwrites, most recent first.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn list_conflicts(conn: &mut SqliteConnection) -> Result<Vec<SyncConflict>> {
    let rows = sqlx::query(
        "SELECT entity_type, entity_id, server_seq, local_data, remote_data, overwritten_at \
         FROM sync_conflicts ORDER BY id DESC",
    )
    .fetch_all(conn)
    .await
    .map_err(|e| map_db_err("failed to list sync conflicts", &e))?;

    rows.iter()
        .map(|row| {
            Ok(SyncConflict {
                entity_type: col(row, "entity_type")?,
                entity_id: col(row, "entity_id")?,
                server_seq: col(row, "server_seq")?,
                local_data: col_json_opt(row, "local_data")?,
                remote_data: col_json_opt(row, "remote_data")?,
                overwritten_at: col_time(row, "overwritten_at")?,
            })
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// HISTORY
// ═══════════════════════════════════════════════════════════════════════════

/// Direction of a replicated event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Local entry acknowledged by the server.
    Push,
    /// Remote event applied locally.
    Pull,
}

impl SyncDirection {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
        }
    }
}

/// One line in the bounded operational history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncHistoryEntry {
    /// Push or pull.
    pub direction: String,
    /// Action name.
    pub action_type: String,
    /// Entity table name.
    pub entity_type: String,
    /// Row identifier.
    pub entity_id: String,
    /// Global sequence of the event.
    pub server_seq: i64,
    /// Device the event originated from.
    pub device_id: String,
    /// When it was recorded here.
    pub timestamp: DateTime<Utc>,
}

/// Append one history line. Callers prune afterwards.
///
/// # Errors
///
/// Returns `Error::Database` on failure.
pub async fn append_history(
    conn: &mut SqliteConnection,
    direction: SyncDirection,
    action_type: &str,
    entity_type: &str,
    entity_id: &str,
    server_seq: i64,
    device_id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO sync_history (direction, action_type, entity_type, entity_id, \
         server_seq, device_id, timestamp) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(direction.as_str())
    .bind(action_type)
    .bind(entity_type)
    .bind(entity_id)
    .bind(server_seq)
    .bind(device_id)
    .bind(to_millis(at))
    .execute(conn)
    .await
    .map(|_| ())
    .map_err(|e| map_db_err("failed to append sync history", &e))
}

/// Drop history lines beyond [`HISTORY_CAP`], oldest first.
///
/// # Errors
///
/// Returns `Error::Database` on failure.
pub async fn prune_history(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(
        "DELETE FROM sync_history WHERE id NOT IN \
         (SELECT id FROM sync_history ORDER BY id DESC LIMIT ?)",
    )
    .bind(HISTORY_CAP)
    .execute(conn)
    .await
    .map(|_| ())
    .map_err(|e| map_db_err("failed to prune sync history", &e))
}

/// Most recent history lines, newest first.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn list_history(
    conn: &mut SqliteConnection,
    limit: i64,
) -> Result<Vec<SyncHistoryEntry>> {
    let rows = sqlx::query(
        "SELECT direction, action_type, entity_type, entity_id, server_seq, device_id, \
         timestamp FROM sync_history ORDER BY id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(conn)
    .await
    .map_err(|e| map_db_err("failed to list sync history", &e))?;

    rows.iter()
        .map(|row| {
            Ok(SyncHistoryEntry {
                direction: col(row, "direction")?,
                action_type: col(row, "action_type")?,
                entity_type: col(row, "entity_type")?,
                entity_id: col(row, "entity_id")?,
                server_seq: col(row, "server_seq")?,
                device_id: col(row, "device_id")?,
                timestamp: col_time(row, "timestamp")?,
            })
        })
        .collect()
}
