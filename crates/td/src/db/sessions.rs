//! Session row operations.

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, SqliteConnection};
use td_core::{Result, Session};

use super::rows::{col, col_enum, col_time, map_db_err, to_millis};

const SELECT_COLS: &str = "id, branch, fingerprint, agent_kind, agent_pid, started_at, \
     last_activity, previous_session_id, name";

fn parse_session_row(row: &SqliteRow) -> Result<Session> {
    Ok(Session {
        id: col(row, "id")?,
        branch: col(row, "branch")?,
        fingerprint: col(row, "fingerprint")?,
        agent_kind: col_enum(row, "agent_kind")?,
        agent_pid: col::<Option<i64>>(row, "agent_pid")?.and_then(|p| p.try_into().ok()),
        started_at: col_time(row, "started_at")?,
        last_activity: col_time(row, "last_activity")?,
        previous_session_id: col(row, "previous_session_id")?,
        name: col(row, "name")?,
        is_new: false,
    })
}

/// Insert a session row.
///
/// # Errors
///
/// Returns `Error::Conflict` when the id already exists.
pub async fn insert(conn: &mut SqliteConnection, session: &Session) -> Result<()> {
    sqlx::query(
        "INSERT INTO sessions (id, branch, fingerprint, agent_kind, agent_pid, started_at, \
         last_activity, previous_session_id, name) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&session.id)
    .bind(&session.branch)
    .bind(&session.fingerprint)
    .bind(session.agent_kind.to_string())
    .bind(session.agent_pid.map(i64::from))
    .bind(to_millis(session.started_at))
    .bind(to_millis(session.last_activity))
    .bind(&session.previous_session_id)
    .bind(&session.name)
    .execute(conn)
    .await
    .map(|_| ())
    .map_err(|e| map_db_err(&format!("failed to insert session '{}'", session.id), &e))
}

/// Insert the row or overwrite it if present (sync apply path).
///
/// # Errors
///
/// Returns `Error::Database` on failure.
pub async fn upsert(conn: &mut SqliteConnection, session: &Session) -> Result<()> {
    if get(conn, &session.id).await?.is_some() {
        sqlx::query(
            "UPDATE sessions SET branch = ?, fingerprint = ?, agent_kind = ?, agent_pid = ?, \
             started_at = ?, last_activity = ?, previous_session_id = ?, name = ? WHERE id = ?",
        )
        .bind(&session.branch)
        .bind(&session.fingerprint)
        .bind(session.agent_kind.to_string())
        .bind(session.agent_pid.map(i64::from))
        .bind(to_millis(session.started_at))
        .bind(to_millis(session.last_activity))
        .bind(&session.previous_session_id)
        .bind(&session.name)
        .bind(&session.id)
        .execute(conn)
        .await
        .map(|_| ())
        .map_err(|e| map_db_err(&format!("failed to update session '{}'", session.id), &e))
    } else {
        insert(conn, session).await
    }
}

/// Fetch one session by id.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Option<Session>> {
    sqlx::query(&format!("SELECT {SELECT_COLS} FROM sessions WHERE id = ?"))
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(|e| map_db_err(&format!("failed to fetch session '{id}'"), &e))
        .and_then(|opt| opt.map(|row| parse_session_row(&row)).transpose())
}

/// Most recent session for a (branch, fingerprint) key.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn latest_for_key(
    conn: &mut SqliteConnection,
    branch: &str,
    fingerprint: &str,
) -> Result<Option<Session>> {
    sqlx::query(&format!(
        "SELECT {SELECT_COLS} FROM sessions WHERE branch = ? AND fingerprint = ? \
         ORDER BY last_activity DESC LIMIT 1"
    ))
    .bind(branch)
    .bind(fingerprint)
    .fetch_optional(conn)
    .await
    .map_err(|e| map_db_err("failed to fetch session for key", &e))
    .and_then(|opt| opt.map(|row| parse_session_row(&row)).transpose())
}

/// List all sessions, most recently active first.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<Session>> {
    let rows = sqlx::query(&format!(
        "SELECT {SELECT_COLS} FROM sessions ORDER BY last_activity DESC"
    ))
    .fetch_all(conn)
    .await
    .map_err(|e| map_db_err("failed to list sessions", &e))?;
    rows.iter().map(parse_session_row).collect()
}

/// Bump `last_activity` on a session.
///
/// # Errors
///
/// Returns `Error::Database` on failure.
pub async fn touch(conn: &mut SqliteConnection, id: &str, at: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE sessions SET last_activity = ? WHERE id = ?")
        .bind(to_millis(at))
        .bind(id)
        .execute(conn)
        .await
        .map(|_| ())
        .map_err(|e| map_db_err("failed to touch session", &e))
}

/// Assign a human-friendly name.
///
/// # Errors
///
/// Returns `Error::NotFound` when the id does not exist.
pub async fn set_name(conn: &mut SqliteConnection, id: &str, name: &str) -> Result<()> {
    let result = sqlx::query("UPDATE sessions SET name = ? WHERE id = ?")
        .bind(name)
        .bind(id)
        .execute(conn)
        .await
        .map_err(|e| map_db_err("failed to name session", &e))?;
    if result.rows_affected() == 0 {
        return Err(td_core::Error::not_found(format!("session '{id}'")));
    }
    Ok(())
}

/// Delete sessions idle since before `cutoff`, sparing `keep_id`. Action-log
/// attribution keeps the defunct ids as plain strings.
///
/// # Errors
///
/// Returns `Error::Database` on failure.
pub async fn delete_stale(
    conn: &mut SqliteConnection,
    cutoff: DateTime<Utc>,
    keep_id: &str,
) -> Result<u64> {
    sqlx::query("DELETE FROM sessions WHERE last_activity < ? AND id != ?")
        .bind(to_millis(cutoff))
        .bind(keep_id)
        .execute(conn)
        .await
        .map(|r| r.rows_affected())
        .map_err(|e| map_db_err("failed to delete stale sessions", &e))
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use td_core::{AgentKind, Fingerprint};

    use super::*;
    use crate::db::test_util::temp_store;

    fn fp(pid: u32) -> Fingerprint {
        Fingerprint::Process {
            agent: AgentKind::Claude,
            pid,
        }
    }

    #[test]
    fn test_insert_and_latest_for_key() {
        tokio_test::block_on(async {
            let (store, _dir) = temp_store().await;
            let mut conn = store.acquire().await.unwrap();

            let older = Session::create("main", &fp(1));
            insert(&mut conn, &older).await.unwrap();

            let mut newer = older.rotate_into("main", &fp(1));
            newer.last_activity = older.last_activity + Duration::minutes(5);
            insert(&mut conn, &newer).await.unwrap();

            let latest = latest_for_key(&mut conn, "main", &fp(1).as_key())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(latest.id, newer.id);
            assert_eq!(latest.previous_session_id.as_deref(), Some(older.id.as_str()));
        });
    }

    #[test]
    fn test_touch_updates_activity() {
        tokio_test::block_on(async {
            let (store, _dir) = temp_store().await;
            let mut conn = store.acquire().await.unwrap();

            let session = Session::create("main", &fp(1));
            insert(&mut conn, &session).await.unwrap();

            let later = session.last_activity + Duration::hours(1);
            touch(&mut conn, &session.id, later).await.unwrap();

            let loaded = get(&mut conn, &session.id).await.unwrap().unwrap();
            assert_eq!(loaded.last_activity.timestamp_millis(), later.timestamp_millis());
        });
    }

    #[test]
    fn test_set_name() {
        tokio_test::block_on(async {
            let (store, _dir) = temp_store().await;
            let mut conn = store.acquire().await.unwrap();

            let session = Session::create("main", &fp(1));
            insert(&mut conn, &session).await.unwrap();
            set_name(&mut conn, &session.id, "pairing with alex").await.unwrap();

            let loaded = get(&mut conn, &session.id).await.unwrap().unwrap();
            assert_eq!(loaded.name.as_deref(), Some("pairing with alex"));

            let missing = set_name(&mut conn, "ses_missing", "x").await;
            assert!(matches!(missing, Err(td_core::Error::NotFound(_))));
        });
    }

    #[test]
    fn test_delete_stale_spares_current() {
        tokio_test::block_on(async {
            let (store, _dir) = temp_store().await;
            let mut conn = store.acquire().await.unwrap();

            let mut stale = Session::create("main", &fp(1));
            stale.last_activity = Utc::now() - Duration::days(60);
            stale.started_at = stale.last_activity;
            insert(&mut conn, &stale).await.unwrap();

            let mut current = Session::create("main", &fp(2));
            current.last_activity = Utc::now() - Duration::days(60);
            insert(&mut conn, &current).await.unwrap();

            let cutoff = Utc::now() - Duration::days(30);
            let removed = delete_stale(&mut conn, cutoff, &current.id).await.unwrap();
            assert_eq!(removed, 1);
            assert!(get(&mut conn, &stale.id).await.unwrap().is_none());
            assert!(get(&mut conn, &current.id).await.unwrap().is_some());
        });
    }
}
