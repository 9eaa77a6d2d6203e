//! Schema migrations.
//!
//! Migrations are values, not code: an ordered list of `(version, sql)`
//! applied idempotently inside one transaction per migration. The
//! `schema_migrations` table records what has run; re-opening a database is
//! always safe.

use sqlx::{Connection, SqliteConnection, SqlitePool};
use td_core::{Error, Result};

/// Ordered schema migrations. Append only; never edit a shipped entry.
pub const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r"
CREATE TABLE issues (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    acceptance_criteria TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL CHECK(status IN ('open','in_progress','blocked','in_review','closed')),
    issue_type TEXT NOT NULL CHECK(issue_type IN ('bug','feature','task','epic','chore')),
    priority TEXT NOT NULL CHECK(priority IN ('p0','p1','p2','p3','p4')),
    points INTEGER NOT NULL DEFAULT 0,
    labels TEXT NOT NULL DEFAULT '[]',
    parent_id TEXT,
    creator_session TEXT NOT NULL,
    implementer_session TEXT,
    reviewer_session TEXT,
    minor INTEGER NOT NULL DEFAULT 0,
    created_branch TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    closed_at INTEGER,
    deleted_at INTEGER
);
CREATE INDEX idx_issues_status ON issues(status);
CREATE INDEX idx_issues_parent ON issues(parent_id);

CREATE TABLE sessions (
    id TEXT PRIMARY KEY,
    branch TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    agent_kind TEXT NOT NULL,
    agent_pid INTEGER,
    started_at INTEGER NOT NULL,
    last_activity INTEGER NOT NULL,
    previous_session_id TEXT,
    name TEXT
);
CREATE INDEX idx_sessions_key ON sessions(branch, fingerprint, last_activity);

CREATE TABLE action_log (
    id INTEGER PRIMARY KEY,
    session_id TEXT NOT NULL,
    action_type TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    previous_data TEXT,
    new_data TEXT,
    timestamp INTEGER NOT NULL,
    undone INTEGER NOT NULL DEFAULT 0,
    synced_at INTEGER
);
CREATE INDEX idx_action_log_unsynced ON action_log(id) WHERE synced_at IS NULL;

CREATE TABLE meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
",
    ),
    (
        2,
        r"
CREATE TABLE sync_state (
    singleton INTEGER PRIMARY KEY CHECK(singleton = 1),
    project_id TEXT NOT NULL,
    last_pushed_action_id INTEGER NOT NULL DEFAULT 0,
    last_pulled_server_seq INTEGER NOT NULL DEFAULT 0,
    last_sync_at INTEGER,
    sync_disabled INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE sync_conflicts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    server_seq INTEGER NOT NULL,
    local_data TEXT,
    remote_data TEXT,
    overwritten_at INTEGER NOT NULL
);

CREATE TABLE sync_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    direction TEXT NOT NULL CHECK(direction IN ('push','pull')),
    action_type TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    server_seq INTEGER NOT NULL,
    device_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);
",
    ),
    (
        3,
        r"
CREATE TABLE boards (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    query TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE board_issue_positions (
    board_id TEXT NOT NULL,
    issue_id TEXT NOT NULL,
    position TEXT NOT NULL,
    PRIMARY KEY (board_id, issue_id),
    UNIQUE (board_id, position)
);

CREATE TABLE issue_dependencies (
    issue_id TEXT NOT NULL,
    depends_on TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (issue_id, depends_on)
);
",
    ),
    (
        4,
        r"
CREATE TABLE comments (
    id TEXT PRIMARY KEY,
    issue_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);
CREATE INDEX idx_comments_issue ON comments(issue_id);

CREATE TABLE notes (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL DEFAULT '',
    body TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);
",
    ),
];

/// Apply all outstanding migrations.
///
/// # Errors
///
/// Returns `Error::Database` when a migration statement fails; the failing
/// migration's transaction rolls back and the version is not recorded.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| Error::database(format!("failed to acquire connection: {e}")))?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
             version INTEGER PRIMARY KEY,
             applied_at INTEGER NOT NULL
         )",
    )
    .execute(&mut *conn)
    .await
    .map_err(|e| Error::database(format!("failed to create migrations table: {e}")))?;

    for (version, sql) in MIGRATIONS {
        if migration_applied(&mut conn, *version).await? {
            continue;
        }
        apply_migration(&mut conn, *version, sql).await?;
    }
    Ok(())
}

async fn migration_applied(conn: &mut SqliteConnection, version: i64) -> Result<bool> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT version FROM schema_migrations WHERE version = ?")
            .bind(version)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| Error::database(format!("failed to read migration state: {e}")))?;
    Ok(row.is_some())
}

async fn apply_migration(conn: &mut SqliteConnection, version: i64, sql: &str) -> Result<()> {
    let mut tx = conn
        .begin()
        .await
        .map_err(|e| Error::database(format!("failed to begin migration {version}: {e}")))?;

    sqlx::raw_sql(sql)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::database(format!("migration {version} failed: {e}")))?;

    sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
        .bind(version)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::database(format!("failed to record migration {version}: {e}")))?;

    tx.commit()
        .await
        .map_err(|e| Error::database(format!("failed to commit migration {version}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered_and_unique() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        tokio_test::block_on(async {
            let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
            migrate(&pool).await.unwrap();
            migrate(&pool).await.unwrap();

            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM schema_migrations")
                    .fetch_one(&pool)
                    .await
                    .unwrap();
            assert_eq!(count, MIGRATIONS.len() as i64);
        });
    }
}
