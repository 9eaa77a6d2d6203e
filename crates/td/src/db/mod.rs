//! The embedded relational store.
//!
//! One SQLite file per project at `.todos/issues.db`, WAL journal mode so
//! readers proceed alongside the single writer. Every entity operation exists
//! in a `&mut SqliteConnection` flavor, so callers can group entity writes
//! with their action-log rows in one transaction; the `Store` methods are
//! convenience wrappers over a pooled connection.

use std::path::{Path, PathBuf};

use rand::Rng;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqliteConnection, SqlitePool, Transaction,
};
use td_core::{Error, Result};

pub mod actionlog;
pub mod boards;
pub mod dependencies;
pub mod issues;
pub mod notes;
pub mod schema;
pub mod sessions;
pub mod sync_rows;

mod rows;

pub use rows::{from_millis, to_millis};

/// Key in the meta table holding the stable installation id.
const META_DEVICE_ID: &str = "device_id";

/// Store wrapper over the connection pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
    db_path: PathBuf,
    device_id: String,
}

impl Store {
    /// Open an existing project database.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` when the file does not exist, or
    /// `Error::Database` when opening or migrating fails.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if !db_path.exists() {
            return Err(Error::not_found(format!(
                "no database at {}; run 'td init' first",
                db_path.display()
            )));
        }
        Self::open_internal(db_path, false).await
    }

    /// Create or open a project database (init only).
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` when opening or migrating fails.
    pub async fn create_or_open(db_path: &Path) -> Result<Self> {
        Self::open_internal(db_path, true).await
    }

    async fn open_internal(db_path: &Path, allow_create: bool) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(allow_create)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| Error::database(format!("failed to open database: {e}")))?;

        schema::migrate(&pool).await?;
        let device_id = ensure_device_id(&pool).await?;

        Ok(Self {
            pool,
            db_path: db_path.to_path_buf(),
            device_id,
        })
    }

    /// The pool backing this store.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Path of the database file.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Stable identifier of this installation, minted on first open.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Begin a write transaction.
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` when the pool cannot start one.
    pub async fn begin(&self) -> Result<Transaction<'_, sqlx::Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(|e| Error::database(format!("failed to begin transaction: {e}")))
    }

    /// Acquire a pooled connection for single-statement reads.
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` when the pool is exhausted or closed.
    pub async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Sqlite>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| Error::database(format!("failed to acquire connection: {e}")))
    }

    /// Close the pool. Idempotent; required before snapshot file replacement.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Re-open the pool on the same path after a snapshot swap.
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` when the new file cannot be opened.
    pub async fn reopen(&mut self) -> Result<()> {
        self.close().await;
        let reopened = Self::open_internal(&self.db_path, false).await?;
        *self = reopened;
        Ok(())
    }
}

async fn ensure_device_id(pool: &SqlitePool) -> Result<String> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| Error::database(format!("failed to acquire connection: {e}")))?;

    if let Some(existing) = get_meta(&mut conn, META_DEVICE_ID).await? {
        return Ok(existing);
    }
    let minted = new_device_id();
    // Another process may have raced us; keep whichever landed first.
    sqlx::query("INSERT OR IGNORE INTO meta (key, value) VALUES (?, ?)")
        .bind(META_DEVICE_ID)
        .bind(&minted)
        .execute(&mut *conn)
        .await
        .map_err(|e| Error::database(format!("failed to store device id: {e}")))?;
    get_meta(&mut conn, META_DEVICE_ID)
        .await?
        .ok_or_else(|| Error::database("device id missing after insert"))
}

/// Read a meta value.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn get_meta(conn: &mut SqliteConnection, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM meta WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| Error::database(format!("failed to read meta '{key}': {e}")))?;
    Ok(row.map(|(v,)| v))
}

fn new_device_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let tail: String = (0..10)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("dev_{tail}")
}


#[cfg(test)]
mod tests {
    use super::test_util::temp_store;
    use super::*;

    #[test]
    fn test_open_missing_file_fails() {
        tokio_test::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let result = Store::open(&dir.path().join("issues.db")).await;
            assert!(matches!(result, Err(Error::NotFound(_))));
        });
    }

    #[test]
    fn test_create_then_open() {
        tokio_test::block_on(async {
            let (store, dir) = temp_store().await;
            let device = store.device_id().to_string();
            assert!(device.starts_with("dev_"));
            store.close().await;

            let reopened = Store::open(&dir.path().join("issues.db")).await.unwrap();
            assert_eq!(reopened.device_id(), device);
        });
    }

    #[test]
    fn test_close_is_idempotent() {
        tokio_test::block_on(async {
            let (store, _dir) = temp_store().await;
            store.close().await;
            store.close().await;
        });
    }
}
