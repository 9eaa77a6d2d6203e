//! Snapshot bootstrap: skip replaying a long event history on first sync.
//!
//! Only runs before the first pull (`last_pulled_server_seq == 0`) with zero
//! pending local events, when the server holds at least the threshold number
//! of events. The database file is backed up, replaced atomically, and
//! restored on any failure. Callers serialize bootstrap with every other
//! invocation in the same directory; the engine closes its pool around the
//! file swap.

use std::path::Path;

use chrono::Utc;
use td_core::{Error, Result, SyncSettings};
use tracing::debug;

use super::{engine::SyncEngine, transport::SyncTransport};
use crate::db::{actionlog, sync_rows};

/// Magic header every SQLite database file starts with.
pub const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";

/// How a bootstrap attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Conditions not met; fall through to a normal pull.
    NotNeeded,
    /// The database was replaced; pulls resume from `snapshot_seq`.
    Bootstrapped {
        /// Sequence the snapshot is current through.
        snapshot_seq: i64,
    },
}

/// Attempt a snapshot bootstrap.
///
/// # Errors
///
/// Returns `Error::NotLinked` when no sync state exists, transport errors
/// from the status or snapshot calls, and `Error::Io`/`Error::Database` when
/// the file swap fails (after restoring the backup).
pub async fn run_bootstrap<T: SyncTransport>(
    engine: &mut SyncEngine<T>,
    settings: &SyncSettings,
) -> Result<BootstrapOutcome> {
    let mut conn = engine.store().acquire().await?;
    let state = sync_rows::require_state(&mut conn).await?;
    let pending = actionlog::pending_count(&mut conn).await?;
    drop(conn);

    if !settings.bootstrap_enabled() || state.last_pulled_server_seq != 0 {
        return Ok(BootstrapOutcome::NotNeeded);
    }
    if pending > 0 {
        debug!(pending, "local events pending, skipping bootstrap");
        return Ok(BootstrapOutcome::NotNeeded);
    }

    let status = engine.transport().project_status(&state.project_id).await?;
    if status.event_count < settings.snapshot_threshold {
        debug!(
            event_count = status.event_count,
            threshold = settings.snapshot_threshold,
            "below snapshot threshold, skipping bootstrap"
        );
        return Ok(BootstrapOutcome::NotNeeded);
    }

    let Some(snapshot) = engine.transport().fetch_snapshot(&state.project_id).await? else {
        debug!("server has no snapshot, falling back to full pull");
        return Ok(BootstrapOutcome::NotNeeded);
    };
    if !snapshot.bytes.starts_with(SQLITE_MAGIC) {
        return Err(Error::InvalidPayload {
            entity: "snapshot".to_string(),
            entity_id: state.project_id.clone(),
            reason: "missing SQLite magic header".to_string(),
        });
    }

    let db_path = engine.store().db_path().to_path_buf();
    let backup_path = db_path.with_extension("db.bak");

    engine.store().close().await;
    std::fs::copy(&db_path, &backup_path)?;

    if let Err(swap_err) = install_snapshot(&db_path, &snapshot.bytes) {
        restore_backup(&backup_path, &db_path);
        engine.store_mut().reopen().await?;
        return Err(swap_err);
    }

    if let Err(open_err) = engine.store_mut().reopen().await {
        restore_backup(&backup_path, &db_path);
        engine.store_mut().reopen().await?;
        return Err(open_err);
    }

    // Seed the watermark, overwriting whatever state the snapshot carried.
    let mut tx = engine.store().begin().await?;
    sync_rows::put_state(
        &mut tx,
        &sync_rows::SyncState {
            project_id: state.project_id,
            last_pushed_action_id: state.last_pushed_action_id,
            last_pulled_server_seq: snapshot.snapshot_seq,
            last_sync_at: Some(Utc::now()),
            sync_disabled: false,
        },
    )
    .await?;
    tx.commit()
        .await
        .map_err(|e| Error::database(e.to_string()))?;

    debug!(snapshot_seq = snapshot.snapshot_seq, "bootstrap complete");
    Ok(BootstrapOutcome::Bootstrapped {
        snapshot_seq: snapshot.snapshot_seq,
    })
}

/// Write the image beside the target, drop stale WAL companions, and rename
/// into place.
fn install_snapshot(db_path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = db_path.with_extension("db.tmp");
    std::fs::write(&tmp_path, bytes)?;
    for suffix in ["db-wal", "db-shm"] {
        let companion = db_path.with_extension(suffix);
        if companion.exists() {
            std::fs::remove_file(&companion)?;
        }
    }
    std::fs::rename(&tmp_path, db_path)?;
    Ok(())
}

fn restore_backup(backup_path: &Path, db_path: &Path) {
    if let Err(e) = std::fs::copy(backup_path, db_path) {
        // The backup still exists on disk for manual recovery.
        tracing::error!(
            backup = %backup_path.display(),
            error = %e,
            "failed to restore database backup"
        );
    }
}
