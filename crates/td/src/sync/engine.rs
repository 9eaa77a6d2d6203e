//! The sync engine: pending-event extraction, batched push, paged pull.
//!
//! Push slices pending journal entries into batches of at most
//! [`PUSH_BATCH_SIZE`]; each batch's acknowledgements (including duplicate
//! rejections, which are acks for an earlier submission) commit in one
//! transaction together with the sync-state advance and history lines, so a
//! crash between batches leaves consistent state and the server's duplicate
//! handling makes replay idempotent. Pull pages through the global order,
//! applying each page in one transaction and advancing the watermark
//! monotonically.

use chrono::Utc;
use td_core::{
    protocol::{OutboundEvent, ProjectStatus, PushRequest},
    ActionLogEntry, EntityKind, Error, FeatureGate, Result,
};
use tracing::debug;

use super::{apply, transport::SyncTransport};
use crate::db::{
    actionlog,
    sync_rows::{self, SyncConflict, SyncDirection, SyncState},
    Store,
};

/// Maximum events per push batch.
pub const PUSH_BATCH_SIZE: usize = 500;

/// Maximum events requested per pull page.
pub const PULL_PAGE_SIZE: usize = 1000;

/// Entity types that always replicate.
const STATIC_SYNC_ENTITIES: &[EntityKind] = &[
    EntityKind::Issues,
    EntityKind::Boards,
    EntityKind::BoardIssuePositions,
    EntityKind::IssueDependencies,
    EntityKind::WorkSessions,
    EntityKind::Comments,
];

/// Whether an entity type participates in sync right now. The static
/// allowlist covers the core entities; notes are opt-in via the feature gate,
/// consulted at each call so a flag flip takes effect immediately.
#[must_use]
pub fn entity_allowed(gate: &FeatureGate, entity: &EntityKind) -> bool {
    if STATIC_SYNC_ENTITIES.contains(entity) {
        return true;
    }
    matches!(entity, EntityKind::Notes) && gate.is_enabled("notes")
}

/// What a push did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// Entries acknowledged (including duplicate rejections).
    pub pushed: usize,
    /// Batches submitted.
    pub batches: usize,
}

/// What a pull did.
#[derive(Debug, Default)]
pub struct PullOutcome {
    /// Remote events that changed local state.
    pub applied: usize,
    /// Pages fetched.
    pub pages: usize,
    /// Last-writer-wins overwrites recorded.
    pub conflicts: Vec<SyncConflict>,
}

/// Combined local/remote view for `td sync status`.
#[derive(Debug)]
pub struct SyncStatusReport {
    /// The local sync-state row.
    pub state: SyncState,
    /// Journal entries not yet acknowledged.
    pub pending: i64,
    /// The server's view of the project.
    pub remote: ProjectStatus,
}

/// Sync engine over a store and a transport.
#[derive(Debug)]
pub struct SyncEngine<T: SyncTransport> {
    store: Store,
    transport: T,
    gate: FeatureGate,
}

impl<T: SyncTransport> SyncEngine<T> {
    /// Build an engine.
    #[must_use]
    pub const fn new(store: Store, transport: T, gate: FeatureGate) -> Self {
        Self {
            store,
            transport,
            gate,
        }
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &Store {
        &self.store
    }

    /// Mutable store access (snapshot bootstrap reopens the pool).
    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    /// The transport.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    fn validator(&self) -> impl Fn(&EntityKind) -> bool + '_ {
        |entity| entity_allowed(&self.gate, entity)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PUSH
    // ═══════════════════════════════════════════════════════════════════════

    /// Push all pending journal entries in batches.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotLinked` when no sync state exists,
    /// `Error::NotAuthenticated` or `Error::Transport` when a batch fails;
    /// acknowledgements from batches that completed earlier stay committed.
    pub async fn push_once(&self, session_id: &str) -> Result<PushOutcome> {
        let mut conn = self.store.acquire().await?;
        let state = sync_rows::require_state(&mut conn).await?;
        let pending = actionlog::pending_events(&mut conn, self.validator()).await?;
        drop(conn);

        if pending.is_empty() {
            return Ok(PushOutcome::default());
        }

        let device_id = self.store.device_id().to_string();
        let mut outcome = PushOutcome::default();
        let mut max_acked = state.last_pushed_action_id;

        for chunk in pending.chunks(PUSH_BATCH_SIZE) {
            let request = PushRequest {
                device_id: device_id.clone(),
                session_id: session_id.to_string(),
                events: chunk.iter().map(outbound_event).collect(),
            };
            // Unauthorized and transient failures abort here with the
            // original error; nothing from this batch is recorded.
            let response = self
                .transport
                .push_events(&state.project_id, &request)
                .await?;

            let mut acks: Vec<(i64, i64)> = response
                .acks
                .iter()
                .map(|a| (a.client_action_id, a.server_seq))
                .collect();
            acks.extend(
                response
                    .rejected
                    .iter()
                    .filter(|r| r.is_duplicate())
                    .map(|r| (r.client_action_id, r.server_seq)),
            );

            let now = Utc::now();
            let mut tx = self.store.begin().await?;
            actionlog::mark_synced(&mut tx, &acks, now).await?;

            for (client_action_id, server_seq) in &acks {
                if let Some(entry) = chunk.iter().find(|e| e.id == *client_action_id) {
                    sync_rows::append_history(
                        &mut tx,
                        SyncDirection::Push,
                        &entry.action.to_string(),
                        entry.entity.as_str(),
                        &entry.entity_id,
                        *server_seq,
                        &device_id,
                        now,
                    )
                    .await?;
                }
                max_acked = max_acked.max(*client_action_id);
            }
            sync_rows::prune_history(&mut tx).await?;

            let mut st = sync_rows::require_state(&mut tx).await?;
            st.last_pushed_action_id = max_acked;
            st.last_sync_at = Some(now);
            sync_rows::put_state(&mut tx, &st).await?;

            tx.commit()
                .await
                .map_err(|e| Error::database(e.to_string()))?;

            outcome.pushed += acks.len();
            outcome.batches += 1;
        }

        debug!(
            pushed = outcome.pushed,
            batches = outcome.batches,
            "push complete"
        );
        Ok(outcome)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PULL
    // ═══════════════════════════════════════════════════════════════════════

    /// Pull and apply remote events from the watermark until exhausted.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotLinked` when no sync state exists, or transport /
    /// apply errors; pages applied before a failure stay committed.
    pub async fn pull_once(&self) -> Result<PullOutcome> {
        let mut conn = self.store.acquire().await?;
        let state = sync_rows::require_state(&mut conn).await?;
        drop(conn);

        let device_id = self.store.device_id().to_string();
        // The conflict baseline is fixed once per pull: a row counts as
        // locally edited if it changed after the last completed sync.
        let baseline = state.last_sync_at;
        let mut since = state.last_pulled_server_seq;
        let mut outcome = PullOutcome::default();

        loop {
            let page = self
                .transport
                .pull_events(&state.project_id, since, PULL_PAGE_SIZE, &device_id)
                .await?;

            let advanced = page.last_server_seq.max(since);
            if page.events.is_empty() && advanced == since && !page.has_more {
                break;
            }

            let now = Utc::now();
            let mut tx = self.store.begin().await?;
            let result =
                apply::apply_events(&mut tx, &page.events, &device_id, baseline, self.validator())
                    .await?;

            for event in &page.events {
                sync_rows::append_history(
                    &mut tx,
                    SyncDirection::Pull,
                    &event.action_type,
                    &event.entity_type,
                    &event.entity_id,
                    event.server_seq,
                    &event.device_id,
                    now,
                )
                .await?;
            }
            sync_rows::prune_history(&mut tx).await?;

            let mut st = sync_rows::require_state(&mut tx).await?;
            st.last_pulled_server_seq = advanced;
            st.last_sync_at = Some(now);
            sync_rows::put_state(&mut tx, &st).await?;

            tx.commit()
                .await
                .map_err(|e| Error::database(e.to_string()))?;

            outcome.applied += result.applied;
            outcome.conflicts.extend(result.conflicts);
            outcome.pages += 1;
            since = advanced;

            if !page.has_more {
                break;
            }
        }

        debug!(
            applied = outcome.applied,
            pages = outcome.pages,
            conflicts = outcome.conflicts.len(),
            "pull complete"
        );
        Ok(outcome)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // STATUS, LINK, UNLINK
    // ═══════════════════════════════════════════════════════════════════════

    /// Local watermarks, pending count, and the server's project status.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotLinked` when no sync state exists, or transport
    /// errors from the status call.
    pub async fn sync_status(&self) -> Result<SyncStatusReport> {
        let mut conn = self.store.acquire().await?;
        let state = sync_rows::require_state(&mut conn).await?;
        let pending = actionlog::pending_count(&mut conn).await?;
        drop(conn);

        let remote = self.transport.project_status(&state.project_id).await?;
        Ok(SyncStatusReport {
            state,
            pending,
            remote,
        })
    }

    /// Link this store to a remote project.
    ///
    /// Re-linking to a different project when acknowledged events exist
    /// requires `confirm`: all sync marks reset so the full journal replays
    /// against the new project.
    ///
    /// # Errors
    ///
    /// Returns `Error::Conflict` when confirmation is required and absent.
    pub async fn link(&self, project_id: &str, confirm: bool) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let existing = sync_rows::get_state(&mut tx).await?;
        let synced = actionlog::synced_count(&mut tx).await?;

        if let Some(state) = &existing {
            // Linking the same project again is a no-op.
            if state.project_id == project_id {
                return Ok(());
            }
            if synced > 0 && !confirm {
                return Err(Error::Conflict(format!(
                    "already linked to '{}' with {synced} synced entries; \
                     pass --confirm to relink and replay everything",
                    state.project_id
                )));
            }
            actionlog::reset_sync_marks(&mut tx).await?;
        }

        sync_rows::put_state(
            &mut tx,
            &SyncState {
                project_id: project_id.to_string(),
                last_pushed_action_id: 0,
                last_pulled_server_seq: 0,
                last_sync_at: None,
                sync_disabled: false,
            },
        )
        .await?;
        tx.commit()
            .await
            .map_err(|e| Error::database(e.to_string()))
    }

    /// Remove the sync state so this store stops replicating.
    ///
    /// # Errors
    ///
    /// Returns `Error::Database` on store failure.
    pub async fn unlink(&self) -> Result<()> {
        let mut conn = self.store.acquire().await?;
        sync_rows::clear_state(&mut conn).await
    }
}

fn outbound_event(entry: &ActionLogEntry) -> OutboundEvent {
    OutboundEvent {
        client_action_id: entry.id,
        action_type: entry.action.to_string(),
        entity_type: entry.entity.as_str().to_string(),
        entity_id: entry.entity_id.clone(),
        payload: entry
            .new_data
            .clone()
            .unwrap_or(serde_json::Value::Null),
        client_timestamp: entry.timestamp,
    }
}
