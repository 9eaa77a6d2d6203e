//! Application of remote events to the local store.
//!
//! Events arrive in server order and are applied with last-writer-wins
//! semantics: when a non-create mutation lands on a row the local user edited
//! after the last successful sync, the displaced local state is preserved in
//! the conflicts table and the remote payload overwrites it anyway. Status
//! actions set the status explicitly instead of re-running workflow guards;
//! the server already ordered them.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use td_core::{
    ordering,
    protocol::RemoteEvent,
    ActionKind, EntityKind, Error, IssueStatus, Result,
};
use tracing::debug;

use crate::db::{
    boards::{self, Board, BoardPosition},
    dependencies, issues,
    notes::{self, Comment, Note},
    sessions,
    sync_rows::{self, SyncConflict},
};

/// What one apply pass did.
#[derive(Debug, Default)]
pub struct ApplyResult {
    /// Events that changed local state.
    pub applied: usize,
    /// Overwrites recorded along the way.
    pub conflicts: Vec<SyncConflict>,
}

/// Apply one page of remote events inside the caller's transaction.
///
/// `baseline` is the `last_sync_at` watermark captured before the pull began;
/// local rows updated after it are conflict-recorded before being overwritten.
///
/// # Errors
///
/// Returns `Error::InvalidPayload` when a payload fails to decode, or
/// `Error::Database` on store failure.
pub async fn apply_events(
    conn: &mut SqliteConnection,
    events: &[RemoteEvent],
    own_device_id: &str,
    baseline: Option<DateTime<Utc>>,
    validator: impl Fn(&EntityKind) -> bool,
) -> Result<ApplyResult> {
    let mut result = ApplyResult::default();

    for event in events {
        // Echo protection: the server should have filtered our own events,
        // drop any that slip through.
        if event.device_id == own_device_id {
            continue;
        }
        let entity = EntityKind::parse(&event.entity_type);
        if !validator(&entity) {
            debug!(entity = %entity, seq = event.server_seq, "skipping gated entity");
            continue;
        }
        let Ok(action) = event.action_type.parse::<ActionKind>() else {
            debug!(action = %event.action_type, seq = event.server_seq, "skipping unknown action");
            continue;
        };

        let applied = match entity {
            EntityKind::Issues => {
                apply_issue(&mut *conn, event, action, baseline, &mut result.conflicts).await?
            }
            EntityKind::Boards => apply_board(&mut *conn, event, action).await?,
            EntityKind::BoardIssuePositions => apply_position(&mut *conn, event, action).await?,
            EntityKind::IssueDependencies => apply_dependency(&mut *conn, event, action).await?,
            EntityKind::WorkSessions => apply_session(&mut *conn, event, action).await?,
            EntityKind::Comments => {
                apply_comment(&mut *conn, event, action, baseline, &mut result.conflicts).await?
            }
            EntityKind::Notes => {
                apply_note(&mut *conn, event, action, baseline, &mut result.conflicts).await?
            }
            other => {
                debug!(entity = %other, seq = event.server_seq, "skipping unhandled entity");
                false
            }
        };
        if applied {
            result.applied += 1;
        }
    }
    Ok(result)
}

fn payload_of<T: serde::de::DeserializeOwned>(event: &RemoteEvent) -> Result<Option<T>> {
    if event.payload.is_null() {
        return Ok(None);
    }
    serde_json::from_value(event.payload.clone())
        .map(Some)
        .map_err(|e| Error::InvalidPayload {
            entity: event.entity_type.clone(),
            entity_id: event.entity_id.clone(),
            reason: e.to_string(),
        })
}

/// True when the local row was edited after the pull baseline and the
/// overwrite must be audited.
fn edited_since_baseline(local_updated_at: DateTime<Utc>, baseline: Option<DateTime<Utc>>) -> bool {
    baseline.map_or(true, |b| local_updated_at > b)
}

fn conflict_row(
    event: &RemoteEvent,
    local: &impl serde::Serialize,
) -> Result<SyncConflict> {
    Ok(SyncConflict {
        entity_type: event.entity_type.clone(),
        entity_id: event.entity_id.clone(),
        server_seq: event.server_seq,
        local_data: Some(serde_json::to_value(local)?),
        remote_data: Some(event.payload.clone()),
        overwritten_at: Utc::now(),
    })
}

/// Explicit status for a replicated transition; guards do not re-run.
const fn status_for(action: ActionKind) -> Option<IssueStatus> {
    match action {
        ActionKind::Start => Some(IssueStatus::InProgress),
        ActionKind::Unstart | ActionKind::Unblock | ActionKind::Reopen => Some(IssueStatus::Open),
        ActionKind::Block => Some(IssueStatus::Blocked),
        ActionKind::Review => Some(IssueStatus::InReview),
        ActionKind::Approve | ActionKind::Close => Some(IssueStatus::Closed),
        ActionKind::Reject => Some(IssueStatus::InProgress),
        _ => None,
    }
}

async fn apply_issue(
    conn: &mut SqliteConnection,
    event: &RemoteEvent,
    action: ActionKind,
    baseline: Option<DateTime<Utc>>,
    conflicts: &mut Vec<SyncConflict>,
) -> Result<bool> {
    if action == ActionKind::Create {
        let Some(issue) = payload_of::<td_core::Issue>(event)? else {
            return Err(missing_payload(event));
        };
        issues::upsert(&mut *conn, &issue).await?;
        return Ok(true);
    }

    let current = issues::get(&mut *conn, &event.entity_id).await?;
    if let Some(local) = &current {
        if edited_since_baseline(local.updated_at, baseline) {
            let conflict = conflict_row(event, local)?;
            sync_rows::insert_conflict(&mut *conn, &conflict).await?;
            conflicts.push(conflict);
        }
    }

    match action {
        ActionKind::Delete => {
            let Some(mut local) = current else {
                debug!(id = %event.entity_id, "delete for unknown issue, skipping");
                return Ok(false);
            };
            local.deleted_at = Some(event.client_timestamp);
            local.updated_at = Utc::now();
            issues::update(&mut *conn, &local).await?;
            Ok(true)
        }
        _ => {
            // Updates, restores, and status actions all carry the full row.
            if let Some(issue) = payload_of::<td_core::Issue>(event)? {
                issues::upsert(&mut *conn, &issue).await?;
                return Ok(true);
            }
            // Bare status action without a payload: set the status directly.
            let Some(to) = status_for(action) else {
                return Err(missing_payload(event));
            };
            let Some(mut local) = current else {
                debug!(id = %event.entity_id, "status event for unknown issue, skipping");
                return Ok(false);
            };
            local.status = to;
            if to == IssueStatus::Closed {
                local.closed_at = Some(event.client_timestamp);
            } else {
                local.closed_at = None;
            }
            local.updated_at = Utc::now();
            issues::update(&mut *conn, &local).await?;
            Ok(true)
        }
    }
}

async fn apply_board(
    conn: &mut SqliteConnection,
    event: &RemoteEvent,
    action: ActionKind,
) -> Result<bool> {
    match action {
        ActionKind::BoardDelete | ActionKind::Delete => {
            boards::delete_board(conn, &event.entity_id).await?;
            Ok(true)
        }
        _ => {
            let Some(board) = payload_of::<Board>(event)? else {
                return Err(missing_payload(event));
            };
            boards::upsert_board(conn, &board).await?;
            Ok(true)
        }
    }
}

async fn apply_position(
    conn: &mut SqliteConnection,
    event: &RemoteEvent,
    action: ActionKind,
) -> Result<bool> {
    if matches!(action, ActionKind::BoardUnposition | ActionKind::Delete) {
        let Some(position) = payload_of::<BoardPosition>(event)? else {
            return Err(missing_payload(event));
        };
        boards::remove_position(conn, &position.board_id, &position.issue_id).await?;
        return Ok(true);
    }

    let Some(position) = payload_of::<BoardPosition>(event)? else {
        return Err(missing_payload(event));
    };
    // Another device may hold this key already; nudge past it with the
    // sparse ordering rules instead of failing the pull.
    let taken = boards::positions(&mut *conn, &position.board_id)
        .await?
        .into_iter()
        .find(|p| p.position == position.position && p.issue_id != position.issue_id);
    let key = match taken {
        None => position.position.clone(),
        Some(neighbor) => {
            let rows = boards::positions(&mut *conn, &position.board_id).await?;
            let next = rows
                .iter()
                .map(|p| p.position.as_str())
                .find(|k| *k > neighbor.position.as_str());
            ordering::key_between(Some(&neighbor.position), next)?
        }
    };
    boards::set_position(conn, &position.board_id, &position.issue_id, &key).await?;
    Ok(true)
}

async fn apply_dependency(
    conn: &mut SqliteConnection,
    event: &RemoteEvent,
    action: ActionKind,
) -> Result<bool> {
    if !matches!(action, ActionKind::DependencyAdd | ActionKind::Create) {
        debug!(action = %action, "unsupported dependency action, skipping");
        return Ok(false);
    }
    #[derive(serde::Deserialize)]
    struct Edge {
        issue_id: String,
        depends_on: String,
    }
    let Some(edge) = payload_of::<Edge>(event)? else {
        return Err(missing_payload(event));
    };
    // Preserve the local acyclicity invariant even against a confused peer.
    let existing = dependencies::edges(&mut *conn).await?;
    if dependencies::would_cycle(&existing, &edge.issue_id, &edge.depends_on) {
        debug!(
            from = %edge.issue_id,
            to = %edge.depends_on,
            "remote dependency would close a cycle, skipping"
        );
        return Ok(false);
    }
    dependencies::upsert(conn, &edge.issue_id, &edge.depends_on, event.client_timestamp).await?;
    Ok(true)
}

async fn apply_session(
    conn: &mut SqliteConnection,
    event: &RemoteEvent,
    action: ActionKind,
) -> Result<bool> {
    if !matches!(
        action,
        ActionKind::SessionCreated | ActionKind::SessionStarted | ActionKind::Create
    ) {
        debug!(action = %action, "unsupported session action, skipping");
        return Ok(false);
    }
    let Some(session) = payload_of::<td_core::Session>(event)? else {
        return Err(missing_payload(event));
    };
    sessions::upsert(conn, &session).await?;
    Ok(true)
}

async fn apply_comment(
    conn: &mut SqliteConnection,
    event: &RemoteEvent,
    action: ActionKind,
    baseline: Option<DateTime<Utc>>,
    conflicts: &mut Vec<SyncConflict>,
) -> Result<bool> {
    let current = notes::get_comment(&mut *conn, &event.entity_id).await?;
    if action != ActionKind::Create {
        if let Some(local) = &current {
            if edited_since_baseline(local.updated_at, baseline) {
                let conflict = conflict_row(event, local)?;
                sync_rows::insert_conflict(&mut *conn, &conflict).await?;
                conflicts.push(conflict);
            }
        }
    }
    if action == ActionKind::Delete {
        let Some(mut local) = current else {
            return Ok(false);
        };
        local.deleted_at = Some(event.client_timestamp);
        local.updated_at = Utc::now();
        notes::upsert_comment(conn, &local).await?;
        return Ok(true);
    }
    let Some(comment) = payload_of::<Comment>(event)? else {
        return Err(missing_payload(event));
    };
    notes::upsert_comment(conn, &comment).await?;
    Ok(true)
}

async fn apply_note(
    conn: &mut SqliteConnection,
    event: &RemoteEvent,
    action: ActionKind,
    baseline: Option<DateTime<Utc>>,
    conflicts: &mut Vec<SyncConflict>,
) -> Result<bool> {
    let current = notes::get_note(&mut *conn, &event.entity_id).await?;
    if action != ActionKind::Create {
        if let Some(local) = &current {
            if edited_since_baseline(local.updated_at, baseline) {
                let conflict = conflict_row(event, local)?;
                sync_rows::insert_conflict(&mut *conn, &conflict).await?;
                conflicts.push(conflict);
            }
        }
    }
    if action == ActionKind::Delete {
        let Some(mut local) = current else {
            return Ok(false);
        };
        local.deleted_at = Some(event.client_timestamp);
        local.updated_at = Utc::now();
        notes::upsert_note(conn, &local).await?;
        return Ok(true);
    }
    let Some(note) = payload_of::<Note>(event)? else {
        return Err(missing_payload(event));
    };
    notes::upsert_note(conn, &note).await?;
    Ok(true)
}

fn missing_payload(event: &RemoteEvent) -> Error {
    Error::InvalidPayload {
        entity: event.entity_type.clone(),
        entity_id: event.entity_id.clone(),
        reason: "missing payload".to_string(),
    }
}
