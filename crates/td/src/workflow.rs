//! Workflow application: transitions, attribution, journaling, cascade.
//!
//! The pure guards live in `td_core::workflow`; this module runs them against
//! the store, writes the status change and its action-log entry in one
//! transaction, and walks the parent chain applying epic cascades.

use chrono::Utc;
use sqlx::SqliteConnection;
use td_core::{
    workflow::{cascade_action, cascade_target, check},
    ActionKind, EntityKind, Error, Issue, IssueStatus, Result, Session, TransitionAction,
};

use crate::db::{actionlog, dependencies, issues, Store};

/// Journal action recorded for a transition.
const fn action_kind(action: TransitionAction) -> ActionKind {
    match action {
        TransitionAction::Start => ActionKind::Start,
        TransitionAction::Unstart => ActionKind::Unstart,
        TransitionAction::Block => ActionKind::Block,
        TransitionAction::Unblock => ActionKind::Unblock,
        TransitionAction::Review => ActionKind::Review,
        TransitionAction::Approve => ActionKind::Approve,
        TransitionAction::Reject => ActionKind::Reject,
        TransitionAction::Close => ActionKind::Close,
        TransitionAction::Reopen => ActionKind::Reopen,
    }
}

/// Apply a workflow transition to an issue.
///
/// Loads the issue, runs the guards, updates status and attribution, appends
/// the action-log entry, then cascades epic parents, all in one transaction.
///
/// # Errors
///
/// Returns `Error::NotFound` for unknown issues, `Error::TransitionDenied`
/// when a guard refuses, or `Error::Database` on store failure.
pub async fn apply_transition(
    store: &Store,
    issue_id: &str,
    action: TransitionAction,
    session: &Session,
    force: bool,
) -> Result<Issue> {
    let mut tx = store.begin().await?;

    let mut issue = issues::get(&mut tx, issue_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("issue '{issue_id}'")))?;
    if issue.is_deleted() {
        return Err(Error::not_found(format!("issue '{issue_id}' is deleted")));
    }

    let to = check(&issue, action, &session.id, force)?;
    transition_issue(&mut tx, &mut issue, to, action, session).await?;
    run_cascade(&mut tx, &issue, session).await?;

    tx.commit()
        .await
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(issue)
}

/// Write one transition and its journal entry. Shared by the direct path and
/// the cascade.
async fn transition_issue(
    conn: &mut SqliteConnection,
    issue: &mut Issue,
    to: IssueStatus,
    action: TransitionAction,
    session: &Session,
) -> Result<()> {
    let previous = serde_json::to_value(&*issue)?;
    let now = Utc::now();

    issue.status = to;
    match action {
        TransitionAction::Start => {
            if issue.implementer_session.is_none() {
                issue.implementer_session = Some(session.id.clone());
            }
        }
        TransitionAction::Approve | TransitionAction::Reject => {
            issue.reviewer_session = Some(session.id.clone());
        }
        _ => {}
    }
    if to == IssueStatus::Closed {
        issue.closed_at = Some(now);
    } else if issue.closed_at.is_some() {
        // Leaving Closed clears the closure stamp.
        issue.closed_at = None;
    }
    issue.updated_at = now;

    issues::update(&mut *conn, issue).await?;
    let new_data = serde_json::to_value(&*issue)?;
    actionlog::append(
        conn,
        &session.id,
        action_kind(action),
        &EntityKind::Issues,
        &issue.id,
        Some(&previous),
        Some(&new_data),
        now,
    )
    .await?;
    Ok(())
}

/// Walk the parent chain from `child`, transitioning epic parents whose
/// non-deleted children all agree on InReview or Closed. Each hop journals
/// its own entry attributed to the acting session.
async fn run_cascade(
    conn: &mut SqliteConnection,
    child: &Issue,
    session: &Session,
) -> Result<()> {
    let mut parent_id = child.parent_id.clone();
    while let Some(id) = parent_id {
        let Some(mut parent) = issues::get(&mut *conn, &id).await? else {
            break;
        };
        if parent.is_deleted() {
            break;
        }
        let statuses: Vec<IssueStatus> = issues::children_of(&mut *conn, &parent.id)
            .await?
            .iter()
            .map(|c| c.status)
            .collect();
        let Some(to) = cascade_target(parent.issue_type, parent.status, &statuses) else {
            break;
        };
        let action = cascade_action(to);
        transition_issue(&mut *conn, &mut parent, to, action, session).await?;
        parent_id = parent.parent_id;
    }
    Ok(())
}

/// Create an issue and journal it.
///
/// # Errors
///
/// Returns `Error::InvalidInput` when the parent chain would loop, or
/// `Error::Database` on store failure.
pub async fn create_issue(store: &Store, issue: &Issue, session: &Session) -> Result<()> {
    let mut tx = store.begin().await?;
    if let Some(parent) = &issue.parent_id {
        issues::get(&mut tx, parent)
            .await?
            .ok_or_else(|| Error::not_found(format!("parent issue '{parent}'")))?;
        issues::check_parent_cycle(&mut tx, &issue.id, parent).await?;
    }
    issues::insert(&mut tx, issue).await?;
    let data = serde_json::to_value(issue)?;
    actionlog::append(
        &mut tx,
        &session.id,
        ActionKind::Create,
        &EntityKind::Issues,
        &issue.id,
        None,
        Some(&data),
        issue.created_at,
    )
    .await?;
    tx.commit()
        .await
        .map_err(|e| Error::database(e.to_string()))
}

/// Overwrite an issue's editable fields and journal the edit.
///
/// # Errors
///
/// Returns `Error::NotFound` for unknown issues or `Error::Database` on
/// store failure.
pub async fn update_issue(store: &Store, issue: &Issue, session: &Session) -> Result<()> {
    let mut tx = store.begin().await?;
    let previous = issues::get(&mut tx, &issue.id)
        .await?
        .ok_or_else(|| Error::not_found(format!("issue '{}'", issue.id)))?;
    if let Some(parent) = &issue.parent_id {
        if previous.parent_id.as_deref() != Some(parent) {
            issues::check_parent_cycle(&mut tx, &issue.id, parent).await?;
        }
    }
    issues::update(&mut tx, issue).await?;
    let previous = serde_json::to_value(&previous)?;
    let new_data = serde_json::to_value(issue)?;
    actionlog::append(
        &mut tx,
        &session.id,
        ActionKind::Update,
        &EntityKind::Issues,
        &issue.id,
        Some(&previous),
        Some(&new_data),
        issue.updated_at,
    )
    .await?;
    tx.commit()
        .await
        .map_err(|e| Error::database(e.to_string()))
}

/// Soft-delete an issue and journal it.
///
/// # Errors
///
/// Returns `Error::NotFound` for unknown issues.
pub async fn delete_issue(store: &Store, issue_id: &str, session: &Session) -> Result<Issue> {
    set_deletion(store, issue_id, session, true).await
}

/// Undo a soft delete and journal it.
///
/// # Errors
///
/// Returns `Error::NotFound` for unknown issues.
pub async fn restore_issue(store: &Store, issue_id: &str, session: &Session) -> Result<Issue> {
    set_deletion(store, issue_id, session, false).await
}

async fn set_deletion(
    store: &Store,
    issue_id: &str,
    session: &Session,
    deleted: bool,
) -> Result<Issue> {
    let mut tx = store.begin().await?;
    let mut issue = issues::get(&mut tx, issue_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("issue '{issue_id}'")))?;
    let previous = serde_json::to_value(&issue)?;

    if deleted {
        issue.soft_delete();
    } else {
        issue.restore();
    }
    issues::update(&mut tx, &issue).await?;
    let new_data = serde_json::to_value(&issue)?;
    actionlog::append(
        &mut tx,
        &session.id,
        if deleted {
            ActionKind::Delete
        } else {
            ActionKind::Restore
        },
        &EntityKind::Issues,
        issue_id,
        Some(&previous),
        Some(&new_data),
        issue.updated_at,
    )
    .await?;
    tx.commit()
        .await
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(issue)
}

/// Add a dependency edge and journal it.
///
/// # Errors
///
/// Returns `Error::CycleDetected` when the edge would close a cycle.
pub async fn add_dependency(
    store: &Store,
    issue_id: &str,
    depends_on_id: &str,
    session: &Session,
) -> Result<()> {
    let now = Utc::now();
    let mut tx = store.begin().await?;

    issues::get(&mut tx, issue_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("issue '{issue_id}'")))?;
    issues::get(&mut tx, depends_on_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("issue '{depends_on_id}'")))?;

    dependencies::add(&mut tx, issue_id, depends_on_id, now).await?;
    let data = serde_json::json!({ "issue_id": issue_id, "depends_on": depends_on_id });
    actionlog::append(
        &mut tx,
        &session.id,
        ActionKind::DependencyAdd,
        &EntityKind::IssueDependencies,
        &format!("{issue_id}:{depends_on_id}"),
        None,
        Some(&data),
        now,
    )
    .await?;
    tx.commit()
        .await
        .map_err(|e| Error::database(e.to_string()))
}
