//! Issue CRUD.
//!
//! All writes take `&mut SqliteConnection` so callers can bundle them with
//! action-log appends in one transaction. Soft-deleted issues stay on disk
//! and are hidden from default listings.

use sqlx::{sqlite::SqliteRow, SqliteConnection};
use td_core::{Issue, IssueStatus, Result};

use super::rows::{col, col_enum, col_json, col_time, col_time_opt, map_db_err, to_millis};

const SELECT_COLS: &str = "id, title, description, acceptance_criteria, status, issue_type, \
     priority, points, labels, parent_id, creator_session, implementer_session, \
     reviewer_session, minor, created_branch, created_at, updated_at, closed_at, deleted_at";

pub(crate) fn parse_issue_row(row: &SqliteRow) -> Result<Issue> {
    Ok(Issue {
        id: col(row, "id")?,
        title: col(row, "title")?,
        description: col(row, "description")?,
        acceptance_criteria: col(row, "acceptance_criteria")?,
        status: col_enum(row, "status")?,
        issue_type: col_enum(row, "issue_type")?,
        priority: col_enum(row, "priority")?,
        points: col::<i64>(row, "points")?.try_into().unwrap_or(0),
        labels: col_json(row, "labels")?,
        parent_id: col(row, "parent_id")?,
        creator_session: col(row, "creator_session")?,
        implementer_session: col(row, "implementer_session")?,
        reviewer_session: col(row, "reviewer_session")?,
        minor: col::<i64>(row, "minor")? != 0,
        created_branch: col(row, "created_branch")?,
        created_at: col_time(row, "created_at")?,
        updated_at: col_time(row, "updated_at")?,
        closed_at: col_time_opt(row, "closed_at")?,
        deleted_at: col_time_opt(row, "deleted_at")?,
    })
}

/// Insert a new issue row.
///
/// # Errors
///
/// Returns `Error::Conflict` when the id already exists.
pub async fn insert(conn: &mut SqliteConnection, issue: &Issue) -> Result<()> {
    sqlx::query(
        "INSERT INTO issues (id, title, description, acceptance_criteria, status, issue_type, \
         priority, points, labels, parent_id, creator_session, implementer_session, \
         reviewer_session, minor, created_branch, created_at, updated_at, closed_at, deleted_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&issue.id)
    .bind(&issue.title)
    .bind(&issue.description)
    .bind(&issue.acceptance_criteria)
    .bind(issue.status.to_string())
    .bind(issue.issue_type.to_string())
    .bind(issue.priority.to_string())
    .bind(i64::from(issue.points))
    .bind(serde_json::to_string(&issue.labels)?)
    .bind(&issue.parent_id)
    .bind(&issue.creator_session)
    .bind(&issue.implementer_session)
    .bind(&issue.reviewer_session)
    .bind(i64::from(issue.minor))
    .bind(&issue.created_branch)
    .bind(to_millis(issue.created_at))
    .bind(to_millis(issue.updated_at))
    .bind(issue.closed_at.map(to_millis))
    .bind(issue.deleted_at.map(to_millis))
    .execute(conn)
    .await
    .map(|_| ())
    .map_err(|e| map_db_err(&format!("failed to insert issue '{}'", issue.id), &e))
}

/// Overwrite every mutable column of an existing row.
///
/// # Errors
///
/// Returns `Error::NotFound` when the id does not exist.
pub async fn update(conn: &mut SqliteConnection, issue: &Issue) -> Result<()> {
    let result = sqlx::query(
        "UPDATE issues SET title = ?, description = ?, acceptance_criteria = ?, status = ?, \
         issue_type = ?, priority = ?, points = ?, labels = ?, parent_id = ?, \
         implementer_session = ?, reviewer_session = ?, minor = ?, updated_at = ?, \
         closed_at = ?, deleted_at = ? WHERE id = ?",
    )
    .bind(&issue.title)
    .bind(&issue.description)
    .bind(&issue.acceptance_criteria)
    .bind(issue.status.to_string())
    .bind(issue.issue_type.to_string())
    .bind(issue.priority.to_string())
    .bind(i64::from(issue.points))
    .bind(serde_json::to_string(&issue.labels)?)
    .bind(&issue.parent_id)
    .bind(&issue.implementer_session)
    .bind(&issue.reviewer_session)
    .bind(i64::from(issue.minor))
    .bind(to_millis(issue.updated_at))
    .bind(issue.closed_at.map(to_millis))
    .bind(issue.deleted_at.map(to_millis))
    .bind(&issue.id)
    .execute(conn)
    .await
    .map_err(|e| map_db_err(&format!("failed to update issue '{}'", issue.id), &e))?;

    if result.rows_affected() == 0 {
        return Err(td_core::Error::not_found(format!("issue '{}'", issue.id)));
    }
    Ok(())
}

/// Insert the row or overwrite it if present (sync apply path).
///
/// # Errors
///
/// Returns `Error::Database` on failure.
pub async fn upsert(conn: &mut SqliteConnection, issue: &Issue) -> Result<()> {
    match get(conn, &issue.id).await? {
        Some(_) => update(conn, issue).await,
        None => insert(conn, issue).await,
    }
}

/// Fetch one issue by id, deleted or not.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Option<Issue>> {
    sqlx::query(&format!("SELECT {SELECT_COLS} FROM issues WHERE id = ?"))
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(|e| map_db_err(&format!("failed to fetch issue '{id}'"), &e))
        .and_then(|opt| opt.map(|row| parse_issue_row(&row)).transpose())
}

/// List issues, hiding soft-deleted rows, optionally filtered by status.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn list(
    conn: &mut SqliteConnection,
    status: Option<IssueStatus>,
) -> Result<Vec<Issue>> {
    let rows = match status {
        Some(status) => {
            sqlx::query(&format!(
                "SELECT {SELECT_COLS} FROM issues \
                 WHERE deleted_at IS NULL AND status = ? ORDER BY created_at, rowid"
            ))
            .bind(status.to_string())
            .fetch_all(conn)
            .await
        }
        None => {
            sqlx::query(&format!(
                "SELECT {SELECT_COLS} FROM issues WHERE deleted_at IS NULL ORDER BY created_at, rowid"
            ))
            .fetch_all(conn)
            .await
        }
    }
    .map_err(|e| map_db_err("failed to list issues", &e))?;

    rows.iter().map(parse_issue_row).collect()
}

/// Non-deleted children of a parent, for cascade checks.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn children_of(conn: &mut SqliteConnection, parent_id: &str) -> Result<Vec<Issue>> {
    let rows = sqlx::query(&format!(
        "SELECT {SELECT_COLS} FROM issues \
         WHERE parent_id = ? AND deleted_at IS NULL ORDER BY created_at, rowid"
    ))
    .bind(parent_id)
    .fetch_all(conn)
    .await
    .map_err(|e| map_db_err(&format!("failed to list children of '{parent_id}'"), &e))?;

    rows.iter().map(parse_issue_row).collect()
}

/// Walk the parent chain from `start_parent` upward, failing on a cycle back
/// to `issue_id`.
///
/// # Errors
///
/// Returns `Error::InvalidInput` when the chain loops through `issue_id`.
pub async fn check_parent_cycle(
    conn: &mut SqliteConnection,
    issue_id: &str,
    start_parent: &str,
) -> Result<()> {
    let mut cursor = Some(start_parent.to_string());
    let mut hops = 0_u32;
    while let Some(current) = cursor {
        if current == issue_id {
            return Err(td_core::Error::invalid_input(format!(
                "setting parent '{start_parent}' on '{issue_id}' would create a parent cycle"
            )));
        }
        // Defensive bound; parent chains are shallow in practice.
        hops += 1;
        if hops > 64 {
            return Err(td_core::Error::invalid_input(
                "parent chain too deep".to_string(),
            ));
        }
        cursor = match get(conn, &current).await? {
            Some(issue) => issue.parent_id,
            None => None,
        };
    }
    Ok(())
}
