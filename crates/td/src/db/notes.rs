//! Comments and notes.
//!
//! Comments hang off issues; notes are free-standing and only replicate when
//! the `notes` feature gate is on. Both soft-delete so the delete can travel
//! through the journal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, SqliteConnection};
use td_core::Result;

use super::rows::{col, col_time, col_time_opt, map_db_err, to_millis};

/// A comment on an issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    /// Identifier, `cmt-` plus six hex digits.
    pub id: String,
    /// Issue the comment belongs to.
    pub issue_id: String,
    /// Authoring session.
    pub session_id: String,
    /// Body text.
    pub body: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last edit time.
    pub updated_at: DateTime<Utc>,
    /// Set on soft delete.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Comment {
    /// Create a comment with a fresh id.
    #[must_use]
    pub fn new(
        issue_id: impl Into<String>,
        session_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        use rand::Rng;
        let n: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
        let now = Utc::now();
        Self {
            id: format!("cmt-{n:06x}"),
            issue_id: issue_id.into(),
            session_id: session_id.into(),
            body: body.into(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// A free-standing note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    /// Identifier, `nt-` plus six hex digits.
    pub id: String,
    /// Title line.
    #[serde(default)]
    pub title: String,
    /// Body text.
    #[serde(default)]
    pub body: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last edit time.
    pub updated_at: DateTime<Utc>,
    /// Set on soft delete.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Note {
    /// Create a note with a fresh id.
    #[must_use]
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        use rand::Rng;
        let n: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
        let now = Utc::now();
        Self {
            id: format!("nt-{n:06x}"),
            title: title.into(),
            body: body.into(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

fn parse_comment_row(row: &SqliteRow) -> Result<Comment> {
    Ok(Comment {
        id: col(row, "id")?,
        issue_id: col(row, "issue_id")?,
        session_id: col(row, "session_id")?,
        body: col(row, "body")?,
        created_at: col_time(row, "created_at")?,
        updated_at: col_time(row, "updated_at")?,
        deleted_at: col_time_opt(row, "deleted_at")?,
    })
}

fn parse_note_row(row: &SqliteRow) -> Result<Note> {
    Ok(Note {
        id: col(row, "id")?,
        title: col(row, "title")?,
        body: col(row, "body")?,
        created_at: col_time(row, "created_at")?,
        updated_at: col_time(row, "updated_at")?,
        deleted_at: col_time_opt(row, "deleted_at")?,
    })
}

/// Insert or overwrite a comment.
///
/// # Errors
///
/// Returns `Error::Database` on failure.
pub async fn upsert_comment(conn: &mut SqliteConnection, comment: &Comment) -> Result<()> {
    sqlx::query(
        "INSERT INTO comments (id, issue_id, session_id, body, created_at, updated_at, \
         deleted_at) VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET body = excluded.body, \
         updated_at = excluded.updated_at, deleted_at = excluded.deleted_at",
    )
    .bind(&comment.id)
    .bind(&comment.issue_id)
    .bind(&comment.session_id)
    .bind(&comment.body)
    .bind(to_millis(comment.created_at))
    .bind(to_millis(comment.updated_at))
    .bind(comment.deleted_at.map(to_millis))
    .execute(conn)
    .await
    .map(|_| ())
    .map_err(|e| map_db_err(&format!("failed to write comment '{}'", comment.id), &e))
}

/// Fetch one comment by id.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn get_comment(conn: &mut SqliteConnection, id: &str) -> Result<Option<Comment>> {
    sqlx::query(
        "SELECT id, issue_id, session_id, body, created_at, updated_at, deleted_at \
         FROM comments WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(conn)
    .await
    .map_err(|e| map_db_err(&format!("failed to fetch comment '{id}'"), &e))
    .and_then(|opt| opt.map(|row| parse_comment_row(&row)).transpose())
}

/// Live comments on an issue, oldest first.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn comments_for_issue(
    conn: &mut SqliteConnection,
    issue_id: &str,
) -> Result<Vec<Comment>> {
    let rows = sqlx::query(
        "SELECT id, issue_id, session_id, body, created_at, updated_at, deleted_at \
         FROM comments WHERE issue_id = ? AND deleted_at IS NULL ORDER BY created_at",
    )
    .bind(issue_id)
    .fetch_all(conn)
    .await
    .map_err(|e| map_db_err("failed to list comments", &e))?;
    rows.iter().map(parse_comment_row).collect()
}

/// Insert or overwrite a note.
///
/// # Errors
///
/// Returns `Error::Database` on failure.
pub async fn upsert_note(conn: &mut SqliteConnection, note: &Note) -> Result<()> {
    sqlx::query(
        "INSERT INTO notes (id, title, body, created_at, updated_at, deleted_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET title = excluded.title, body = excluded.body, \
         updated_at = excluded.updated_at, deleted_at = excluded.deleted_at",
    )
    .bind(&note.id)
    .bind(&note.title)
    .bind(&note.body)
    .bind(to_millis(note.created_at))
    .bind(to_millis(note.updated_at))
    .bind(note.deleted_at.map(to_millis))
    .execute(conn)
    .await
    .map(|_| ())
    .map_err(|e| map_db_err(&format!("failed to write note '{}'", note.id), &e))
}

/// Fetch one note by id.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn get_note(conn: &mut SqliteConnection, id: &str) -> Result<Option<Note>> {
    sqlx::query(
        "SELECT id, title, body, created_at, updated_at, deleted_at FROM notes WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(conn)
    .await
    .map_err(|e| map_db_err(&format!("failed to fetch note '{id}'"), &e))
    .and_then(|opt| opt.map(|row| parse_note_row(&row)).transpose())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::temp_store;

    #[test]
    fn test_comment_round_trip_and_soft_delete() {
        tokio_test::block_on(async {
            let (store, _dir) = temp_store().await;
            let mut conn = store.acquire().await.unwrap();

            let mut comment = Comment::new("td-000001", "ses_a", "looks good");
            upsert_comment(&mut conn, &comment).await.unwrap();
            assert_eq!(
                comments_for_issue(&mut conn, "td-000001").await.unwrap().len(),
                1
            );

            comment.deleted_at = Some(Utc::now());
            upsert_comment(&mut conn, &comment).await.unwrap();
            assert!(comments_for_issue(&mut conn, "td-000001")
                .await
                .unwrap()
                .is_empty());
            assert!(get_comment(&mut conn, &comment.id).await.unwrap().is_some());
        });
    }

    #[test]
    fn test_note_round_trip() {
        tokio_test::block_on(async {
            let (store, _dir) = temp_store().await;
            let mut conn = store.acquire().await.unwrap();

            let note = Note::new("standup", "blocked on review");
            upsert_note(&mut conn, &note).await.unwrap();

            let loaded = get_note(&mut conn, &note.id).await.unwrap().unwrap();
            assert_eq!(loaded.body, "blocked on review");
        });
    }
}
