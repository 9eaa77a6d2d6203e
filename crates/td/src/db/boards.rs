//! Boards and fractional issue positions.
//!
//! Placement uses the sparse ordering module: inserting between two neighbors
//! takes the midpoint of their keys, and when the midpoint exhausts the key
//! length budget every row on the board is respaced and the changed rows are
//! returned so the caller can journal one respace event per row.

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, SqliteConnection};
use td_core::{ordering, Issue, Result};

use super::rows::{col, col_time, map_db_err, to_millis};

/// A kanban-style board.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Board {
    /// Identifier, `brd-` plus six hex digits.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Default query for unpositioned issues (free-form, CLI-interpreted).
    #[serde(default)]
    pub query: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl Board {
    /// Create a board with a fresh id.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        use rand::Rng;
        let n: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
        let now = Utc::now();
        Self {
            id: format!("brd-{n:06x}"),
            name: name.into(),
            query: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One positioned row on a board.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BoardPosition {
    /// Board the position belongs to.
    pub board_id: String,
    /// Issue being placed.
    pub issue_id: String,
    /// Fractional sort key.
    pub position: String,
}

fn parse_board_row(row: &SqliteRow) -> Result<Board> {
    Ok(Board {
        id: col(row, "id")?,
        name: col(row, "name")?,
        query: col(row, "query")?,
        created_at: col_time(row, "created_at")?,
        updated_at: col_time(row, "updated_at")?,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// BOARD CRUD
// ═══════════════════════════════════════════════════════════════════════════

/// Insert the board or overwrite it if present.
///
/// # Errors
///
/// Returns `Error::Database` on failure.
pub async fn upsert_board(conn: &mut SqliteConnection, board: &Board) -> Result<()> {
    sqlx::query(
        "INSERT INTO boards (id, name, query, created_at, updated_at) VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, query = excluded.query, \
         updated_at = excluded.updated_at",
    )
    .bind(&board.id)
    .bind(&board.name)
    .bind(&board.query)
    .bind(to_millis(board.created_at))
    .bind(to_millis(board.updated_at))
    .execute(conn)
    .await
    .map(|_| ())
    .map_err(|e| map_db_err(&format!("failed to write board '{}'", board.id), &e))
}

/// Fetch one board by id.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn get_board(conn: &mut SqliteConnection, id: &str) -> Result<Option<Board>> {
    sqlx::query("SELECT id, name, query, created_at, updated_at FROM boards WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(|e| map_db_err(&format!("failed to fetch board '{id}'"), &e))
        .and_then(|opt| opt.map(|row| parse_board_row(&row)).transpose())
}

/// List all boards by creation order.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn list_boards(conn: &mut SqliteConnection) -> Result<Vec<Board>> {
    let rows = sqlx::query(
        "SELECT id, name, query, created_at, updated_at FROM boards ORDER BY created_at",
    )
    .fetch_all(conn)
    .await
    .map_err(|e| map_db_err("failed to list boards", &e))?;
    rows.iter().map(parse_board_row).collect()
}

/// Delete a board and its positions.
///
/// # Errors
///
/// Returns `Error::Database` on failure.
pub async fn delete_board(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM board_issue_positions WHERE board_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_db_err("failed to clear board positions", &e))?;
    sqlx::query("DELETE FROM boards WHERE id = ?")
        .bind(id)
        .execute(conn)
        .await
        .map(|_| ())
        .map_err(|e| map_db_err("failed to delete board", &e))
}

// ═══════════════════════════════════════════════════════════════════════════
// POSITIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Positions on a board in ascending key order.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn positions(conn: &mut SqliteConnection, board_id: &str) -> Result<Vec<BoardPosition>> {
    let rows = sqlx::query(
        "SELECT board_id, issue_id, position FROM board_issue_positions \
         WHERE board_id = ? ORDER BY position",
    )
    .bind(board_id)
    .fetch_all(conn)
    .await
    .map_err(|e| map_db_err("failed to list board positions", &e))?;

    rows.iter()
        .map(|row| {
            Ok(BoardPosition {
                board_id: col(row, "board_id")?,
                issue_id: col(row, "issue_id")?,
                position: col(row, "position")?,
            })
        })
        .collect()
}

/// Write one position key.
///
/// # Errors
///
/// Returns `Error::Conflict` when the key is already taken on this board.
pub async fn set_position(
    conn: &mut SqliteConnection,
    board_id: &str,
    issue_id: &str,
    position: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO board_issue_positions (board_id, issue_id, position) VALUES (?, ?, ?) \
         ON CONFLICT(board_id, issue_id) DO UPDATE SET position = excluded.position",
    )
    .bind(board_id)
    .bind(issue_id)
    .bind(position)
    .execute(conn)
    .await
    .map(|_| ())
    .map_err(|e| map_db_err("failed to set board position", &e))
}

/// Remove one position, returning the old key for undo.
///
/// # Errors
///
/// Returns `Error::Database` on failure.
pub async fn remove_position(
    conn: &mut SqliteConnection,
    board_id: &str,
    issue_id: &str,
) -> Result<Option<String>> {
    let old: Option<(String,)> = sqlx::query_as(
        "SELECT position FROM board_issue_positions WHERE board_id = ? AND issue_id = ?",
    )
    .bind(board_id)
    .bind(issue_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_db_err("failed to read board position", &e))?;

    if old.is_some() {
        sqlx::query("DELETE FROM board_issue_positions WHERE board_id = ? AND issue_id = ?")
            .bind(board_id)
            .bind(issue_id)
            .execute(conn)
            .await
            .map_err(|e| map_db_err("failed to remove board position", &e))?;
    }
    Ok(old.map(|(p,)| p))
}

/// Outcome of a placement computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementOutcome {
    /// Key assigned to the placed issue.
    pub key: String,
    /// `(issue_id, new_position)` for every row rewritten by a respace,
    /// placed issue excluded. Empty when no respace was needed.
    pub respaced: Vec<(String, String)>,
}

/// Place `issue_id` at visual `slot` among the positioned rows, respacing the
/// board when the midpoint exhausts the key budget. Writes every affected row
/// and returns them so the caller can journal the moves.
///
/// # Errors
///
/// Returns `Error::Database` on write failure or `Error::InvalidInput` on
/// malformed keys.
pub async fn compute_insert(
    conn: &mut SqliteConnection,
    board_id: &str,
    issue_id: &str,
    slot: usize,
) -> Result<PlacementOutcome> {
    // The moved issue never counts as its own neighbor.
    let existing: Vec<BoardPosition> = positions(&mut *conn, board_id)
        .await?
        .into_iter()
        .filter(|p| p.issue_id != issue_id)
        .collect();

    let slot = slot.min(existing.len());
    let lo = slot.checked_sub(1).map(|i| existing[i].position.as_str());
    let hi = existing.get(slot).map(|p| p.position.as_str());

    let key = ordering::key_between(lo, hi)?;
    if !ordering::exceeds_budget(&key) {
        set_position(conn, board_id, issue_id, &key).await?;
        return Ok(PlacementOutcome {
            key,
            respaced: Vec::new(),
        });
    }

    // Gap exhausted: respace every row evenly, then the slot has room again.
    // Clear first so a fresh key can never collide with a stale one mid-write.
    sqlx::query("DELETE FROM board_issue_positions WHERE board_id = ?")
        .bind(board_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_db_err("failed to clear board for respace", &e))?;

    let fresh = ordering::evenly_spaced(existing.len());
    let mut respaced = Vec::with_capacity(existing.len());
    for (row, new_key) in existing.iter().zip(&fresh) {
        set_position(&mut *conn, board_id, &row.issue_id, new_key).await?;
        if row.position != *new_key {
            respaced.push((row.issue_id.clone(), new_key.clone()));
        }
    }
    let lo = slot.checked_sub(1).map(|i| fresh[i].as_str());
    let hi = fresh.get(slot).map(String::as_str);
    let key = ordering::key_between(lo, hi)?;
    set_position(conn, board_id, issue_id, &key).await?;

    Ok(PlacementOutcome { key, respaced })
}

/// Board listing: explicitly positioned issues in key order, then issues
/// matching the default order (creation time) that have no position. A stable
/// zipper: placing an issue never reorders the others.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn list_board_issues(
    conn: &mut SqliteConnection,
    board_id: &str,
) -> Result<Vec<Issue>> {
    let placed = positions(&mut *conn, board_id).await?;
    let all = super::issues::list(&mut *conn, None).await?;

    let mut out = Vec::with_capacity(all.len());
    for position in &placed {
        if let Some(issue) = all.iter().find(|i| i.id == position.issue_id) {
            out.push(issue.clone());
        }
    }
    for issue in &all {
        if !placed.iter().any(|p| p.issue_id == issue.id) {
            out.push(issue.clone());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::temp_store;

    #[test]
    fn test_board_crud() {
        tokio_test::block_on(async {
            let (store, _dir) = temp_store().await;
            let mut conn = store.acquire().await.unwrap();

            let board = Board::new("Sprint 12");
            upsert_board(&mut conn, &board).await.unwrap();
            assert_eq!(
                get_board(&mut conn, &board.id).await.unwrap().unwrap().name,
                "Sprint 12"
            );

            delete_board(&mut conn, &board.id).await.unwrap();
            assert!(get_board(&mut conn, &board.id).await.unwrap().is_none());
        });
    }

    #[test]
    fn test_placement_orders_rows() {
        tokio_test::block_on(async {
            let (store, _dir) = temp_store().await;
            let mut conn = store.acquire().await.unwrap();

            let board = Board::new("b");
            upsert_board(&mut conn, &board).await.unwrap();

            // Append three issues, then squeeze one between the first two.
            for (i, issue) in ["i1", "i2", "i3"].iter().enumerate() {
                let outcome = compute_insert(&mut conn, &board.id, issue, i).await.unwrap();
                assert!(outcome.respaced.is_empty());
            }
            compute_insert(&mut conn, &board.id, "i4", 1).await.unwrap();

            let order: Vec<String> = positions(&mut conn, &board.id)
                .await
                .unwrap()
                .into_iter()
                .map(|p| p.issue_id)
                .collect();
            assert_eq!(order, vec!["i1", "i4", "i2", "i3"]);
        });
    }

    #[test]
    fn test_positions_stay_distinct_under_pressure() {
        tokio_test::block_on(async {
            let (store, _dir) = temp_store().await;
            let mut conn = store.acquire().await.unwrap();

            let board = Board::new("pressure");
            upsert_board(&mut conn, &board).await.unwrap();

            // Repeatedly inserting at the front halves the head gap each time
            // and eventually trips a respace.
            let mut saw_respace = false;
            for i in 0..220 {
                let outcome =
                    compute_insert(&mut conn, &board.id, &format!("i{i}"), 0).await.unwrap();
                saw_respace |= !outcome.respaced.is_empty();
            }
            assert!(saw_respace, "expected at least one respace");

            let rows = positions(&mut conn, &board.id).await.unwrap();
            assert_eq!(rows.len(), 220);
            for pair in rows.windows(2) {
                assert!(pair[0].position < pair[1].position);
            }
        });
    }

    #[test]
    fn test_listing_zips_positioned_then_default_order() {
        tokio_test::block_on(async {
            use td_core::IssueType;

            let (store, _dir) = temp_store().await;
            let mut conn = store.acquire().await.unwrap();

            let board = Board::new("zipper");
            upsert_board(&mut conn, &board).await.unwrap();

            let mut ids = Vec::new();
            for title in ["first", "second", "third"] {
                let issue =
                    Issue::new(title, IssueType::Task, "ses_test", "main").unwrap();
                crate::db::issues::insert(&mut conn, &issue).await.unwrap();
                ids.push(issue.id);
            }
            // Pin only the newest issue to the top of the board.
            compute_insert(&mut conn, &board.id, &ids[2], 0).await.unwrap();

            let listed: Vec<String> = list_board_issues(&mut conn, &board.id)
                .await
                .unwrap()
                .into_iter()
                .map(|i| i.id)
                .collect();
            assert_eq!(listed, vec![ids[2].clone(), ids[0].clone(), ids[1].clone()]);
        });
    }

    #[test]
    fn test_remove_position_returns_old_key() {
        tokio_test::block_on(async {
            let (store, _dir) = temp_store().await;
            let mut conn = store.acquire().await.unwrap();

            let board = Board::new("b");
            upsert_board(&mut conn, &board).await.unwrap();
            let outcome = compute_insert(&mut conn, &board.id, "i1", 0).await.unwrap();

            let old = remove_position(&mut conn, &board.id, "i1").await.unwrap();
            assert_eq!(old, Some(outcome.key));
            assert_eq!(remove_position(&mut conn, &board.id, "i1").await.unwrap(), None);
        });
    }
}
