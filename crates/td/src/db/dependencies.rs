//! Issue dependency edges with cycle rejection.
//!
//! The graph is small (one row per edge), so cycle checks rebuild a petgraph
//! from the stored edges and ask whether the proposed edge would close a
//! path back to its origin.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use petgraph::{algo::has_path_connecting, graph::DiGraph};
use sqlx::SqliteConnection;
use td_core::{Error, Result};

use super::rows::{map_db_err, to_millis};

/// All dependency edges as `(issue_id, depends_on)`.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn edges(conn: &mut SqliteConnection) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT issue_id, depends_on FROM issue_dependencies")
            .fetch_all(conn)
            .await
            .map_err(|e| map_db_err("failed to list dependency edges", &e))?;
    Ok(rows)
}

/// Direct dependencies of one issue.
///
/// # Errors
///
/// Returns `Error::Database` on query failure.
pub async fn depends_on(conn: &mut SqliteConnection, issue_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT depends_on FROM issue_dependencies WHERE issue_id = ? ORDER BY depends_on",
    )
    .bind(issue_id)
    .fetch_all(conn)
    .await
    .map_err(|e| map_db_err("failed to list dependencies", &e))?;
    Ok(rows.into_iter().map(|(d,)| d).collect())
}

/// Would adding `from -> to` close a cycle in the current graph?
///
/// True exactly when `to` already depends on `from`, transitively.
#[must_use]
pub fn would_cycle(existing: &[(String, String)], from: &str, to: &str) -> bool {
    if from == to {
        return true;
    }
    let mut graph = DiGraph::<(), ()>::new();
    let mut nodes: HashMap<&str, _> = HashMap::new();
    let ids = existing
        .iter()
        .flat_map(|(a, b)| [a.as_str(), b.as_str()])
        .chain([from, to]);
    for id in ids {
        nodes.entry(id).or_insert_with(|| graph.add_node(()));
    }
    for (a, b) in existing {
        graph.add_edge(nodes[a.as_str()], nodes[b.as_str()], ());
    }
    has_path_connecting(&graph, nodes[to], nodes[from], None)
}

/// Insert a dependency edge, rejecting self-references and cycles.
///
/// # Errors
///
/// Returns `Error::CycleDetected` when the edge would close a cycle, or
/// `Error::Conflict` when it already exists.
pub async fn add(
    conn: &mut SqliteConnection,
    issue_id: &str,
    depends_on_id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    let existing = edges(&mut *conn).await?;
    if would_cycle(&existing, issue_id, depends_on_id) {
        return Err(Error::CycleDetected {
            from: issue_id.to_string(),
            to: depends_on_id.to_string(),
        });
    }
    sqlx::query(
        "INSERT INTO issue_dependencies (issue_id, depends_on, created_at) VALUES (?, ?, ?)",
    )
    .bind(issue_id)
    .bind(depends_on_id)
    .bind(to_millis(at))
    .execute(conn)
    .await
    .map(|_| ())
    .map_err(|e| map_db_err("failed to add dependency", &e))
}

/// Insert an edge replicated from a peer, skipping silently when present.
///
/// # Errors
///
/// Returns `Error::Database` on failure.
pub async fn upsert(
    conn: &mut SqliteConnection,
    issue_id: &str,
    depends_on_id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO issue_dependencies (issue_id, depends_on, created_at) \
         VALUES (?, ?, ?)",
    )
    .bind(issue_id)
    .bind(depends_on_id)
    .bind(to_millis(at))
    .execute(conn)
    .await
    .map(|_| ())
    .map_err(|e| map_db_err("failed to upsert dependency", &e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::temp_store;

    fn edge(a: &str, b: &str) -> (String, String) {
        (a.to_string(), b.to_string())
    }

    #[test]
    fn test_self_reference_is_cycle() {
        assert!(would_cycle(&[], "a", "a"));
    }

    #[test]
    fn test_direct_cycle() {
        let existing = vec![edge("a", "b")];
        assert!(would_cycle(&existing, "b", "a"));
        assert!(!would_cycle(&existing, "a", "c"));
    }

    #[test]
    fn test_transitive_cycle() {
        let existing = vec![edge("a", "b"), edge("b", "c"), edge("c", "d")];
        assert!(would_cycle(&existing, "d", "a"));
        assert!(!would_cycle(&existing, "a", "d"));
    }

    #[test]
    fn test_add_rejects_cycle() {
        tokio_test::block_on(async {
            let (store, _dir) = temp_store().await;
            let mut conn = store.acquire().await.unwrap();

            add(&mut conn, "a", "b", Utc::now()).await.unwrap();
            add(&mut conn, "b", "c", Utc::now()).await.unwrap();

            let result = add(&mut conn, "c", "a", Utc::now()).await;
            assert!(matches!(result, Err(Error::CycleDetected { .. })));

            assert_eq!(depends_on(&mut conn, "a").await.unwrap(), vec!["b"]);
        });
    }

    #[test]
    fn test_add_duplicate_is_conflict() {
        tokio_test::block_on(async {
            let (store, _dir) = temp_store().await;
            let mut conn = store.acquire().await.unwrap();

            add(&mut conn, "a", "b", Utc::now()).await.unwrap();
            let result = add(&mut conn, "a", "b", Utc::now()).await;
            assert!(matches!(result, Err(Error::Conflict(_))));

            // Replicated inserts are idempotent instead.
            upsert(&mut conn, "a", "b", Utc::now()).await.unwrap();
        });
    }
}
