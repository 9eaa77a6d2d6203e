//! End-to-end push/pull behavior against the in-memory ordering server.

mod common;

use std::sync::atomic::Ordering;

use chrono::Utc;
use common::{temp_store, FakeServer, FakeTransport};
use td::db::{actionlog, issues, sync_rows, Store};
use td::sync::engine::SyncEngine;
use td::workflow;
use td_core::{ActionKind, EntityKind, Error, FeatureGate, Issue, IssueType, Session};

fn engine_for(store: &Store, server: &std::sync::Arc<FakeServer>) -> SyncEngine<FakeTransport> {
    SyncEngine::new(
        store.clone(),
        FakeTransport(server.clone()),
        FeatureGate::default(),
    )
}

async fn link(engine: &SyncEngine<FakeTransport>) {
    engine.link("proj-test", false).await.expect("link");
}

/// Append `count` synthetic issue-create journal entries.
async fn seed_pending(store: &Store, count: usize) {
    let mut tx = store.begin().await.expect("begin");
    for i in 0..count {
        let entity_id = format!("td-{i:06x}");
        let payload = serde_json::json!({ "title": format!("issue {i}") });
        actionlog::append(
            &mut tx,
            "ses_seed",
            ActionKind::Create,
            &EntityKind::Issues,
            &entity_id,
            None,
            Some(&payload),
            Utc::now(),
        )
        .await
        .expect("append");
    }
    tx.commit().await.expect("commit");
}

#[tokio::test]
async fn batch_push_splits_at_500() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    let engine = engine_for(&store, &server);
    link(&engine).await;

    seed_pending(&store, 1200).await;
    let outcome = engine.push_once("ses_seed").await.unwrap();

    assert_eq!(outcome.batches, 3);
    assert_eq!(outcome.pushed, 1200);
    assert_eq!(server.batch_sizes(), vec![500, 500, 200]);

    let mut conn = store.acquire().await.unwrap();
    assert_eq!(actionlog::pending_count(&mut conn).await.unwrap(), 0);

    let state = sync_rows::require_state(&mut conn).await.unwrap();
    assert_eq!(state.last_pushed_action_id, 1200);
    assert!(state.last_sync_at.is_some());
}

#[tokio::test]
async fn exact_batch_boundary() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    let engine = engine_for(&store, &server);
    link(&engine).await;

    seed_pending(&store, 1000).await;
    let outcome = engine.push_once("ses_seed").await.unwrap();

    assert_eq!(outcome.batches, 2);
    assert_eq!(server.batch_sizes(), vec![500, 500]);
}

#[tokio::test]
async fn nothing_to_push_makes_no_calls() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    let engine = engine_for(&store, &server);
    link(&engine).await;

    let outcome = engine.push_once("ses_seed").await.unwrap();
    assert_eq!(outcome.batches, 0);
    assert_eq!(server.push_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn duplicate_replay_acks_with_original_seq() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    let engine = engine_for(&store, &server);
    link(&engine).await;

    seed_pending(&store, 1).await;
    engine.push_once("ses_seed").await.unwrap();
    assert_eq!(server.event_count(), 1);
    let first_seq = server.last_seq();

    // Simulate a crash after the server recorded the event but before the
    // ack landed locally: clear the mark and replay.
    let mut conn = store.acquire().await.unwrap();
    actionlog::reset_sync_marks(&mut conn).await.unwrap();
    drop(conn);

    let outcome = engine.push_once("ses_seed").await.unwrap();
    assert_eq!(outcome.pushed, 1);
    // Nothing new on the server, and the replay resolved to the original seq.
    assert_eq!(server.event_count(), 1);
    assert_eq!(server.last_seq(), first_seq);

    let mut conn = store.acquire().await.unwrap();
    assert_eq!(actionlog::pending_count(&mut conn).await.unwrap(), 0);
}

#[tokio::test]
async fn unauthorized_aborts_without_acks() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    *server.fail_push.lock().unwrap() = Some(Error::NotAuthenticated);
    let engine = engine_for(&store, &server);
    link(&engine).await;

    seed_pending(&store, 3).await;
    let result = engine.push_once("ses_seed").await;
    assert!(matches!(result, Err(Error::NotAuthenticated)));

    let mut conn = store.acquire().await.unwrap();
    assert_eq!(actionlog::pending_count(&mut conn).await.unwrap(), 3);
    let state = sync_rows::require_state(&mut conn).await.unwrap();
    assert_eq!(state.last_pushed_action_id, 0);
}

#[tokio::test]
async fn push_requires_link() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    let engine = engine_for(&store, &server);

    let result = engine.push_once("ses_seed").await;
    assert!(matches!(result, Err(Error::NotLinked)));
}

#[tokio::test]
async fn pull_pages_and_advances_watermark() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    let engine = engine_for(&store, &server);
    link(&engine).await;

    for i in 0..2500_usize {
        let issue = Issue::new(format!("issue {i}"), IssueType::Task, "ses_peer", "main")
            .unwrap();
        server.seed_event(
            "dev_peer",
            "create",
            "issues",
            &issue.id,
            serde_json::to_value(&issue).unwrap(),
        );
    }

    let outcome = engine.pull_once().await.unwrap();
    assert_eq!(outcome.pages, 3);
    assert_eq!(outcome.applied, 2500);

    let mut conn = store.acquire().await.unwrap();
    let state = sync_rows::require_state(&mut conn).await.unwrap();
    assert_eq!(state.last_pulled_server_seq, server.last_seq());

    // A second pull sees nothing new.
    let outcome = engine.pull_once().await.unwrap();
    assert_eq!(outcome.pages, 0);
    assert_eq!(outcome.applied, 0);
}

#[tokio::test]
async fn pull_records_conflict_for_locally_edited_row() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    let engine = engine_for(&store, &server);
    link(&engine).await;

    // Complete one sync so last_sync_at is set, then edit locally.
    engine.pull_once().await.unwrap();

    let session = Session::create("main", &td_core::Fingerprint::Override("t".into()));
    let mut conn = store.acquire().await.unwrap();
    td::db::sessions::insert(&mut conn, &session).await.unwrap();
    drop(conn);

    let issue = Issue::new("local edit", IssueType::Task, &session.id, "main").unwrap();
    workflow::create_issue(&store, &issue, &session).await.unwrap();

    // A peer updates the same issue remotely.
    let mut remote = issue.clone();
    remote.title = "peer title".to_string();
    remote.touch();
    server.seed_event(
        "dev_peer",
        "update",
        "issues",
        &issue.id,
        serde_json::to_value(&remote).unwrap(),
    );

    let outcome = engine.pull_once().await.unwrap();
    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.conflicts.len(), 1);
    assert_eq!(outcome.conflicts[0].entity_id, issue.id);

    let mut conn = store.acquire().await.unwrap();
    let stored = issues::get(&mut conn, &issue.id).await.unwrap().unwrap();
    assert_eq!(stored.title, "peer title");
    assert_eq!(sync_rows::list_conflicts(&mut conn).await.unwrap().len(), 1);
}

#[tokio::test]
async fn pull_skips_own_device_echoes() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    let engine = engine_for(&store, &server);
    link(&engine).await;

    // An event recorded under our own device id must never re-apply,
    // even when the server fails to elide it.
    let issue = Issue::new("echo", IssueType::Task, "ses_x", "main").unwrap();
    server.seed_event(
        store.device_id(),
        "create",
        "issues",
        &issue.id,
        serde_json::to_value(&issue).unwrap(),
    );

    let outcome = engine.pull_once().await.unwrap();
    assert_eq!(outcome.applied, 0);

    // The watermark still advances past the elided event.
    let mut conn = store.acquire().await.unwrap();
    let state = sync_rows::require_state(&mut conn).await.unwrap();
    assert_eq!(state.last_pulled_server_seq, server.last_seq());
    assert!(issues::get(&mut conn, &issue.id).await.unwrap().is_none());
}

#[tokio::test]
async fn push_then_pull_round_trip_between_devices() {
    let (store_a, _dir_a) = temp_store().await;
    let (store_b, _dir_b) = temp_store().await;
    let server = FakeServer::new();
    let engine_a = engine_for(&store_a, &server);
    let engine_b = engine_for(&store_b, &server);
    link(&engine_a).await;
    link(&engine_b).await;

    let session = Session::create("main", &td_core::Fingerprint::Override("a".into()));
    let mut conn = store_a.acquire().await.unwrap();
    td::db::sessions::insert(&mut conn, &session).await.unwrap();
    drop(conn);

    let issue = Issue::new("travels", IssueType::Task, &session.id, "main").unwrap();
    workflow::create_issue(&store_a, &issue, &session).await.unwrap();

    engine_a.push_once(&session.id).await.unwrap();
    engine_b.pull_once().await.unwrap();

    let mut conn = store_b.acquire().await.unwrap();
    let replicated = issues::get(&mut conn, &issue.id).await.unwrap().unwrap();
    assert_eq!(replicated.title, "travels");

    // And the origin device does not re-apply its own event.
    engine_a.pull_once().await.unwrap();
    let mut conn = store_a.acquire().await.unwrap();
    assert_eq!(sync_rows::list_conflicts(&mut conn).await.unwrap().len(), 0);
}

#[tokio::test]
async fn relink_requires_confirmation_and_resets_marks() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    let engine = engine_for(&store, &server);
    link(&engine).await;

    seed_pending(&store, 2).await;
    engine.push_once("ses_seed").await.unwrap();

    let denied = engine.link("proj-other", false).await;
    assert!(matches!(denied, Err(Error::Conflict(_))));

    engine.link("proj-other", true).await.unwrap();
    let mut conn = store.acquire().await.unwrap();
    // Everything is pending again for the replay against the new project.
    assert_eq!(actionlog::pending_count(&mut conn).await.unwrap(), 2);
    let state = sync_rows::require_state(&mut conn).await.unwrap();
    assert_eq!(state.project_id, "proj-other");
    assert_eq!(state.last_pulled_server_seq, 0);
}

#[tokio::test]
async fn unlink_clears_state() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    let engine = engine_for(&store, &server);
    link(&engine).await;

    engine.unlink().await.unwrap();
    let result = engine.push_once("ses_seed").await;
    assert!(matches!(result, Err(Error::NotLinked)));
}

#[tokio::test]
async fn sync_status_reports_both_sides() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    let engine = engine_for(&store, &server);
    link(&engine).await;

    seed_pending(&store, 3).await;
    server.seed_event("dev_peer", "create", "issues", "td-aaaaaa", serde_json::json!({}));

    let report = engine.sync_status().await.unwrap();
    assert_eq!(report.pending, 3);
    assert_eq!(report.remote.event_count, 1);
    assert_eq!(report.state.project_id, "proj-test");
}
