//! Auto-sync scheduler behavior: hooks, debounce, in-flight guard.

mod common;

use std::{sync::atomic::Ordering, time::Duration};

use chrono::Utc;
use common::{temp_store, FakeServer, FakeTransport};
use td::db::{actionlog, Store};
use td::sync::{auto::AutoSync, engine::SyncEngine};
use td_core::{ActionKind, EntityKind, FeatureGate, SyncSettings};

fn engine_for(store: &Store, server: &std::sync::Arc<FakeServer>) -> SyncEngine<FakeTransport> {
    SyncEngine::new(
        store.clone(),
        FakeTransport(server.clone()),
        FeatureGate::default(),
    )
}

async fn seed_one_pending(store: &Store) {
    let mut tx = store.begin().await.unwrap();
    actionlog::append(
        &mut tx,
        "ses_seed",
        ActionKind::Create,
        &EntityKind::Issues,
        "td-000001",
        None,
        Some(&serde_json::json!({"title": "x"})),
        Utc::now(),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
}

fn settings(debounce: Duration) -> SyncSettings {
    SyncSettings {
        debounce,
        ..SyncSettings::default()
    }
}

#[tokio::test]
async fn startup_then_mutation_fires_twice() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    let engine = engine_for(&store, &server);
    engine.link("proj-test", false).await.unwrap();

    let auto = AutoSync::new(settings(Duration::from_secs(2)));

    auto.on_startup("create", &engine, "ses_seed").await;
    // Startup must not arm the debounce.
    assert!(auto.last_auto_sync_at().is_none());
    assert_eq!(server.pull_calls.load(Ordering::SeqCst), 1);

    auto.on_after_mutation(&engine, "ses_seed").await;
    assert!(auto.last_auto_sync_at().is_some());
    assert_eq!(server.pull_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn startup_skips_listed_commands() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    let engine = engine_for(&store, &server);
    engine.link("proj-test", false).await.unwrap();

    let auto = AutoSync::new(settings(Duration::from_secs(2)));
    for cmd in ["sync", "auth", "login", "version", "help"] {
        auto.on_startup(cmd, &engine, "ses_seed").await;
    }
    assert_eq!(server.pull_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn mutation_hook_debounces() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    let engine = engine_for(&store, &server);
    engine.link("proj-test", false).await.unwrap();

    let auto = AutoSync::new(settings(Duration::from_secs(60)));

    auto.on_after_mutation(&engine, "ses_seed").await;
    auto.on_after_mutation(&engine, "ses_seed").await;
    auto.on_after_mutation(&engine, "ses_seed").await;
    assert_eq!(server.pull_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn zero_debounce_allows_back_to_back() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    let engine = engine_for(&store, &server);
    engine.link("proj-test", false).await.unwrap();

    let auto = AutoSync::new(settings(Duration::ZERO));
    auto.on_after_mutation(&engine, "ses_seed").await;
    auto.on_after_mutation(&engine, "ses_seed").await;
    assert_eq!(server.pull_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn in_flight_guard_short_circuits() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    let engine = engine_for(&store, &server);
    engine.link("proj-test", false).await.unwrap();

    let auto = AutoSync::new(settings(Duration::ZERO));
    assert!(auto.seize_in_flight());

    auto.auto_sync_once(&engine, "ses_seed").await;
    assert_eq!(server.push_calls.load(Ordering::SeqCst), 0);
    assert_eq!(server.pull_calls.load(Ordering::SeqCst), 0);
    // The guard stays held by the original owner.
    assert!(auto.is_in_flight());
    auto.release_in_flight();
}

#[tokio::test]
async fn auto_sync_swallows_push_failures() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    *server.fail_push.lock().unwrap() = Some(td_core::Error::transport("connection refused"));
    let engine = engine_for(&store, &server);
    engine.link("proj-test", false).await.unwrap();
    seed_one_pending(&store).await;

    let auto = AutoSync::new(settings(Duration::ZERO));
    // Must not panic or propagate; the entry simply stays pending.
    auto.auto_sync_once(&engine, "ses_seed").await;

    let mut conn = store.acquire().await.unwrap();
    assert_eq!(actionlog::pending_count(&mut conn).await.unwrap(), 1);
    assert!(!auto.is_in_flight());
}

#[tokio::test]
async fn auto_sync_skips_when_not_linked() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    let engine = engine_for(&store, &server);

    let auto = AutoSync::new(settings(Duration::ZERO));
    auto.auto_sync_once(&engine, "ses_seed").await;
    assert_eq!(server.push_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn auto_sync_skips_without_credentials() {
    let (store, _dir) = temp_store().await;
    let mut server_inner = FakeServer::default();
    server_inner.max_batch = 500;
    server_inner.no_credentials = true;
    let server = std::sync::Arc::new(server_inner);
    let engine = engine_for(&store, &server);
    engine.link("proj-test", false).await.unwrap();
    seed_one_pending(&store).await;

    let auto = AutoSync::new(settings(Duration::ZERO));
    auto.auto_sync_once(&engine, "ses_seed").await;
    assert_eq!(server.push_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn disabled_auto_sync_never_calls_out() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    let engine = engine_for(&store, &server);
    engine.link("proj-test", false).await.unwrap();
    seed_one_pending(&store).await;

    let auto = AutoSync::new(SyncSettings {
        enabled: false,
        ..SyncSettings::default()
    });
    auto.on_startup("create", &engine, "ses_seed").await;
    auto.auto_sync_once(&engine, "ses_seed").await;
    assert_eq!(server.push_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn pull_disabled_pushes_only() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    let engine = engine_for(&store, &server);
    engine.link("proj-test", false).await.unwrap();
    seed_one_pending(&store).await;

    let auto = AutoSync::new(SyncSettings {
        pull_enabled: false,
        debounce: Duration::ZERO,
        ..SyncSettings::default()
    });
    auto.on_after_mutation(&engine, "ses_seed").await;
    assert_eq!(server.push_calls.load(Ordering::SeqCst), 1);
    assert_eq!(server.pull_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn sync_disabled_flag_respected() {
    let (store, _dir) = temp_store().await;
    let server = FakeServer::new();
    let engine = engine_for(&store, &server);
    engine.link("proj-test", false).await.unwrap();

    let mut conn = store.acquire().await.unwrap();
    let mut state = td::db::sync_rows::require_state(&mut conn).await.unwrap();
    state.sync_disabled = true;
    td::db::sync_rows::put_state(&mut conn, &state).await.unwrap();
    drop(conn);
    seed_one_pending(&store).await;

    let auto = AutoSync::new(settings(Duration::ZERO));
    auto.auto_sync_once(&engine, "ses_seed").await;
    assert_eq!(server.push_calls.load(Ordering::SeqCst), 0);
}
