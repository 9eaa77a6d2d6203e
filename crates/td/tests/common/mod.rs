//! Shared test support: a tempdir-backed store and an in-memory ordering
//! server with the same duplicate-handling contract as the real one.

// Each integration binary uses a different slice of these helpers.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use chrono::Utc;
use td::db::Store;
use td::sync::transport::SyncTransport;
use td_core::{
    protocol::{
        EventAck, EventRejection, ProjectStatus, PullResponse, PushRequest, PushResponse,
        RemoteEvent, SnapshotDownload, REJECT_REASON_DUPLICATE,
    },
    Error, Result,
};

/// Open a store on a fresh temp directory.
pub async fn temp_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("issues.db");
    let store = Store::create_or_open(&path).await.expect("create store");
    (store, dir)
}

/// In-memory ordering server.
#[derive(Default)]
pub struct FakeServer {
    state: Mutex<ServerState>,
    /// Batches larger than this fail the test.
    pub max_batch: usize,
    pub push_calls: AtomicUsize,
    pub pull_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub snapshot_calls: AtomicUsize,
    /// Error every push call returns, when set.
    pub fail_push: Mutex<Option<Error>>,
    /// Snapshot served to bootstrappers.
    pub snapshot: Mutex<Option<SnapshotDownload>>,
    /// Pretend credentials are missing.
    pub no_credentials: bool,
}

#[derive(Default)]
struct ServerState {
    next_seq: i64,
    events: Vec<RemoteEvent>,
    /// (device, client_action_id) -> server_seq, for duplicate rejection.
    seen: HashMap<(String, i64), i64>,
    batch_sizes: Vec<usize>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            max_batch: 500,
            ..Self::default()
        })
    }

    /// Sizes of the push batches received so far.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().expect("server lock").batch_sizes.clone()
    }

    /// Total events recorded.
    pub fn event_count(&self) -> usize {
        self.state.lock().expect("server lock").events.len()
    }

    /// Highest sequence assigned.
    pub fn last_seq(&self) -> i64 {
        self.state.lock().expect("server lock").next_seq
    }

    /// Seed an event as if another device had pushed it.
    pub fn seed_event(
        &self,
        device_id: &str,
        action: &str,
        entity: &str,
        entity_id: &str,
        payload: serde_json::Value,
    ) -> i64 {
        let mut state = self.state.lock().expect("server lock");
        state.next_seq += 1;
        let seq = state.next_seq;
        state.events.push(RemoteEvent {
            server_seq: seq,
            device_id: device_id.to_string(),
            session_id: "ses_peer".to_string(),
            client_action_id: seq,
            action_type: action.to_string(),
            entity_type: entity.to_string(),
            entity_id: entity_id.to_string(),
            payload,
            client_timestamp: Utc::now(),
        });
        seq
    }
}

/// Transport handle over a shared [`FakeServer`].
#[derive(Clone)]
pub struct FakeTransport(pub Arc<FakeServer>);

#[async_trait]
impl SyncTransport for FakeTransport {
    fn has_credentials(&self) -> bool {
        !self.0.no_credentials
    }

    async fn push_events(
        &self,
        _project_id: &str,
        request: &PushRequest,
    ) -> Result<PushResponse> {
        self.0.push_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.0.fail_push.lock().expect("server lock").clone() {
            return Err(err);
        }
        assert!(
            request.events.len() <= self.0.max_batch,
            "batch of {} exceeds server maximum {}",
            request.events.len(),
            self.0.max_batch
        );

        let mut state = self.0.state.lock().expect("server lock");
        state.batch_sizes.push(request.events.len());

        let mut acks = Vec::new();
        let mut rejected = Vec::new();
        for event in &request.events {
            let key = (request.device_id.clone(), event.client_action_id);
            if let Some(seq) = state.seen.get(&key) {
                rejected.push(EventRejection {
                    client_action_id: event.client_action_id,
                    reason: REJECT_REASON_DUPLICATE.to_string(),
                    server_seq: *seq,
                });
                continue;
            }
            state.next_seq += 1;
            let seq = state.next_seq;
            state.seen.insert(key, seq);
            state.events.push(RemoteEvent {
                server_seq: seq,
                device_id: request.device_id.clone(),
                session_id: request.session_id.clone(),
                client_action_id: event.client_action_id,
                action_type: event.action_type.clone(),
                entity_type: event.entity_type.clone(),
                entity_id: event.entity_id.clone(),
                payload: event.payload.clone(),
                client_timestamp: event.client_timestamp,
            });
            acks.push(EventAck {
                client_action_id: event.client_action_id,
                server_seq: seq,
            });
        }
        Ok(PushResponse {
            accepted: acks.len(),
            acks,
            rejected,
        })
    }

    async fn pull_events(
        &self,
        _project_id: &str,
        since: i64,
        limit: usize,
        device_id: &str,
    ) -> Result<PullResponse> {
        self.0.pull_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.0.state.lock().expect("server lock");

        let mut events = Vec::new();
        let mut last = since;
        let mut has_more = false;
        for event in state.events.iter().filter(|e| e.server_seq > since) {
            if events.len() == limit {
                has_more = true;
                break;
            }
            last = event.server_seq;
            // The server elides the requester's own events.
            if event.device_id != device_id {
                events.push(event.clone());
            }
        }
        Ok(PullResponse {
            events,
            last_server_seq: last,
            has_more,
        })
    }

    async fn project_status(&self, _project_id: &str) -> Result<ProjectStatus> {
        self.0.status_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.0.state.lock().expect("server lock");
        Ok(ProjectStatus {
            event_count: state.events.len() as i64,
            last_server_seq: state.next_seq,
            last_event_time: state.events.last().map(|e| e.client_timestamp),
        })
    }

    async fn fetch_snapshot(&self, _project_id: &str) -> Result<Option<SnapshotDownload>> {
        self.0.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.0.snapshot.lock().expect("server lock").clone())
    }
}
