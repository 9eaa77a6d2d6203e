//! Wire contract for the sync ordering server.
//!
//! All requests and responses are JSON over HTTPS, authenticated by an API
//! key header. The server assigns every accepted event a monotonically
//! increasing `server_seq`; re-submissions of an already recorded
//! `client_action_id` come back as duplicate rejections carrying the original
//! sequence number, which clients treat as acknowledgements.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reason string the server uses for duplicate rejections.
pub const REJECT_REASON_DUPLICATE: &str = "duplicate";

// ═══════════════════════════════════════════════════════════════════════════
// PUSH
// ═══════════════════════════════════════════════════════════════════════════

/// One event in a push batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    /// Local journal id of the entry this event carries.
    pub client_action_id: i64,
    /// Action name, e.g. `create` or `board-set-position`.
    pub action_type: String,
    /// Entity table name, e.g. `issues`.
    pub entity_type: String,
    /// Row identifier.
    pub entity_id: String,
    /// Full new-data snapshot for creates and updates; empty for deletes.
    #[serde(default)]
    pub payload: Value,
    /// When the mutation happened on the client, RFC 3339.
    pub client_timestamp: DateTime<Utc>,
}

/// Body of `POST /v1/projects/{pid}/events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Stable identifier of this installation.
    pub device_id: String,
    /// Session attribution for the batch.
    pub session_id: String,
    /// Events in ascending client-action-id order.
    pub events: Vec<OutboundEvent>,
}

/// Acknowledgement for one accepted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAck {
    /// The client action id being acknowledged.
    pub client_action_id: i64,
    /// Global sequence the server assigned.
    pub server_seq: i64,
}

/// Rejection detail for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRejection {
    /// The client action id being rejected.
    pub client_action_id: i64,
    /// Why; `duplicate` means the event was already recorded.
    pub reason: String,
    /// For duplicates, the sequence assigned on first submission.
    #[serde(default)]
    pub server_seq: i64,
}

impl EventRejection {
    /// True when this rejection is really an acknowledgement of an earlier
    /// submission.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        self.reason == REJECT_REASON_DUPLICATE && self.server_seq > 0
    }
}

/// Response to a push batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    /// How many events were newly accepted.
    pub accepted: usize,
    /// Acknowledgements for newly accepted events.
    #[serde(default)]
    pub acks: Vec<EventAck>,
    /// Rejections, including duplicate re-submissions.
    #[serde(default)]
    pub rejected: Vec<EventRejection>,
}

// ═══════════════════════════════════════════════════════════════════════════
// PULL
// ═══════════════════════════════════════════════════════════════════════════

/// One event in the global order, as served to pullers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEvent {
    /// Global sequence assigned by the server.
    pub server_seq: i64,
    /// Installation that produced the event.
    pub device_id: String,
    /// Session that authored the mutation.
    pub session_id: String,
    /// Producer-local journal id.
    pub client_action_id: i64,
    /// Action name; unknown names are dropped by appliers.
    pub action_type: String,
    /// Entity table name; unknown names are dropped by appliers.
    pub entity_type: String,
    /// Row identifier.
    pub entity_id: String,
    /// Full new-data snapshot for creates and updates; empty for deletes.
    #[serde(default)]
    pub payload: Value,
    /// When the mutation happened on the producer, RFC 3339.
    pub client_timestamp: DateTime<Utc>,
}

/// Response to `GET /v1/projects/{pid}/events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Events strictly after the requested watermark, ascending.
    #[serde(default)]
    pub events: Vec<RemoteEvent>,
    /// Highest sequence in this page (the new watermark).
    pub last_server_seq: i64,
    /// True when another page is available.
    #[serde(default)]
    pub has_more: bool,
}

// ═══════════════════════════════════════════════════════════════════════════
// STATUS AND SNAPSHOT
// ═══════════════════════════════════════════════════════════════════════════

/// Response to `GET /v1/projects/{pid}/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectStatus {
    /// Total events the server holds for the project.
    pub event_count: i64,
    /// Highest sequence assigned so far.
    pub last_server_seq: i64,
    /// Time of the most recent event, when any exist.
    #[serde(default)]
    pub last_event_time: Option<DateTime<Utc>>,
}

/// A downloaded database snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDownload {
    /// Sequence the snapshot is current through; pulls resume from here.
    pub snapshot_seq: i64,
    /// Raw database image.
    pub bytes: Vec<u8>,
}
