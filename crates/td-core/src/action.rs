//! Action log entry types.
//!
//! Every local mutation appends one entry: what happened, to which entity,
//! authored by which session, with JSON snapshots of the data before and
//! after. Entries drive undo locally and replication remotely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use strum::{Display, EnumString};

use crate::{issue::Issue, Error, Result};

// ═══════════════════════════════════════════════════════════════════════════
// ACTION AND ENTITY KINDS
// ═══════════════════════════════════════════════════════════════════════════

/// What a journal entry records.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ActionKind {
    /// Entity created.
    Create,
    /// Entity fields changed.
    Update,
    /// Entity soft-deleted.
    Delete,
    /// Soft delete undone.
    Restore,
    /// Work started.
    Start,
    /// Work put back to open.
    Unstart,
    /// Issue closed.
    Close,
    /// Submitted for review.
    Review,
    /// Review accepted.
    Approve,
    /// Review sent back.
    Reject,
    /// Issue blocked.
    Block,
    /// Block cleared.
    Unblock,
    /// Issue reopened.
    Reopen,
    /// A prior entry was undone.
    Undone,
    /// Board created.
    BoardCreate,
    /// Board renamed or reconfigured.
    BoardUpdate,
    /// Board deleted.
    BoardDelete,
    /// Issue placed at a position on a board.
    BoardSetPosition,
    /// Issue removed from a board.
    BoardUnposition,
    /// Session row created.
    SessionCreated,
    /// Session resumed after rotation.
    SessionStarted,
    /// Dependency edge added.
    DependencyAdd,
}

/// Which table a journal entry touches.
///
/// The set is open-ended on the wire: peers running newer builds may journal
/// entity types this build does not know, so parsing never fails and unknown
/// names survive as [`EntityKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Issues.
    Issues,
    /// Work logs.
    Logs,
    /// Issue comments.
    Comments,
    /// Handoff notes between sessions.
    Handoffs,
    /// Boards.
    Boards,
    /// Sessions.
    WorkSessions,
    /// Fractional board positions.
    BoardIssuePositions,
    /// Dependency edges.
    IssueDependencies,
    /// File attachments.
    IssueFiles,
    /// Free-form notes (feature-gated).
    Notes,
    /// Anything this build does not recognize.
    Other(String),
}

impl EntityKind {
    const NAMES: &'static [(&'static str, &'static Self)] = &[
        ("issues", &Self::Issues),
        ("logs", &Self::Logs),
        ("comments", &Self::Comments),
        ("handoffs", &Self::Handoffs),
        ("boards", &Self::Boards),
        ("work_sessions", &Self::WorkSessions),
        ("board_issue_positions", &Self::BoardIssuePositions),
        ("issue_dependencies", &Self::IssueDependencies),
        ("issue_files", &Self::IssueFiles),
        ("notes", &Self::Notes),
    ];

    /// Parse a wire name; unknown names become [`EntityKind::Other`].
    #[must_use]
    pub fn parse(name: &str) -> Self {
        Self::NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map_or_else(|| Self::Other(name.to_string()), |(_, kind)| (*kind).clone())
    }

    /// Wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Issues => "issues",
            Self::Logs => "logs",
            Self::Comments => "comments",
            Self::Handoffs => "handoffs",
            Self::Boards => "boards",
            Self::WorkSessions => "work_sessions",
            Self::BoardIssuePositions => "board_issue_positions",
            Self::IssueDependencies => "issue_dependencies",
            Self::IssueFiles => "issue_files",
            Self::Notes => "notes",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl Serialize for EntityKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntityKind {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::parse(&name))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ACTION LOG ENTRY
// ═══════════════════════════════════════════════════════════════════════════

/// One record per mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    /// Dense, strictly increasing client action id.
    pub id: i64,
    /// Session that authored the mutation.
    pub session_id: String,
    /// What happened.
    pub action: ActionKind,
    /// Which table.
    pub entity: EntityKind,
    /// Which row.
    pub entity_id: String,
    /// Snapshot before the mutation.
    #[serde(default)]
    pub previous_data: Option<Value>,
    /// Snapshot after the mutation.
    #[serde(default)]
    pub new_data: Option<Value>,
    /// When the mutation happened.
    pub timestamp: DateTime<Utc>,
    /// Undone entries are skipped by sync.
    #[serde(default)]
    pub undone: bool,
    /// Non-null once the server acknowledged the entry.
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

impl ActionLogEntry {
    /// Decode `previous_data` as an issue snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPayload` when the blob is present but does not
    /// decode as an issue.
    pub fn previous_issue(&self) -> Result<Option<Issue>> {
        decode_issue(self.previous_data.as_ref(), &self.entity_id)
    }

    /// Decode `new_data` as an issue snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPayload` when the blob is present but does not
    /// decode as an issue.
    pub fn new_issue(&self) -> Result<Option<Issue>> {
        decode_issue(self.new_data.as_ref(), &self.entity_id)
    }

    /// True when the entry still awaits a server acknowledgement.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.synced_at.is_none() && !self.undone
    }
}

fn decode_issue(data: Option<&Value>, entity_id: &str) -> Result<Option<Issue>> {
    data.map(|value| {
        serde_json::from_value(value.clone()).map_err(|e| Error::InvalidPayload {
            entity: "issues".to_string(),
            entity_id: entity_id.to_string(),
            reason: e.to_string(),
        })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::IssueType;

    #[test]
    fn test_action_kind_wire_names() {
        assert_eq!(ActionKind::BoardSetPosition.to_string(), "board-set-position");
        assert_eq!(ActionKind::SessionCreated.to_string(), "session-created");
        assert_eq!(
            "dependency-add".parse::<ActionKind>().unwrap(),
            ActionKind::DependencyAdd
        );
    }

    #[test]
    fn test_entity_kind_round_trip() {
        for name in [
            "issues",
            "logs",
            "comments",
            "handoffs",
            "boards",
            "work_sessions",
            "board_issue_positions",
            "issue_dependencies",
            "issue_files",
            "notes",
        ] {
            assert_eq!(EntityKind::parse(name).as_str(), name);
        }
    }

    #[test]
    fn test_entity_kind_unknown_survives() {
        let kind = EntityKind::parse("time_entries");
        assert_eq!(kind, EntityKind::Other("time_entries".to_string()));
        assert_eq!(kind.as_str(), "time_entries");
    }

    #[test]
    fn test_entity_kind_serde_uses_wire_name() {
        let json = serde_json::to_string(&EntityKind::WorkSessions).unwrap();
        assert_eq!(json, "\"work_sessions\"");
        let back: EntityKind = serde_json::from_str("\"issues\"").unwrap();
        assert_eq!(back, EntityKind::Issues);
    }

    #[test]
    fn test_typed_issue_accessor() {
        let issue = Issue::new("t", IssueType::Task, "ses_a", "main").unwrap();
        let entry = ActionLogEntry {
            id: 1,
            session_id: "ses_a".to_string(),
            action: ActionKind::Create,
            entity: EntityKind::Issues,
            entity_id: issue.id.clone(),
            previous_data: None,
            new_data: Some(serde_json::to_value(&issue).unwrap()),
            timestamp: Utc::now(),
            undone: false,
            synced_at: None,
        };
        assert_eq!(entry.new_issue().unwrap().unwrap().id, issue.id);
        assert!(entry.previous_issue().unwrap().is_none());
        assert!(entry.is_pending());
    }

    #[test]
    fn test_bad_blob_is_invalid_payload() {
        let entry = ActionLogEntry {
            id: 1,
            session_id: "ses_a".to_string(),
            action: ActionKind::Update,
            entity: EntityKind::Issues,
            entity_id: "td-abc123".to_string(),
            previous_data: Some(serde_json::json!({"nope": true})),
            new_data: None,
            timestamp: Utc::now(),
            undone: false,
            synced_at: None,
        };
        assert!(matches!(
            entry.previous_issue(),
            Err(Error::InvalidPayload { .. })
        ));
    }
}
