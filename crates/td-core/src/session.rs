//! Session identity: who authored a mutation.
//!
//! A session is keyed by (branch, agent fingerprint). The fingerprint prefers
//! the `TD_SESSION_ID` environment override; otherwise it is derived from the
//! agent kind and process id discovered by inspecting the parent process.
//! Rotation rules are pure calculations here; the database side lives in the
//! application crate.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Prefix for session identifiers.
pub const SESSION_ID_PREFIX: &str = "ses_";

/// Environment override for the agent fingerprint.
pub const SESSION_ENV_OVERRIDE: &str = "TD_SESSION_ID";

// ═══════════════════════════════════════════════════════════════════════════
// AGENT FINGERPRINT
// ═══════════════════════════════════════════════════════════════════════════

/// Kind of agent driving the CLI.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AgentKind {
    /// Claude Code.
    Claude,
    /// Cursor agent.
    Cursor,
    /// Aider.
    Aider,
    /// Codex CLI.
    Codex,
    /// Interactive human shell.
    Human,
    /// Could not be determined.
    Unknown,
}

impl AgentKind {
    /// Classify a parent-process executable name.
    #[must_use]
    pub fn from_process_name(name: &str) -> Self {
        let name = name.to_lowercase();
        if name.contains("claude") {
            Self::Claude
        } else if name.contains("cursor") {
            Self::Cursor
        } else if name.contains("aider") {
            Self::Aider
        } else if name.contains("codex") {
            Self::Codex
        } else if matches!(name.as_str(), "bash" | "zsh" | "fish" | "sh" | "nu") {
            Self::Human
        } else {
            Self::Unknown
        }
    }
}

/// Stable identity of the process lineage invoking td.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Fingerprint {
    /// Explicit override from `TD_SESSION_ID`.
    Override(String),
    /// Derived from the parent process.
    Process {
        /// Classified agent kind.
        agent: AgentKind,
        /// Parent process id.
        pid: u32,
    },
}

impl Fingerprint {
    /// Canonical string form, stored on the session row.
    #[must_use]
    pub fn as_key(&self) -> String {
        match self {
            Self::Override(id) => format!("env:{id}"),
            Self::Process { agent, pid } => format!("{agent}:{pid}"),
        }
    }

    /// Agent kind behind this fingerprint.
    #[must_use]
    pub const fn agent_kind(&self) -> AgentKind {
        match self {
            Self::Override(_) => AgentKind::Unknown,
            Self::Process { agent, .. } => *agent,
        }
    }

    /// Process id behind this fingerprint, when derived from one.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        match self {
            Self::Override(_) => None,
            Self::Process { pid, .. } => Some(*pid),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SESSION
// ═══════════════════════════════════════════════════════════════════════════

/// The identity that authored action-log entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Identifier, `ses_` plus eight base36 characters.
    pub id: String,
    /// Branch name at creation.
    pub branch: String,
    /// Fingerprint key at creation.
    pub fingerprint: String,
    /// Classified agent kind.
    pub agent_kind: AgentKind,
    /// Agent process id when known.
    #[serde(default)]
    pub agent_pid: Option<u32>,
    /// When the session began.
    pub started_at: DateTime<Utc>,
    /// Last time the session authored an action.
    pub last_activity: DateTime<Utc>,
    /// Session this one rotated from.
    #[serde(default)]
    pub previous_session_id: Option<String>,
    /// Optional human-friendly name.
    #[serde(default)]
    pub name: Option<String>,
    /// True only for the first retrieval after a rotation. Not persisted.
    #[serde(skip)]
    pub is_new: bool,
}

impl Session {
    /// Create a fresh session for (branch, fingerprint).
    #[must_use]
    pub fn create(branch: impl Into<String>, fingerprint: &Fingerprint) -> Self {
        let now = Utc::now();
        Self {
            id: new_session_id(),
            branch: branch.into(),
            fingerprint: fingerprint.as_key(),
            agent_kind: fingerprint.agent_kind(),
            agent_pid: fingerprint.pid(),
            started_at: now,
            last_activity: now,
            previous_session_id: None,
            name: None,
            is_new: true,
        }
    }

    /// Create the successor of `self` after a rotation.
    #[must_use]
    pub fn rotate_into(&self, branch: impl Into<String>, fingerprint: &Fingerprint) -> Self {
        let mut next = Self::create(branch, fingerprint);
        next.previous_session_id = Some(self.id.clone());
        next
    }
}

/// Decide whether an existing session can be re-used for (branch, fingerprint).
///
/// Re-use requires the same branch, the same fingerprint key, and recent
/// activity within `idle_window`. Anything else rotates.
#[must_use]
pub fn can_reuse(
    current: &Session,
    branch: &str,
    fingerprint: &Fingerprint,
    idle_window: Duration,
    now: DateTime<Utc>,
) -> bool {
    current.branch == branch
        && current.fingerprint == fingerprint.as_key()
        && now - current.last_activity <= idle_window
}

/// Mint a new session id: `ses_` plus eight base36 characters.
#[must_use]
pub fn new_session_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let tail: String = (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{SESSION_ID_PREFIX}{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp() -> Fingerprint {
        Fingerprint::Process {
            agent: AgentKind::Claude,
            pid: 4242,
        }
    }

    #[test]
    fn test_session_id_shape() {
        let id = new_session_id();
        assert!(id.starts_with(SESSION_ID_PREFIX));
        assert_eq!(id.len(), SESSION_ID_PREFIX.len() + 8);
    }

    #[test]
    fn test_agent_kind_classification() {
        assert_eq!(AgentKind::from_process_name("claude"), AgentKind::Claude);
        assert_eq!(AgentKind::from_process_name("Claude Code"), AgentKind::Claude);
        assert_eq!(AgentKind::from_process_name("cursor-agent"), AgentKind::Cursor);
        assert_eq!(AgentKind::from_process_name("zsh"), AgentKind::Human);
        assert_eq!(AgentKind::from_process_name("systemd"), AgentKind::Unknown);
    }

    #[test]
    fn test_fingerprint_keys() {
        assert_eq!(fp().as_key(), "claude:4242");
        let env = Fingerprint::Override("my-session".to_string());
        assert_eq!(env.as_key(), "env:my-session");
        assert_eq!(env.pid(), None);
    }

    #[test]
    fn test_create_is_new() {
        let session = Session::create("main", &fp());
        assert!(session.is_new);
        assert_eq!(session.branch, "main");
        assert_eq!(session.agent_pid, Some(4242));
        assert!(session.previous_session_id.is_none());
    }

    #[test]
    fn test_rotation_links_previous() {
        let old = Session::create("main", &fp());
        let next = old.rotate_into("feature/sync", &fp());
        assert_eq!(next.previous_session_id.as_deref(), Some(old.id.as_str()));
        assert_ne!(next.id, old.id);
        assert!(next.is_new);
    }

    #[test]
    fn test_reuse_same_key_within_window() {
        let session = Session::create("main", &fp());
        let now = session.last_activity + Duration::hours(1);
        assert!(can_reuse(&session, "main", &fp(), Duration::hours(8), now));
    }

    #[test]
    fn test_reuse_rejected_on_branch_change() {
        let session = Session::create("main", &fp());
        let now = session.last_activity;
        assert!(!can_reuse(&session, "feature/x", &fp(), Duration::hours(8), now));
    }

    #[test]
    fn test_reuse_rejected_on_fingerprint_change() {
        let session = Session::create("main", &fp());
        let other = Fingerprint::Process {
            agent: AgentKind::Claude,
            pid: 9999,
        };
        let now = session.last_activity;
        assert!(!can_reuse(&session, "main", &other, Duration::hours(8), now));
    }

    #[test]
    fn test_reuse_rejected_past_idle_window() {
        let session = Session::create("main", &fp());
        let now = session.last_activity + Duration::hours(9);
        assert!(!can_reuse(&session, "main", &fp(), Duration::hours(8), now));
    }
}
