//! Issue aggregate and its value types.
//!
//! An [`Issue`] is the unit of work tracked by td. Invariants enforced here:
//! - status is one of the five workflow states
//! - story points are Fibonacci (or zero for unestimated)
//! - a closed issue carries `closed_at`; a deleted issue carries `deleted_at`
//!
//! Issues are soft-deleted only, so the delete can replicate through the
//! action log like any other mutation.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{Error, Result};

/// Story point values accepted for estimation. Zero means unestimated.
pub const FIBONACCI_POINTS: [u32; 7] = [1, 2, 3, 5, 8, 13, 21];

/// Prefix for issue identifiers.
pub const ISSUE_ID_PREFIX: &str = "td-";

// ═══════════════════════════════════════════════════════════════════════════
// ISSUE STATUS
// ═══════════════════════════════════════════════════════════════════════════

/// Workflow states an issue moves through.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IssueStatus {
    /// Not started.
    Open,
    /// Actively being worked on.
    InProgress,
    /// Waiting on something external.
    Blocked,
    /// Implementation finished, awaiting review.
    InReview,
    /// Done.
    Closed,
}

impl IssueStatus {
    /// Terminal states that stop parent cascades from re-firing.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ISSUE TYPE AND PRIORITY
// ═══════════════════════════════════════════════════════════════════════════

/// Classification of an issue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IssueType {
    /// Defect in existing behavior.
    Bug,
    /// New capability.
    Feature,
    /// Ordinary unit of work.
    Task,
    /// Parent grouping; cascades status from its children.
    Epic,
    /// Maintenance work.
    Chore,
}

/// Priority levels, P0 highest.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    /// Drop everything.
    P0,
    /// Urgent.
    P1,
    /// Normal.
    P2,
    /// Low.
    P3,
    /// Someday.
    P4,
}

// ═══════════════════════════════════════════════════════════════════════════
// ISSUE
// ═══════════════════════════════════════════════════════════════════════════

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    /// Identifier, `td-` plus six hex digits.
    pub id: String,
    /// One-line summary.
    pub title: String,
    /// Detailed description.
    #[serde(default)]
    pub description: String,
    /// What must be true for the issue to close.
    #[serde(default)]
    pub acceptance_criteria: String,
    /// Current workflow state.
    pub status: IssueStatus,
    /// Classification.
    pub issue_type: IssueType,
    /// Priority, P0 highest.
    pub priority: Priority,
    /// Story points; zero means unestimated, otherwise Fibonacci.
    #[serde(default)]
    pub points: u32,
    /// Free-form labels.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Parent issue, if this is a child of an epic or task.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Session that created the issue.
    pub creator_session: String,
    /// Session that started work, set on the first start transition.
    #[serde(default)]
    pub implementer_session: Option<String>,
    /// Session that approved or rejected the review.
    #[serde(default)]
    pub reviewer_session: Option<String>,
    /// Minor issues are exempt from the self-review prohibition.
    #[serde(default)]
    pub minor: bool,
    /// Branch the issue was created on.
    #[serde(default)]
    pub created_branch: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Set when the issue reached Closed.
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    /// Set on soft delete; deleted issues are hidden from default listings.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Issue {
    /// Create a new open issue.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if the title is empty.
    pub fn new(
        title: impl Into<String>,
        issue_type: IssueType,
        creator_session: impl Into<String>,
        created_branch: impl Into<String>,
    ) -> Result<Self> {
        let title = title.into();
        if title.trim().is_empty() {
            return Err(Error::invalid_input("issue title must not be empty"));
        }
        let now = Utc::now();
        Ok(Self {
            id: new_issue_id(),
            title,
            description: String::new(),
            acceptance_criteria: String::new(),
            status: IssueStatus::Open,
            issue_type,
            priority: Priority::P2,
            points: 0,
            labels: Vec::new(),
            parent_id: None,
            creator_session: creator_session.into(),
            implementer_session: None,
            reviewer_session: None,
            minor: false,
            created_branch: created_branch.into(),
            created_at: now,
            updated_at: now,
            closed_at: None,
            deleted_at: None,
        })
    }

    /// Set story points, validating against the Fibonacci set.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if the value is neither zero nor Fibonacci.
    pub fn set_points(&mut self, points: u32) -> Result<()> {
        validate_points(points)?;
        self.points = points;
        self.touch();
        Ok(())
    }

    /// Mark the issue soft-deleted.
    pub fn soft_delete(&mut self) {
        let now = Utc::now();
        self.deleted_at = Some(now);
        self.updated_at = now;
    }

    /// Undo a soft delete.
    pub fn restore(&mut self) {
        self.deleted_at = None;
        self.touch();
    }

    /// True when the issue is hidden from default listings.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Bump the last-mutation timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Validate a story-point value against the Fibonacci set (zero allowed).
///
/// # Errors
///
/// Returns `Error::InvalidInput` for non-Fibonacci, non-zero values.
pub fn validate_points(points: u32) -> Result<()> {
    if points == 0 || FIBONACCI_POINTS.contains(&points) {
        Ok(())
    } else {
        Err(Error::invalid_input(format!(
            "story points must be one of {FIBONACCI_POINTS:?} (got {points})"
        )))
    }
}

/// Mint a new issue id: `td-` plus six lowercase hex digits.
#[must_use]
pub fn new_issue_id() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
    format!("{ISSUE_ID_PREFIX}{n:06x}")
}
