//! Workflow state machine for issue status transitions.
//!
//! The allowed transitions live in one table; guards are pure functions over
//! `(issue, action, session, force)` so they can be tested without a store.
//! Cascade targets for epic parents are computed here and applied by the
//! application crate.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    issue::{Issue, IssueStatus, IssueType},
    Error, Result,
};

// ═══════════════════════════════════════════════════════════════════════════
// TRANSITION ACTIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Actions that move an issue between workflow states.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TransitionAction {
    /// Begin work.
    Start,
    /// Put work back to open.
    Unstart,
    /// Mark blocked on something external.
    Block,
    /// Clear a block.
    Unblock,
    /// Submit for review.
    Review,
    /// Accept a review.
    Approve,
    /// Send a review back to implementation.
    Reject,
    /// Finish without review.
    Close,
    /// Bring a closed or in-review issue back to open.
    Reopen,
}

/// The transition table: `(from, action, to)`.
///
/// Starting a blocked issue appears here, but `check` additionally requires
/// the explicit force flag for that row.
pub const TRANSITIONS: &[(IssueStatus, TransitionAction, IssueStatus)] = &[
    (IssueStatus::Open, TransitionAction::Start, IssueStatus::InProgress),
    (IssueStatus::Open, TransitionAction::Block, IssueStatus::Blocked),
    (IssueStatus::Open, TransitionAction::Close, IssueStatus::Closed),
    (IssueStatus::Open, TransitionAction::Review, IssueStatus::InReview),
    (IssueStatus::InProgress, TransitionAction::Review, IssueStatus::InReview),
    (IssueStatus::InProgress, TransitionAction::Block, IssueStatus::Blocked),
    (IssueStatus::InProgress, TransitionAction::Unstart, IssueStatus::Open),
    (IssueStatus::InProgress, TransitionAction::Close, IssueStatus::Closed),
    (IssueStatus::Blocked, TransitionAction::Unblock, IssueStatus::Open),
    (IssueStatus::Blocked, TransitionAction::Start, IssueStatus::InProgress),
    (IssueStatus::InReview, TransitionAction::Approve, IssueStatus::Closed),
    (IssueStatus::InReview, TransitionAction::Reject, IssueStatus::InProgress),
    (IssueStatus::InReview, TransitionAction::Reopen, IssueStatus::Open),
    (IssueStatus::Closed, TransitionAction::Reopen, IssueStatus::Open),
    (IssueStatus::Closed, TransitionAction::Start, IssueStatus::InProgress),
];

/// Look up the target state for `(from, action)` in the table.
#[must_use]
pub fn target(from: IssueStatus, action: TransitionAction) -> Option<IssueStatus> {
    TRANSITIONS
        .iter()
        .find(|(f, a, _)| *f == from && *a == action)
        .map(|(_, _, to)| *to)
}

// ═══════════════════════════════════════════════════════════════════════════
// GUARDS
// ═══════════════════════════════════════════════════════════════════════════

/// True when session `s` may act on the review of `issue`.
///
/// An issue is reviewable by `s` iff it is in review and either the issue is
/// minor or `s` is not the implementer.
#[must_use]
pub fn reviewable_by(issue: &Issue, session_id: &str) -> bool {
    issue.status == IssueStatus::InReview
        && (issue.minor || issue.implementer_session.as_deref() != Some(session_id))
}

/// True when session `s` may approve `issue`.
///
/// Approval requires the reviewer rule and, unless minor, that `s` did not
/// create the issue.
#[must_use]
pub fn approvable_by(issue: &Issue, session_id: &str) -> bool {
    reviewable_by(issue, session_id) && (issue.minor || issue.creator_session != session_id)
}

/// Validate a transition and return the target state.
///
/// # Errors
///
/// Returns `Error::TransitionDenied` when the table has no row for
/// `(status, action)`, when starting a blocked issue without `force`, when
/// submitting a non-minor open issue straight to review, or when the acting
/// session fails the review attribution rules.
pub fn check(
    issue: &Issue,
    action: TransitionAction,
    session_id: &str,
    force: bool,
) -> Result<IssueStatus> {
    let Some(to) = target(issue.status, action) else {
        return Err(Error::TransitionDenied(format!(
            "cannot {action} issue '{}' in status {}",
            issue.id, issue.status
        )));
    };

    if issue.status == IssueStatus::Blocked && action == TransitionAction::Start && !force {
        return Err(Error::TransitionDenied(format!(
            "issue '{}' is blocked; pass --force to start it anyway",
            issue.id
        )));
    }

    // Open issues may skip straight to review only when self-reviewable.
    if issue.status == IssueStatus::Open && action == TransitionAction::Review && !issue.minor {
        return Err(Error::TransitionDenied(format!(
            "issue '{}' has not been started; only minor issues go straight to review",
            issue.id
        )));
    }

    match action {
        TransitionAction::Approve => {
            if !approvable_by(issue, session_id) {
                return Err(Error::TransitionDenied(format!(
                    "session {session_id} may not approve issue '{}' it implemented or created",
                    issue.id
                )));
            }
        }
        TransitionAction::Reject => {
            if !reviewable_by(issue, session_id) {
                return Err(Error::TransitionDenied(format!(
                    "session {session_id} may not review issue '{}' it implemented",
                    issue.id
                )));
            }
        }
        _ => {}
    }

    Ok(to)
}

// ═══════════════════════════════════════════════════════════════════════════
// PARENT CASCADE
// ═══════════════════════════════════════════════════════════════════════════

/// Compute the cascade target for a parent whose non-deleted children carry
/// the given statuses.
///
/// The parent follows its children only when every child agrees on InReview
/// or Closed. Cascades never fire through non-epic parents and skip parents
/// already at the target.
#[must_use]
pub fn cascade_target(
    parent_type: IssueType,
    parent_status: IssueStatus,
    children_statuses: &[IssueStatus],
) -> Option<IssueStatus> {
    if parent_type != IssueType::Epic || children_statuses.is_empty() {
        return None;
    }
    let first = children_statuses[0];
    if !matches!(first, IssueStatus::InReview | IssueStatus::Closed) {
        return None;
    }
    if children_statuses.iter().any(|s| *s != first) {
        return None;
    }
    if parent_status == first || parent_status.is_terminal() {
        return None;
    }
    Some(first)
}

/// Action recorded in the journal for a cascade into `to`.
#[must_use]
pub const fn cascade_action(to: IssueStatus) -> TransitionAction {
    match to {
        IssueStatus::Closed => TransitionAction::Close,
        _ => TransitionAction::Review,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::IssueType;

    fn issue_in(status: IssueStatus) -> Issue {
        let mut issue = Issue::new("t", IssueType::Task, "ses_creator", "main").unwrap();
        issue.status = status;
        issue
    }

    #[test]
    fn test_target_lookup() {
        assert_eq!(
            target(IssueStatus::Open, TransitionAction::Start),
            Some(IssueStatus::InProgress)
        );
        assert_eq!(target(IssueStatus::Open, TransitionAction::Approve), None);
        assert_eq!(
            target(IssueStatus::Closed, TransitionAction::Start),
            Some(IssueStatus::InProgress)
        );
    }

    #[test]
    fn test_blocked_start_requires_force() {
        let issue = issue_in(IssueStatus::Blocked);
        let denied = check(&issue, TransitionAction::Start, "ses_x", false);
        assert!(matches!(denied, Err(Error::TransitionDenied(_))));

        let forced = check(&issue, TransitionAction::Start, "ses_x", true).unwrap();
        assert_eq!(forced, IssueStatus::InProgress);
    }

    #[test]
    fn test_open_to_review_only_when_minor() {
        let issue = issue_in(IssueStatus::Open);
        assert!(check(&issue, TransitionAction::Review, "ses_x", false).is_err());

        let mut minor = issue_in(IssueStatus::Open);
        minor.minor = true;
        assert_eq!(
            check(&minor, TransitionAction::Review, "ses_x", false).unwrap(),
            IssueStatus::InReview
        );
    }

    #[test]
    fn test_implementer_cannot_reject_own_work() {
        let mut issue = issue_in(IssueStatus::InReview);
        issue.implementer_session = Some("ses_impl".to_string());

        assert!(check(&issue, TransitionAction::Reject, "ses_impl", false).is_err());
        assert_eq!(
            check(&issue, TransitionAction::Reject, "ses_other", false).unwrap(),
            IssueStatus::InProgress
        );
    }

    #[test]
    fn test_creator_cannot_approve_unless_minor() {
        let mut issue = issue_in(IssueStatus::InReview);
        issue.implementer_session = Some("ses_impl".to_string());

        assert!(check(&issue, TransitionAction::Approve, "ses_creator", false).is_err());

        issue.minor = true;
        assert_eq!(
            check(&issue, TransitionAction::Approve, "ses_creator", false).unwrap(),
            IssueStatus::Closed
        );
    }

    #[test]
    fn test_minor_widens_reviewable_set() {
        let mut issue = issue_in(IssueStatus::InReview);
        issue.implementer_session = Some("ses_impl".to_string());
        assert!(!reviewable_by(&issue, "ses_impl"));

        issue.minor = true;
        assert!(reviewable_by(&issue, "ses_impl"));
    }

    #[test]
    fn test_not_reviewable_outside_in_review() {
        let issue = issue_in(IssueStatus::InProgress);
        assert!(!reviewable_by(&issue, "ses_other"));
    }

    #[test]
    fn test_cascade_all_closed() {
        let statuses = [IssueStatus::Closed, IssueStatus::Closed, IssueStatus::Closed];
        assert_eq!(
            cascade_target(IssueType::Epic, IssueStatus::Open, &statuses),
            Some(IssueStatus::Closed)
        );
    }

    #[test]
    fn test_cascade_mixed_statuses() {
        let statuses = [IssueStatus::Closed, IssueStatus::InReview];
        assert_eq!(cascade_target(IssueType::Epic, IssueStatus::Open, &statuses), None);
    }

    #[test]
    fn test_cascade_requires_epic_parent() {
        let statuses = [IssueStatus::Closed];
        assert_eq!(cascade_target(IssueType::Task, IssueStatus::Open, &statuses), None);
    }

    #[test]
    fn test_cascade_skips_settled_parent() {
        let statuses = [IssueStatus::Closed, IssueStatus::Closed];
        assert_eq!(
            cascade_target(IssueType::Epic, IssueStatus::Closed, &statuses),
            None
        );
    }

    #[test]
    fn test_cascade_ignores_open_children() {
        let statuses = [IssueStatus::Open, IssueStatus::Open];
        assert_eq!(cascade_target(IssueType::Epic, IssueStatus::Open, &statuses), None);
    }

    #[test]
    fn test_cascade_action_mapping() {
        assert_eq!(cascade_action(IssueStatus::Closed), TransitionAction::Close);
        assert_eq!(cascade_action(IssueStatus::InReview), TransitionAction::Review);
    }
}
