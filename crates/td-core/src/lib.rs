//! Core domain types for td.
//!
//! Pure calculations only: issue and session types, the workflow state
//! machine, sparse board ordering, the sync wire contract, and configuration.
//! Everything that touches the database, the network, or the process
//! environment beyond reading variables lives in the `td` application crate.

pub mod action;
pub mod config;
pub mod error;
pub mod issue;
pub mod ordering;
pub mod protocol;
pub mod session;
pub mod workflow;

pub use action::{ActionKind, ActionLogEntry, EntityKind};
pub use config::{FeatureGate, SyncSettings};
pub use error::{Error, Result};
pub use issue::{Issue, IssueStatus, IssueType, Priority};
pub use session::{AgentKind, Fingerprint, Session};
pub use workflow::TransitionAction;
