//! Error types shared across the td crates.
//!
//! Every fallible operation in the workspace returns [`Result`]. The variants
//! map one-to-one to the failure kinds the command layer knows how to present:
//! sync preconditions (`NotLinked`, `NotAuthenticated`), transport failures,
//! workflow guard rejections, and store-level errors.

use thiserror::Error;

/// The result type for td operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in td operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// No sync state row exists; the project has never been linked.
    #[error("project is not linked to a sync project; run 'td link <project-id>'")]
    NotLinked,

    /// Credentials are missing or were rejected by the server.
    #[error("not authenticated; set TD_AUTH_KEY or log in")]
    NotAuthenticated,

    /// Network failure or a non-success response without a structured body.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Structured 4xx rejection from the sync server.
    #[error("server rejected request (HTTP {status}): {message}")]
    ServerRejected {
        /// HTTP status code of the rejection.
        status: u16,
        /// Server-provided message.
        message: String,
    },

    /// An event payload failed to decode into its target entity.
    #[error("invalid payload for {entity} '{entity_id}': {reason}")]
    InvalidPayload {
        /// Entity type the payload was destined for.
        entity: String,
        /// Identifier of the entity.
        entity_id: String,
        /// Decode failure detail.
        reason: String,
    },

    /// A workflow guard refused the transition.
    #[error("transition denied: {0}")]
    TransitionDenied(String),

    /// Adding the dependency would close a cycle.
    #[error("dependency cycle: '{from}' already depends on '{to}'")]
    CycleDetected {
        /// Issue the dependency starts from.
        from: String,
        /// Issue the dependency points at.
        to: String,
    },

    /// Requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique-constraint collision.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Enum or field validation failure.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(String),

    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(String),

    /// Serialization or parsing failure.
    #[error("parse error: {0}")]
    Parse(String),
}

impl Error {
    /// Build a [`Error::Database`] from anything displayable.
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Build a [`Error::InvalidInput`] from anything displayable.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Build a [`Error::Transport`] from anything displayable.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Build a [`Error::NotFound`] from anything displayable.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// True when the error means credentials must be refreshed before retrying.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::NotAuthenticated)
    }

    /// True when retrying the same request later could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
