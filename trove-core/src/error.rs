//! Error taxonomy for the consistency core.
//!
//! Precondition violations (version/lock/constraint/value-format) are
//! synchronous and pre-mutation: the whole operation is rejected before any
//! state is touched. Staleness is reported at commit time as `InvalidState`
//! and leaves the caller's overlay intact. Indexing failures are recovered
//! locally by the indexing task and never reach the committer.

use crate::item::ItemId;

/// Result type for core repository operations
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Errors that can occur in the consistency core
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Wrong arity, failed conversion, invalid reference target, or a
    /// heterogeneously-typed array
    #[error("Value format error: {0}")]
    ValueFormat(String),

    /// Mutation below a checked-in ancestor
    #[error("Version conflict: {0}")]
    VersionConflict(String),

    /// The owning node is locked by another session
    #[error("Lock conflict: {0}")]
    LockConflict(String),

    /// The property definition marks the target protected
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Stale commit: the persistent base changed under the overlay
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Item not found: {0}")]
    NotFound(ItemId),

    /// Unexpected failure while materializing a value, wrapped with the
    /// offending item's identity
    #[error("Internal error on {item}: {message}")]
    Internal { item: ItemId, message: String },

    #[error("Index error: {0}")]
    Index(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}
