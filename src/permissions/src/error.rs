//! Error types for the permission engine

use thiserror::Error;

/// Permission engine errors
///
/// These are surfaced by administrative mutations and read projections. The
/// access-check path never returns them: it folds every failure into a denied
/// [`Decision`](crate::resolver::Decision) instead.
#[derive(Debug, Error)]
pub enum PermissionError {
    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Capability code is not in the catalog (or is inactive)
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    /// Function code is not in the catalog
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// User is not registered
    #[error("Unknown user: {0}")]
    UnknownUser(i64),

    /// Permission group does not exist
    #[error("Unknown permission group: {0}")]
    UnknownGroup(String),

    /// Exception row does not exist
    #[error("Unknown exception: {0}")]
    UnknownException(i64),

    /// An active membership for the pair already exists with different terms
    #[error("User {user_id} already has an active membership in group {group_id} (membership {membership_id})")]
    DuplicateMembership {
        user_id: i64,
        group_id: i64,
        membership_id: i64,
    },

    /// No active membership for the pair
    #[error("User {user_id} has no active membership in group {group_id}")]
    MembershipNotFound { user_id: i64, group_id: i64 },

    /// The group already confers the capability
    #[error("Group {group_id} already grants capability '{capability}'")]
    DuplicateGroupCapability { group_id: i64, capability: String },

    /// Unique code collision in the catalog or group registry
    #[error("Duplicate code: {0}")]
    DuplicateCode(String),

    /// A racing mutation touched the same (user, group) or (user, capability) pair
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Hard delete rejected because live grants still reference the row
    #[error("Protected reference: {0}")]
    ProtectedReference(String),

    /// Operation did not complete within its deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Audit record could not be persisted
    #[error("Audit write failed: {0}")]
    AuditFailure(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PermissionError {
    /// Whether the caller may retry the same mutation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PermissionError::ConcurrentModification(_) | PermissionError::Timeout(_)
        )
    }
}

/// Result type for permission operations
pub type Result<T> = std::result::Result<T, PermissionError>;
