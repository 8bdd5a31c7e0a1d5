//! Persistence for the permission tables
//!
//! [`PermissionStore`] is the data-access layer behind every component. It owns
//! the referential rules of the model:
//!
//! - function/group capability links cascade with either parent
//! - capabilities and groups referenced by memberships or exceptions cannot be
//!   hard-deleted (deactivate them instead)
//! - deleting a user cascades their memberships and exceptions and nulls their
//!   actor references everywhere, including the audit trail
//!
//! Administrative mutations take the audit record they must produce and apply
//! both atomically, so a membership or exception change is never persisted
//! without its audit entry (or the other way round).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AccessAuditRecord, AuditQuery, NewAuditRecord};
use crate::error::Result;
use crate::types::{
    Capability, CapabilityId, ExceptionId, ExceptionKind, ExceptionalGrant, Function,
    FunctionCapability, FunctionId, GroupId, Membership, PermissionGroup, UserId,
};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Membership to create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMembership {
    pub user_id: UserId,
    pub group_id: GroupId,
    pub assigned_by: UserId,
    pub assigned_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

/// Exceptional grant or revoke to create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewException {
    pub user_id: UserId,
    pub capability_id: CapabilityId,
    pub kind: ExceptionKind,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub reason: String,
    pub authorized_by: UserId,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an idempotent group assignment
#[derive(Debug, Clone)]
pub enum AssignOutcome {
    /// A new row was inserted and audited
    Created {
        membership: Membership,
        audit: AccessAuditRecord,
    },
    /// An identical active membership already existed; nothing was written
    Existing(Membership),
}

impl AssignOutcome {
    pub fn membership(&self) -> &Membership {
        match self {
            AssignOutcome::Created { membership, .. } => membership,
            AssignOutcome::Existing(membership) => membership,
        }
    }
}

/// Storage backend for catalog, groups, ledgers and audit trail
#[async_trait]
pub trait PermissionStore: Send + Sync {
    // ------------------------------------------------------------------
    // Users (owned by the external user directory)
    // ------------------------------------------------------------------

    /// Make a user known to the engine (idempotent)
    async fn register_user(&self, user_id: UserId) -> Result<()>;

    async fn user_exists(&self, user_id: UserId) -> Result<bool>;

    /// Remove a user: cascades memberships and exceptions, nulls actor references
    async fn delete_user(&self, user_id: UserId) -> Result<()>;

    // ------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------

    async fn insert_function(&self, function: Function) -> Result<Function>;

    async fn insert_capability(&self, capability: Capability) -> Result<Capability>;

    async fn link_function_capability(&self, link: FunctionCapability) -> Result<()>;

    async fn function_by_code(&self, code: &str) -> Result<Option<Function>>;

    async fn list_functions(&self) -> Result<Vec<Function>>;

    /// Links of a function joined with their capability rows
    async fn function_capabilities(
        &self,
        function_id: FunctionId,
    ) -> Result<Vec<(FunctionCapability, Capability)>>;

    async fn capability_by_code(&self, code: &str) -> Result<Option<Capability>>;

    async fn set_function_active(&self, function_id: FunctionId, active: bool) -> Result<()>;

    async fn set_capability_active(&self, capability_id: CapabilityId, active: bool) -> Result<()>;

    /// Hard delete; cascades function links
    async fn delete_function(&self, function_id: FunctionId) -> Result<()>;

    /// Hard delete; rejected with `ProtectedReference` while exceptions reference it
    async fn delete_capability(&self, capability_id: CapabilityId) -> Result<()>;

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    async fn insert_group(&self, group: PermissionGroup) -> Result<PermissionGroup>;

    /// Fails with `DuplicateGroupCapability` when the link exists
    async fn grant_group_capability(&self, group_id: GroupId, capability_id: CapabilityId) -> Result<()>;

    /// Returns whether a link was removed
    async fn revoke_group_capability(&self, group_id: GroupId, capability_id: CapabilityId) -> Result<bool>;

    async fn group_by_id(&self, group_id: GroupId) -> Result<Option<PermissionGroup>>;

    async fn group_by_code(&self, code: &str) -> Result<Option<PermissionGroup>>;

    async fn groups_by_ids(&self, group_ids: &[GroupId]) -> Result<Vec<PermissionGroup>>;

    /// Capabilities conferred by each of the given groups
    async fn group_capabilities(&self, group_ids: &[GroupId]) -> Result<Vec<(GroupId, Capability)>>;

    async fn set_group_active(&self, group_id: GroupId, active: bool) -> Result<()>;

    /// Hard delete; cascades capability links, rejected while memberships reference it
    async fn delete_group(&self, group_id: GroupId) -> Result<()>;

    // ------------------------------------------------------------------
    // Membership ledger
    // ------------------------------------------------------------------

    /// Every membership row of a user, history included
    async fn memberships_for_user(&self, user_id: UserId) -> Result<Vec<Membership>>;

    /// Rows of a user whose `active` flag is set (expiry not applied)
    async fn flagged_memberships(&self, user_id: UserId) -> Result<Vec<Membership>>;

    /// Idempotent assignment, atomically audited.
    ///
    /// - identical active membership at `as_of`: returns it, writes nothing
    /// - active membership with different expiry: `DuplicateMembership`
    /// - flagged row already expired at `as_of`: it is deactivated and a new
    ///   row inserted
    async fn assign_group(
        &self,
        membership: NewMembership,
        as_of: DateTime<Utc>,
        audit: NewAuditRecord,
    ) -> Result<AssignOutcome>;

    /// Deactivate the flagged row for the pair, atomically audited
    async fn revoke_group(
        &self,
        user_id: UserId,
        group_id: GroupId,
        revoked_by: UserId,
        at: DateTime<Utc>,
        audit: NewAuditRecord,
    ) -> Result<(Membership, AccessAuditRecord)>;

    // ------------------------------------------------------------------
    // Exception ledger
    // ------------------------------------------------------------------

    /// Rows with the `active` flag set for a user, optionally narrowed to one capability
    async fn flagged_exceptions(
        &self,
        user_id: UserId,
        capability_id: Option<CapabilityId>,
    ) -> Result<Vec<ExceptionalGrant>>;

    async fn exception_by_id(&self, exception_id: ExceptionId) -> Result<Option<ExceptionalGrant>>;

    async fn insert_exception(
        &self,
        exception: NewException,
        audit: NewAuditRecord,
    ) -> Result<(ExceptionalGrant, AccessAuditRecord)>;

    /// Deactivate an exception row, atomically audited
    async fn revoke_exception(
        &self,
        exception_id: ExceptionId,
        revoked_by: UserId,
        at: DateTime<Utc>,
        audit: NewAuditRecord,
    ) -> Result<(ExceptionalGrant, AccessAuditRecord)>;

    // ------------------------------------------------------------------
    // Audit trail
    // ------------------------------------------------------------------

    /// Append a record at the head of the hash chain
    async fn append_audit(&self, record: NewAuditRecord) -> Result<AccessAuditRecord>;

    /// Records matching the query, newest first
    async fn query_audit(&self, query: &AuditQuery) -> Result<Vec<AccessAuditRecord>>;

    /// The whole chain in ascending sequence order
    async fn audit_chain(&self) -> Result<Vec<AccessAuditRecord>>;
}
