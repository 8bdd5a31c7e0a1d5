//! Membership ledger
//!
//! Time-bounded assignments of users to permission groups. A membership is
//! active iff its flag is set and `expires_at` is unset or strictly after the
//! evaluation instant. Revocation deactivates rows; history is never deleted.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::audit::{AccessAuditRecord, AuditEvent, NewAuditRecord};
use crate::error::{PermissionError, Result};
use crate::store::{AssignOutcome, NewMembership, PermissionStore};
use crate::types::{GroupId, Membership, PermissionGroup, UserId};

/// Request to place a user in a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAssignment {
    pub user_id: UserId,
    pub group_id: GroupId,
    pub assigned_by: UserId,
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl GroupAssignment {
    pub fn new(user_id: UserId, group_id: GroupId, assigned_by: UserId) -> Self {
        Self {
            user_id,
            group_id,
            assigned_by,
            expires_at: None,
            reason: None,
        }
    }

    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

pub struct MembershipLedger {
    store: Arc<dyn PermissionStore>,
}

impl MembershipLedger {
    pub fn new(store: Arc<dyn PermissionStore>) -> Self {
        Self { store }
    }

    /// Groups the user actively belongs to at `as_of`, ascending and deduplicated
    pub async fn active_groups_for(&self, user_id: UserId, as_of: DateTime<Utc>) -> Result<Vec<GroupId>> {
        let groups: BTreeSet<GroupId> = self
            .active_memberships_for(user_id, as_of)
            .await?
            .into_iter()
            .map(|m| m.group_id)
            .collect();
        Ok(groups.into_iter().collect())
    }

    /// Membership rows active at `as_of`
    pub async fn active_memberships_for(
        &self,
        user_id: UserId,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<Membership>> {
        Ok(self
            .store
            .flagged_memberships(user_id)
            .await?
            .into_iter()
            .filter(|m| m.is_active_at(as_of))
            .collect())
    }

    /// Every membership row of the user, including revoked and expired ones
    pub async fn memberships_for(&self, user_id: UserId) -> Result<Vec<Membership>> {
        self.store.memberships_for_user(user_id).await
    }

    /// Idempotent assignment.
    ///
    /// Re-assigning an active membership with the same expiry returns the
    /// existing row and writes nothing. A different expiry is rejected with
    /// `DuplicateMembership`; the caller must revoke first.
    pub async fn assign(
        &self,
        group: &PermissionGroup,
        assignment: GroupAssignment,
        at: DateTime<Utc>,
    ) -> Result<AssignOutcome> {
        if !group.active {
            return Err(PermissionError::InvalidInput(format!(
                "Group '{}' is inactive",
                group.code
            )));
        }
        if group.requires_approval && assignment.assigned_by == assignment.user_id {
            return Err(PermissionError::InvalidInput(format!(
                "Group '{}' requires approval and cannot be self-assigned",
                group.code
            )));
        }
        if let Some(expires_at) = assignment.expires_at {
            if expires_at <= at {
                return Err(PermissionError::InvalidInput(
                    "expires_at must be in the future".to_string(),
                ));
            }
        }

        let audit = NewAuditRecord::mutation(
            AuditEvent::GroupAssigned,
            assignment.user_id,
            assignment.assigned_by,
            format!("grupo:{}", group.code),
            json!({
                "group_id": group.id,
                "risk_level": group.risk_level,
                "expires_at": assignment.expires_at,
                "reason": assignment.reason,
            }),
            at,
        );

        let outcome = self
            .store
            .assign_group(
                NewMembership {
                    user_id: assignment.user_id,
                    group_id: group.id,
                    assigned_by: assignment.assigned_by,
                    assigned_at: at,
                    expires_at: assignment.expires_at,
                    reason: assignment.reason,
                },
                at,
                audit,
            )
            .await?;

        match &outcome {
            AssignOutcome::Created { membership, .. } => info!(
                "User {} assigned to group '{}' by {} (membership {})",
                assignment.user_id, group.code, assignment.assigned_by, membership.id
            ),
            AssignOutcome::Existing(membership) => debug!(
                "User {} already in group '{}' (membership {})",
                assignment.user_id, group.code, membership.id
            ),
        }

        Ok(outcome)
    }

    /// Deactivate the user's active membership in the group
    pub async fn revoke(
        &self,
        user_id: UserId,
        group: &PermissionGroup,
        revoked_by: UserId,
        at: DateTime<Utc>,
    ) -> Result<(Membership, AccessAuditRecord)> {
        let audit = NewAuditRecord::mutation(
            AuditEvent::GroupRevoked,
            user_id,
            revoked_by,
            format!("grupo:{}", group.code),
            json!({ "group_id": group.id }),
            at,
        );

        let revoked = self
            .store
            .revoke_group(user_id, group.id, revoked_by, at, audit)
            .await?;

        info!(
            "User {} removed from group '{}' by {} (membership {})",
            user_id, group.code, revoked_by, revoked.0.id
        );
        Ok(revoked)
    }
}
