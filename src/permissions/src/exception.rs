//! Exception ledger
//!
//! Per-user, per-capability overrides in either direction. An exception is
//! active iff its flag is set and `starts_at <= as_of <= ends_at` (an unset
//! `ends_at` is open-ended). Historical rows are kept; revocation only clears
//! the flag.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::info;

use crate::audit::{AccessAuditRecord, AuditEvent, NewAuditRecord};
use crate::error::{PermissionError, Result};
use crate::store::{NewException, PermissionStore};
use crate::types::{Capability, CapabilityId, ExceptionId, ExceptionKind, ExceptionalGrant, UserId};

/// Request to create an exceptional grant or revoke
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRequest {
    pub user_id: UserId,
    pub capability_code: String,
    pub kind: ExceptionKind,
    pub reason: String,
    pub authorized_by: UserId,

    /// Defaults to the engine clock when unset
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl ExceptionRequest {
    pub fn grant(
        user_id: UserId,
        capability_code: impl Into<String>,
        reason: impl Into<String>,
        authorized_by: UserId,
    ) -> Self {
        Self {
            user_id,
            capability_code: capability_code.into(),
            kind: ExceptionKind::Grant,
            reason: reason.into(),
            authorized_by,
            starts_at: None,
            ends_at: None,
        }
    }

    pub fn revoke(
        user_id: UserId,
        capability_code: impl Into<String>,
        reason: impl Into<String>,
        authorized_by: UserId,
    ) -> Self {
        Self {
            kind: ExceptionKind::Revoke,
            ..Self::grant(user_id, capability_code, reason, authorized_by)
        }
    }

    pub fn starting_at(mut self, starts_at: DateTime<Utc>) -> Self {
        self.starts_at = Some(starts_at);
        self
    }

    pub fn ending_at(mut self, ends_at: DateTime<Utc>) -> Self {
        self.ends_at = Some(ends_at);
        self
    }
}

/// Newest first: `created_at` descending, then id descending
pub fn sort_newest_first(exceptions: &mut [ExceptionalGrant]) {
    exceptions.sort_by_key(|e| Reverse((e.created_at, e.id)));
}

pub struct ExceptionLedger {
    store: Arc<dyn PermissionStore>,
}

impl ExceptionLedger {
    pub fn new(store: Arc<dyn PermissionStore>) -> Self {
        Self { store }
    }

    /// Exceptions for the pair active at `as_of`, newest first
    pub async fn active_exceptions_for(
        &self,
        user_id: UserId,
        capability_id: CapabilityId,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<ExceptionalGrant>> {
        let mut active: Vec<ExceptionalGrant> = self
            .store
            .flagged_exceptions(user_id, Some(capability_id))
            .await?
            .into_iter()
            .filter(|e| e.is_active_at(as_of))
            .collect();
        sort_newest_first(&mut active);
        Ok(active)
    }

    /// Every flagged exception of the user, for any capability, newest first.
    /// Rows outside their window are included so callers can see upcoming
    /// boundaries.
    pub async fn flagged_for_user(&self, user_id: UserId) -> Result<Vec<ExceptionalGrant>> {
        let mut flagged = self.store.flagged_exceptions(user_id, None).await?;
        sort_newest_first(&mut flagged);
        Ok(flagged)
    }

    pub async fn exception(&self, exception_id: ExceptionId) -> Result<ExceptionalGrant> {
        self.store
            .exception_by_id(exception_id)
            .await?
            .ok_or(PermissionError::UnknownException(exception_id))
    }

    /// Record an override; `capability` must be the active catalog row for
    /// `request.capability_code`
    pub async fn grant(
        &self,
        capability: &Capability,
        request: ExceptionRequest,
        at: DateTime<Utc>,
    ) -> Result<(ExceptionalGrant, AccessAuditRecord)> {
        if request.reason.trim().is_empty() {
            return Err(PermissionError::InvalidInput(
                "An exception requires a reason".to_string(),
            ));
        }

        let starts_at = request.starts_at.unwrap_or(at);
        if let Some(ends_at) = request.ends_at {
            if ends_at <= starts_at {
                return Err(PermissionError::InvalidInput(
                    "ends_at must be after starts_at".to_string(),
                ));
            }
        }

        let event = AuditEvent::ExceptionGranted;
        let audit = NewAuditRecord::mutation(
            event,
            request.user_id,
            request.authorized_by,
            capability.code.clone(),
            json!({
                "kind": request.kind,
                "starts_at": starts_at,
                "ends_at": request.ends_at,
                "reason": request.reason,
                "sensitivity": capability.sensitivity,
            }),
            at,
        );

        let (row, record) = self
            .store
            .insert_exception(
                NewException {
                    user_id: request.user_id,
                    capability_id: capability.id,
                    kind: request.kind,
                    starts_at,
                    ends_at: request.ends_at,
                    reason: request.reason,
                    authorized_by: request.authorized_by,
                    created_at: at,
                },
                audit,
            )
            .await?;

        info!(
            "Exception {} ({}) on '{}' for user {} authorized by {}",
            row.id, row.kind, row.capability_code, row.user_id, request.authorized_by
        );
        Ok((row, record))
    }

    /// Deactivate an exception row
    pub async fn revoke(
        &self,
        exception_id: ExceptionId,
        revoked_by: UserId,
        at: DateTime<Utc>,
    ) -> Result<(ExceptionalGrant, AccessAuditRecord)> {
        let current = self.exception(exception_id).await?;

        let audit = NewAuditRecord::mutation(
            AuditEvent::ExceptionRevoked,
            current.user_id,
            revoked_by,
            current.capability_code.clone(),
            json!({ "kind": current.kind }),
            at,
        );

        let revoked = self
            .store
            .revoke_exception(exception_id, revoked_by, at, audit)
            .await?;

        info!(
            "Exception {} on '{}' for user {} revoked by {}",
            exception_id, current.capability_code, current.user_id, revoked_by
        );
        Ok(revoked)
    }
}
