//! Access resolution
//!
//! [`decide`] is the precedence algorithm. It is a pure function of the
//! gathered [`Evidence`] and the evaluation instant and never reads the wall
//! clock:
//!
//! 1. unknown or inactive capability: `Denied(UnknownCapability)`
//! 2. unknown user: `Denied(UnknownUser)`
//! 3. any active revoke exception: `Denied(ExplicitRevoke)`
//! 4. any active grant exception: `Allowed(ExplicitGrant)`
//! 5. an active group conferring the capability: `Allowed(GroupMembership)`
//! 6. otherwise `Denied(NoGrant)`
//!
//! When several active exceptions of the same kind exist, the most recently
//! created one is reported (ties broken by highest id). When several groups
//! confer the capability, the lowest group id is reported.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::catalog::CapabilityCatalog;
use crate::error::Result;
use crate::exception::ExceptionLedger;
use crate::groups::GroupRegistry;
use crate::membership::MembershipLedger;
use crate::store::PermissionStore;
use crate::types::{
    Capability, CapabilityCode, ExceptionId, ExceptionKind, ExceptionalGrant, GroupId, Membership,
    UserId,
};

/// Outcome of an access check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allowed,
    Denied,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allowed => "allowed",
            Verdict::Denied => "denied",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a decision came out the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    ExplicitGrant,
    GroupMembership,
    UnknownCapability,
    UnknownUser,
    ExplicitRevoke,
    NoGrant,
    AuditFailure,
    Timeout,
    LedgerUnavailable,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::ExplicitGrant => "explicit_grant",
            DecisionReason::GroupMembership => "group_membership",
            DecisionReason::UnknownCapability => "unknown_capability",
            DecisionReason::UnknownUser => "unknown_user",
            DecisionReason::ExplicitRevoke => "explicit_revoke",
            DecisionReason::NoGrant => "no_grant",
            DecisionReason::AuditFailure => "audit_failure",
            DecisionReason::Timeout => "timeout",
            DecisionReason::LedgerUnavailable => "ledger_unavailable",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which source decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchedVia {
    Exception,
    Group,
    None,
}

/// Access decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: DecisionReason,
    pub matched_via: MatchedVia,
    pub user_id: UserId,
    pub capability: CapabilityCode,

    /// Instant the decision was evaluated at
    pub as_of: DateTime<Utc>,

    /// Exception that decided, when `matched_via == Exception`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_id: Option<ExceptionId>,

    /// Group that decided, when `matched_via == Group`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
}

impl Decision {
    /// A denial that no ledger row caused
    pub fn denied(
        user_id: UserId,
        capability: impl Into<CapabilityCode>,
        as_of: DateTime<Utc>,
        reason: DecisionReason,
    ) -> Self {
        Self {
            allowed: false,
            reason,
            matched_via: MatchedVia::None,
            user_id,
            capability: capability.into(),
            as_of,
            exception_id: None,
            group_id: None,
        }
    }

    fn from_exception(user_id: UserId, capability: &str, as_of: DateTime<Utc>, exception: &ExceptionalGrant) -> Self {
        let (allowed, reason) = match exception.kind {
            ExceptionKind::Revoke => (false, DecisionReason::ExplicitRevoke),
            ExceptionKind::Grant => (true, DecisionReason::ExplicitGrant),
        };
        Self {
            allowed,
            reason,
            matched_via: MatchedVia::Exception,
            user_id,
            capability: capability.to_string(),
            as_of,
            exception_id: Some(exception.id),
            group_id: None,
        }
    }

    fn from_group(user_id: UserId, capability: &str, as_of: DateTime<Utc>, group_id: GroupId) -> Self {
        Self {
            allowed: true,
            reason: DecisionReason::GroupMembership,
            matched_via: MatchedVia::Group,
            user_id,
            capability: capability.to_string(),
            as_of,
            exception_id: None,
            group_id: Some(group_id),
        }
    }

    pub fn verdict(&self) -> Verdict {
        if self.allowed {
            Verdict::Allowed
        } else {
            Verdict::Denied
        }
    }

    /// Same decision overridden to a denial (used when a mandatory audit fails)
    pub fn into_denied(self, reason: DecisionReason) -> Self {
        Self {
            allowed: false,
            reason,
            matched_via: MatchedVia::None,
            exception_id: None,
            group_id: None,
            ..self
        }
    }
}

/// Ledger state relevant to one (user, capability) check
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evidence {
    /// Active catalog row, `None` when unknown or inactive
    pub capability: Option<Capability>,
    pub user_known: bool,

    /// Exceptions for the pair (filtered again by `decide`)
    pub exceptions: Vec<ExceptionalGrant>,

    /// Active groups of the user that confer the capability
    pub granting_groups: Vec<GroupId>,
}

impl Evidence {
    /// Unknown capabilities are always audited durably
    pub fn audit_mandatory(&self) -> bool {
        self.capability
            .as_ref()
            .map_or(true, |c| c.audit_mandatory())
    }
}

/// Decide a single check. Pure: same evidence and instant, same decision.
pub fn decide(user_id: UserId, capability_code: &str, as_of: DateTime<Utc>, evidence: &Evidence) -> Decision {
    let capability = match &evidence.capability {
        Some(cap) if cap.active && cap.code == capability_code => cap,
        _ => {
            return Decision::denied(user_id, capability_code, as_of, DecisionReason::UnknownCapability)
        }
    };

    if !evidence.user_known {
        return Decision::denied(user_id, capability_code, as_of, DecisionReason::UnknownUser);
    }

    let mut newest_revoke: Option<&ExceptionalGrant> = None;
    let mut newest_grant: Option<&ExceptionalGrant> = None;

    let active = evidence.exceptions.iter().filter(|e| {
        e.user_id == user_id && e.capability_id == capability.id && e.is_active_at(as_of)
    });
    for exception in active {
        let slot = match exception.kind {
            ExceptionKind::Revoke => &mut newest_revoke,
            ExceptionKind::Grant => &mut newest_grant,
        };
        let newer = slot.map_or(true, |current| {
            (exception.created_at, exception.id) > (current.created_at, current.id)
        });
        if newer {
            *slot = Some(exception);
        }
    }

    if let Some(exception) = newest_revoke.or(newest_grant) {
        return Decision::from_exception(user_id, capability_code, as_of, exception);
    }

    if let Some(group_id) = evidence.granting_groups.iter().min() {
        return Decision::from_group(user_id, capability_code, as_of, *group_id);
    }

    Decision::denied(user_id, capability_code, as_of, DecisionReason::NoGrant)
}

/// Inputs to a user's effective capability set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectiveEvidence {
    /// Active capabilities conferred by active groups
    pub group_capabilities: BTreeSet<CapabilityCode>,

    /// Active capabilities with an active grant exception
    pub granted: BTreeSet<CapabilityCode>,

    /// Capabilities with an active revoke exception
    pub revoked: BTreeSet<CapabilityCode>,

    /// Earliest instant after which the set may change by time alone
    pub next_boundary: Option<DateTime<Utc>>,
}

/// `(groups ∪ grants) − revokes`, the same precedence as [`decide`]
pub fn effective_set(evidence: &EffectiveEvidence) -> BTreeSet<CapabilityCode> {
    evidence
        .group_capabilities
        .union(&evidence.granted)
        .filter(|code| !evidence.revoked.contains(*code))
        .cloned()
        .collect()
}

/// Earliest future instant at which a membership expires or an exception
/// enters or leaves its window
pub fn next_boundary(
    memberships: &[Membership],
    exceptions: &[ExceptionalGrant],
    as_of: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let membership_ends = memberships
        .iter()
        .filter(|m| m.active)
        .filter_map(|m| m.expires_at)
        .filter(|t| *t > as_of);

    let exception_edges = exceptions.iter().filter(|e| e.active).flat_map(|e| {
        // Windows are inclusive at the end: the row drops out just after ends_at
        let end = e.ends_at.map(|t| t + Duration::nanoseconds(1));
        [Some(e.starts_at), end].into_iter().flatten()
    });

    membership_ends
        .chain(exception_edges.filter(|t| *t > as_of))
        .min()
}

/// Gathers evidence from the catalog and ledgers
pub struct Resolver {
    store: Arc<dyn PermissionStore>,
    catalog: Arc<CapabilityCatalog>,
    groups: Arc<GroupRegistry>,
    memberships: Arc<MembershipLedger>,
    exceptions: Arc<ExceptionLedger>,
}

impl Resolver {
    pub fn new(
        store: Arc<dyn PermissionStore>,
        catalog: Arc<CapabilityCatalog>,
        groups: Arc<GroupRegistry>,
        memberships: Arc<MembershipLedger>,
        exceptions: Arc<ExceptionLedger>,
    ) -> Self {
        Self {
            store,
            catalog,
            groups,
            memberships,
            exceptions,
        }
    }

    /// Read everything a check needs. Group memberships are skipped when an
    /// active exception already decides.
    pub async fn gather(&self, user_id: UserId, capability_code: &str, as_of: DateTime<Utc>) -> Result<Evidence> {
        let (capability, user_known) = futures::try_join!(
            self.catalog.lookup(capability_code),
            self.store.user_exists(user_id)
        )?;

        let capability = match capability {
            Some(cap) if user_known => cap,
            other => {
                return Ok(Evidence {
                    capability: other,
                    user_known,
                    ..Default::default()
                })
            }
        };

        let exceptions = self
            .exceptions
            .active_exceptions_for(user_id, capability.id, as_of)
            .await?;

        let granting_groups = if exceptions.is_empty() {
            let groups = self.memberships.active_groups_for(user_id, as_of).await?;
            self.groups.groups_granting(&groups, capability.id).await?
        } else {
            Vec::new()
        };

        Ok(Evidence {
            capability: Some(capability),
            user_known,
            exceptions,
            granting_groups,
        })
    }

    /// Gather and decide
    pub async fn resolve(&self, user_id: UserId, capability_code: &str, as_of: DateTime<Utc>) -> Result<Decision> {
        let evidence = self.gather(user_id, capability_code, as_of).await?;
        let decision = decide(user_id, capability_code, as_of, &evidence);
        debug!(
            "Resolved user={} capability={} -> {} ({})",
            user_id,
            capability_code,
            decision.verdict(),
            decision.reason
        );
        Ok(decision)
    }

    /// Read everything the effective capability set needs
    pub async fn gather_effective(&self, user_id: UserId, as_of: DateTime<Utc>) -> Result<EffectiveEvidence> {
        if !self.store.user_exists(user_id).await? {
            return Ok(EffectiveEvidence::default());
        }

        let (memberships, flagged) = futures::try_join!(
            self.store.flagged_memberships(user_id),
            self.exceptions.flagged_for_user(user_id)
        )?;
        let active_groups: Vec<GroupId> = memberships
            .iter()
            .filter(|m| m.is_active_at(as_of))
            .map(|m| m.group_id)
            .collect();
        let group_capabilities = self.groups.capabilities_for_groups(&active_groups).await?;

        let mut granted = BTreeSet::new();
        let mut revoked = BTreeSet::new();
        for exception in flagged.iter().filter(|e| e.is_active_at(as_of)) {
            match exception.kind {
                ExceptionKind::Revoke => {
                    revoked.insert(exception.capability_code.clone());
                }
                ExceptionKind::Grant => {
                    if self.catalog.exists(&exception.capability_code).await? {
                        granted.insert(exception.capability_code.clone());
                    }
                }
            }
        }

        Ok(EffectiveEvidence {
            group_capabilities,
            granted,
            revoked,
            next_boundary: next_boundary(&memberships, &flagged, as_of),
        })
    }

    /// Effective capability set at `as_of`, with the instant it may next change
    pub async fn effective(
        &self,
        user_id: UserId,
        as_of: DateTime<Utc>,
    ) -> Result<(BTreeSet<CapabilityCode>, Option<DateTime<Utc>>)> {
        let evidence = self.gather_effective(user_id, as_of).await?;
        Ok((effective_set(&evidence), evidence.next_boundary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SensitivityLevel;

    const CODE: &str = "sistema.tecnico.configuracion.editar";

    fn capability() -> Capability {
        let mut cap = Capability::new(CODE, SensitivityLevel::Alto).unwrap();
        cap.id = 7;
        cap
    }

    fn exception(id: ExceptionId, kind: ExceptionKind, created_at: DateTime<Utc>) -> ExceptionalGrant {
        ExceptionalGrant {
            id,
            user_id: 1,
            capability_id: 7,
            capability_code: CODE.to_string(),
            kind,
            starts_at: created_at,
            ends_at: None,
            reason: "test".to_string(),
            authorized_by: Some(99),
            active: true,
            created_at,
            revoked_at: None,
            revoked_by: None,
        }
    }

    fn evidence(exceptions: Vec<ExceptionalGrant>, groups: Vec<GroupId>) -> Evidence {
        Evidence {
            capability: Some(capability()),
            user_known: true,
            exceptions,
            granting_groups: groups,
        }
    }

    #[test]
    fn test_unknown_capability_denied() {
        let now = Utc::now();
        let decision = decide(1, CODE, now, &Evidence::default());
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::UnknownCapability);
        assert_eq!(decision.matched_via, MatchedVia::None);

        let mut inactive = evidence(vec![], vec![3]);
        if let Some(cap) = inactive.capability.as_mut() {
            cap.active = false;
        }
        assert_eq!(decide(1, CODE, now, &inactive).reason, DecisionReason::UnknownCapability);
    }

    #[test]
    fn test_unknown_user_denied() {
        let mut ev = evidence(vec![], vec![3]);
        ev.user_known = false;
        assert_eq!(decide(1, CODE, Utc::now(), &ev).reason, DecisionReason::UnknownUser);
    }

    #[test]
    fn test_group_grant_reports_lowest_group() {
        let decision = decide(1, CODE, Utc::now(), &evidence(vec![], vec![9, 4, 6]));
        assert!(decision.allowed);
        assert_eq!(decision.reason, DecisionReason::GroupMembership);
        assert_eq!(decision.group_id, Some(4));
    }

    #[test]
    fn test_revoke_beats_grant_and_groups() {
        let t1 = Utc::now();
        let t2 = t1 + Duration::minutes(1);
        let ev = evidence(
            vec![
                exception(1, ExceptionKind::Grant, t2),
                exception(2, ExceptionKind::Revoke, t1),
            ],
            vec![3],
        );

        let decision = decide(1, CODE, t2, &ev);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::ExplicitRevoke);
        assert_eq!(decision.exception_id, Some(2));
    }

    #[test]
    fn test_same_kind_newest_wins() {
        let t1 = Utc::now();
        let ev = evidence(
            vec![
                exception(5, ExceptionKind::Grant, t1),
                exception(8, ExceptionKind::Grant, t1 + Duration::seconds(30)),
                exception(6, ExceptionKind::Grant, t1),
            ],
            vec![],
        );

        let decision = decide(1, CODE, t1 + Duration::minutes(1), &ev);
        assert_eq!(decision.reason, DecisionReason::ExplicitGrant);
        assert_eq!(decision.exception_id, Some(8));

        // Equal timestamps fall back to the highest id
        let decision = decide(1, CODE, t1, &ev);
        assert_eq!(decision.exception_id, Some(6));
    }

    #[test]
    fn test_inactive_window_ignored() {
        let now = Utc::now();
        let mut expired = exception(1, ExceptionKind::Revoke, now - Duration::days(2));
        expired.ends_at = Some(now - Duration::days(1));

        let decision = decide(1, CODE, now, &evidence(vec![expired], vec![3]));
        assert_eq!(decision.reason, DecisionReason::GroupMembership);
    }

    #[test]
    fn test_no_grant() {
        let decision = decide(1, CODE, Utc::now(), &evidence(vec![], vec![]));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DecisionReason::NoGrant);
    }

    #[test]
    fn test_effective_set_removes_revokes() {
        let ev = EffectiveEvidence {
            group_capabilities: ["a", "b"].iter().map(|s| s.to_string()).collect(),
            granted: ["c"].iter().map(|s| s.to_string()).collect(),
            revoked: ["b", "c"].iter().map(|s| s.to_string()).collect(),
            next_boundary: None,
        };

        let set = effective_set(&ev);
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec!["a".to_string()]);
    }

    #[test]
    fn test_next_boundary() {
        let now = Utc::now();
        let membership = Membership {
            id: 1,
            user_id: 1,
            group_id: 1,
            assigned_at: now - Duration::days(1),
            expires_at: Some(now + Duration::hours(5)),
            assigned_by: None,
            active: true,
            reason: None,
            revoked_at: None,
            revoked_by: None,
        };
        let mut upcoming = exception(1, ExceptionKind::Grant, now);
        upcoming.starts_at = now + Duration::hours(2);

        assert_eq!(
            next_boundary(&[membership.clone()], &[upcoming], now),
            Some(now + Duration::hours(2))
        );
        assert_eq!(next_boundary(&[membership], &[], now), Some(now + Duration::hours(5)));
        assert_eq!(next_boundary(&[], &[], now), None);
    }

    #[test]
    fn test_decision_serializes_reason() {
        let decision = Decision::denied(1, CODE, Utc::now(), DecisionReason::AuditFailure);
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["reason"], "audit_failure");
        assert_eq!(json["matched_via"], "none");
        assert!(json.get("group_id").is_none());
    }
}
