//! In-memory permission store
//!
//! A single `RwLock` guards the whole state, so every mutation (row change plus
//! its audit record) is applied in one critical section. Failure injection
//! hooks let tests exercise audit failures, ledger outages and slow reads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AssignOutcome, NewException, NewMembership, PermissionStore};
use crate::audit::{AccessAuditRecord, AuditQuery, NewAuditRecord, GENESIS_HASH};
use crate::error::{PermissionError, Result};
use crate::types::{
    Capability, CapabilityId, ExceptionId, ExceptionalGrant, Function, FunctionCapability,
    FunctionId, GroupId, Membership, MembershipId, PermissionGroup, UserId,
};

#[derive(Default)]
struct State {
    users: HashSet<UserId>,
    functions: BTreeMap<FunctionId, Function>,
    capabilities: BTreeMap<CapabilityId, Capability>,
    function_links: Vec<FunctionCapability>,
    groups: BTreeMap<GroupId, PermissionGroup>,
    group_links: BTreeSet<(GroupId, CapabilityId)>,
    memberships: BTreeMap<MembershipId, Membership>,
    exceptions: BTreeMap<ExceptionId, ExceptionalGrant>,
    audit: Vec<AccessAuditRecord>,
    last_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn ensure_user(&self, user_id: UserId) -> Result<()> {
        if self.users.contains(&user_id) {
            Ok(())
        } else {
            Err(PermissionError::UnknownUser(user_id))
        }
    }

    fn capability(&self, capability_id: CapabilityId) -> Result<&Capability> {
        self.capabilities
            .get(&capability_id)
            .ok_or_else(|| PermissionError::UnknownCapability(format!("id {}", capability_id)))
    }

    fn group(&self, group_id: GroupId) -> Result<&PermissionGroup> {
        self.groups
            .get(&group_id)
            .ok_or_else(|| PermissionError::UnknownGroup(format!("id {}", group_id)))
    }

    fn append_audit(&mut self, record: NewAuditRecord) -> AccessAuditRecord {
        let sequence = self.audit.len() as u64 + 1;
        let prev_hash = self
            .audit
            .last()
            .map(|r| r.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());

        let sealed = record.seal(Uuid::new_v4(), sequence, prev_hash);
        self.audit.push(sealed.clone());
        sealed
    }
}

/// In-memory implementation of [`PermissionStore`]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
    fail_audit_writes: AtomicBool,
    fail_reads: AtomicBool,
    read_delay_ms: AtomicU64,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            fail_audit_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            read_delay_ms: AtomicU64::new(0),
        }
    }

    /// Make every audit append fail (mutations carrying audit records fail too)
    pub fn set_fail_audit_writes(&self, fail: bool) {
        self.fail_audit_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every ledger read fail
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Delay every ledger read
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        let millis = delay.map(|d| d.as_millis() as u64).unwrap_or(0);
        self.read_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of audit records written so far
    pub async fn audit_len(&self) -> usize {
        self.state.read().await.audit.len()
    }

    /// Overwrite a stored audit record in place (tamper simulation for tests)
    pub async fn tamper_audit(&self, sequence: u64, action: &str) {
        let mut state = self.state.write().await;
        if let Some(record) = state.audit.iter_mut().find(|r| r.sequence == sequence) {
            record.action = action.to_string();
        }
    }

    async fn before_read(&self) -> Result<()> {
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(PermissionError::Database("ledger read failed".to_string()));
        }
        Ok(())
    }

    fn ensure_audit_writable(&self) -> Result<()> {
        if self.fail_audit_writes.load(Ordering::SeqCst) {
            Err(PermissionError::Database("audit table unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PermissionStore for InMemoryStore {
    async fn register_user(&self, user_id: UserId) -> Result<()> {
        let mut state = self.state.write().await;
        state.users.insert(user_id);
        Ok(())
    }

    async fn user_exists(&self, user_id: UserId) -> Result<bool> {
        self.before_read().await?;
        Ok(self.state.read().await.users.contains(&user_id))
    }

    async fn delete_user(&self, user_id: UserId) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.users.remove(&user_id) {
            return Err(PermissionError::UnknownUser(user_id));
        }

        state.memberships.retain(|_, m| m.user_id != user_id);
        state.exceptions.retain(|_, e| e.user_id != user_id);

        for membership in state.memberships.values_mut() {
            if membership.assigned_by == Some(user_id) {
                membership.assigned_by = None;
            }
            if membership.revoked_by == Some(user_id) {
                membership.revoked_by = None;
            }
        }
        for exception in state.exceptions.values_mut() {
            if exception.authorized_by == Some(user_id) {
                exception.authorized_by = None;
            }
            if exception.revoked_by == Some(user_id) {
                exception.revoked_by = None;
            }
        }
        for record in state.audit.iter_mut() {
            if record.user_id == Some(user_id) {
                record.user_id = None;
            }
            if record.performed_by == Some(user_id) {
                record.performed_by = None;
            }
        }

        Ok(())
    }

    async fn insert_function(&self, mut function: Function) -> Result<Function> {
        let mut state = self.state.write().await;
        if state.functions.values().any(|f| f.code == function.code) {
            return Err(PermissionError::DuplicateCode(function.code));
        }

        function.id = state.next_id();
        state.functions.insert(function.id, function.clone());
        Ok(function)
    }

    async fn insert_capability(&self, mut capability: Capability) -> Result<Capability> {
        let mut state = self.state.write().await;
        if state.capabilities.values().any(|c| c.code == capability.code) {
            return Err(PermissionError::DuplicateCode(capability.code));
        }

        capability.id = state.next_id();
        state.capabilities.insert(capability.id, capability.clone());
        Ok(capability)
    }

    async fn link_function_capability(&self, link: FunctionCapability) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.functions.contains_key(&link.function_id) {
            return Err(PermissionError::UnknownFunction(format!("id {}", link.function_id)));
        }
        state.capability(link.capability_id)?;

        let exists = state.function_links.iter().any(|l| {
            l.function_id == link.function_id && l.capability_id == link.capability_id
        });
        if exists {
            return Err(PermissionError::DuplicateCode(format!(
                "function {} / capability {}",
                link.function_id, link.capability_id
            )));
        }

        state.function_links.push(link);
        Ok(())
    }

    async fn function_by_code(&self, code: &str) -> Result<Option<Function>> {
        self.before_read().await?;
        let state = self.state.read().await;
        Ok(state.functions.values().find(|f| f.code == code).cloned())
    }

    async fn list_functions(&self) -> Result<Vec<Function>> {
        self.before_read().await?;
        let state = self.state.read().await;
        Ok(state.functions.values().cloned().collect())
    }

    async fn function_capabilities(
        &self,
        function_id: FunctionId,
    ) -> Result<Vec<(FunctionCapability, Capability)>> {
        self.before_read().await?;
        let state = self.state.read().await;
        Ok(state
            .function_links
            .iter()
            .filter(|l| l.function_id == function_id)
            .filter_map(|l| {
                state
                    .capabilities
                    .get(&l.capability_id)
                    .map(|c| (l.clone(), c.clone()))
            })
            .collect())
    }

    async fn capability_by_code(&self, code: &str) -> Result<Option<Capability>> {
        self.before_read().await?;
        let state = self.state.read().await;
        Ok(state.capabilities.values().find(|c| c.code == code).cloned())
    }

    async fn set_function_active(&self, function_id: FunctionId, active: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let function = state
            .functions
            .get_mut(&function_id)
            .ok_or_else(|| PermissionError::UnknownFunction(format!("id {}", function_id)))?;
        function.active = active;
        Ok(())
    }

    async fn set_capability_active(&self, capability_id: CapabilityId, active: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let capability = state
            .capabilities
            .get_mut(&capability_id)
            .ok_or_else(|| PermissionError::UnknownCapability(format!("id {}", capability_id)))?;
        capability.active = active;
        Ok(())
    }

    async fn delete_function(&self, function_id: FunctionId) -> Result<()> {
        let mut state = self.state.write().await;
        if state.functions.remove(&function_id).is_none() {
            return Err(PermissionError::UnknownFunction(format!("id {}", function_id)));
        }
        state.function_links.retain(|l| l.function_id != function_id);
        Ok(())
    }

    async fn delete_capability(&self, capability_id: CapabilityId) -> Result<()> {
        let mut state = self.state.write().await;
        let code = state.capability(capability_id)?.code.clone();

        if state.exceptions.values().any(|e| e.capability_id == capability_id) {
            return Err(PermissionError::ProtectedReference(format!(
                "capability '{}' is referenced by exceptional grants; deactivate it instead",
                code
            )));
        }

        state.capabilities.remove(&capability_id);
        state.function_links.retain(|l| l.capability_id != capability_id);
        state.group_links.retain(|(_, c)| *c != capability_id);
        Ok(())
    }

    async fn insert_group(&self, mut group: PermissionGroup) -> Result<PermissionGroup> {
        let mut state = self.state.write().await;
        if state.groups.values().any(|g| g.code == group.code) {
            return Err(PermissionError::DuplicateCode(group.code));
        }

        group.id = state.next_id();
        state.groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn grant_group_capability(&self, group_id: GroupId, capability_id: CapabilityId) -> Result<()> {
        let mut state = self.state.write().await;
        state.group(group_id)?;
        let code = state.capability(capability_id)?.code.clone();

        if !state.group_links.insert((group_id, capability_id)) {
            return Err(PermissionError::DuplicateGroupCapability {
                group_id,
                capability: code,
            });
        }
        Ok(())
    }

    async fn revoke_group_capability(&self, group_id: GroupId, capability_id: CapabilityId) -> Result<bool> {
        let mut state = self.state.write().await;
        Ok(state.group_links.remove(&(group_id, capability_id)))
    }

    async fn group_by_id(&self, group_id: GroupId) -> Result<Option<PermissionGroup>> {
        self.before_read().await?;
        Ok(self.state.read().await.groups.get(&group_id).cloned())
    }

    async fn group_by_code(&self, code: &str) -> Result<Option<PermissionGroup>> {
        self.before_read().await?;
        let state = self.state.read().await;
        Ok(state.groups.values().find(|g| g.code == code).cloned())
    }

    async fn groups_by_ids(&self, group_ids: &[GroupId]) -> Result<Vec<PermissionGroup>> {
        self.before_read().await?;
        let state = self.state.read().await;
        Ok(group_ids
            .iter()
            .filter_map(|id| state.groups.get(id).cloned())
            .collect())
    }

    async fn group_capabilities(&self, group_ids: &[GroupId]) -> Result<Vec<(GroupId, Capability)>> {
        self.before_read().await?;
        let state = self.state.read().await;
        Ok(state
            .group_links
            .iter()
            .filter(|(g, _)| group_ids.contains(g))
            .filter_map(|(g, c)| state.capabilities.get(c).map(|cap| (*g, cap.clone())))
            .collect())
    }

    async fn set_group_active(&self, group_id: GroupId, active: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let group = state
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| PermissionError::UnknownGroup(format!("id {}", group_id)))?;
        group.active = active;
        Ok(())
    }

    async fn delete_group(&self, group_id: GroupId) -> Result<()> {
        let mut state = self.state.write().await;
        let code = state.group(group_id)?.code.clone();

        if state.memberships.values().any(|m| m.group_id == group_id) {
            return Err(PermissionError::ProtectedReference(format!(
                "group '{}' is referenced by memberships; deactivate it instead",
                code
            )));
        }

        state.groups.remove(&group_id);
        state.group_links.retain(|(g, _)| *g != group_id);
        Ok(())
    }

    async fn memberships_for_user(&self, user_id: UserId) -> Result<Vec<Membership>> {
        self.before_read().await?;
        let state = self.state.read().await;
        Ok(state
            .memberships
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn flagged_memberships(&self, user_id: UserId) -> Result<Vec<Membership>> {
        self.before_read().await?;
        let state = self.state.read().await;
        Ok(state
            .memberships
            .values()
            .filter(|m| m.user_id == user_id && m.active)
            .cloned()
            .collect())
    }

    async fn assign_group(
        &self,
        membership: NewMembership,
        as_of: DateTime<Utc>,
        mut audit: NewAuditRecord,
    ) -> Result<AssignOutcome> {
        let mut state = self.state.write().await;
        state.ensure_user(membership.user_id)?;
        state.ensure_user(membership.assigned_by)?;

        let group = state.group(membership.group_id)?;
        if !group.active {
            return Err(PermissionError::InvalidInput(format!(
                "Group '{}' is inactive",
                group.code
            )));
        }

        let flagged = state
            .memberships
            .values()
            .find(|m| m.user_id == membership.user_id && m.group_id == membership.group_id && m.active)
            .cloned();

        if let Some(existing) = &flagged {
            if existing.is_active_at(as_of) {
                if existing.expires_at == membership.expires_at {
                    return Ok(AssignOutcome::Existing(existing.clone()));
                }
                return Err(PermissionError::DuplicateMembership {
                    user_id: membership.user_id,
                    group_id: membership.group_id,
                    membership_id: existing.id,
                });
            }
        }

        self.ensure_audit_writable()?;

        if let Some(expired) = flagged {
            if let Some(row) = state.memberships.get_mut(&expired.id) {
                row.active = false;
            }
            audit.annotate("superseded_membership_id", serde_json::json!(expired.id));
        }

        let id = state.next_id();
        let row = Membership {
            id,
            user_id: membership.user_id,
            group_id: membership.group_id,
            assigned_at: membership.assigned_at,
            expires_at: membership.expires_at,
            assigned_by: Some(membership.assigned_by),
            active: true,
            reason: membership.reason,
            revoked_at: None,
            revoked_by: None,
        };
        state.memberships.insert(id, row.clone());

        audit.annotate("membership_id", serde_json::json!(id));
        let audit = state.append_audit(audit);

        Ok(AssignOutcome::Created {
            membership: row,
            audit,
        })
    }

    async fn revoke_group(
        &self,
        user_id: UserId,
        group_id: GroupId,
        revoked_by: UserId,
        at: DateTime<Utc>,
        mut audit: NewAuditRecord,
    ) -> Result<(Membership, AccessAuditRecord)> {
        let mut state = self.state.write().await;
        state.ensure_user(revoked_by)?;

        let id = state
            .memberships
            .values()
            .find(|m| m.user_id == user_id && m.group_id == group_id && m.active)
            .map(|m| m.id)
            .ok_or(PermissionError::MembershipNotFound { user_id, group_id })?;

        self.ensure_audit_writable()?;

        let row = match state.memberships.get_mut(&id) {
            Some(row) => {
                row.active = false;
                row.revoked_at = Some(at);
                row.revoked_by = Some(revoked_by);
                row.clone()
            }
            None => return Err(PermissionError::MembershipNotFound { user_id, group_id }),
        };

        audit.annotate("membership_id", serde_json::json!(id));
        let audit = state.append_audit(audit);
        Ok((row, audit))
    }

    async fn flagged_exceptions(
        &self,
        user_id: UserId,
        capability_id: Option<CapabilityId>,
    ) -> Result<Vec<ExceptionalGrant>> {
        self.before_read().await?;
        let state = self.state.read().await;
        Ok(state
            .exceptions
            .values()
            .filter(|e| e.user_id == user_id && e.active)
            .filter(|e| capability_id.map_or(true, |c| e.capability_id == c))
            .cloned()
            .collect())
    }

    async fn exception_by_id(&self, exception_id: ExceptionId) -> Result<Option<ExceptionalGrant>> {
        self.before_read().await?;
        Ok(self.state.read().await.exceptions.get(&exception_id).cloned())
    }

    async fn insert_exception(
        &self,
        exception: NewException,
        mut audit: NewAuditRecord,
    ) -> Result<(ExceptionalGrant, AccessAuditRecord)> {
        let mut state = self.state.write().await;
        state.ensure_user(exception.user_id)?;
        state.ensure_user(exception.authorized_by)?;
        let capability_code = state.capability(exception.capability_id)?.code.clone();

        self.ensure_audit_writable()?;

        let id = state.next_id();
        let row = ExceptionalGrant {
            id,
            user_id: exception.user_id,
            capability_id: exception.capability_id,
            capability_code,
            kind: exception.kind,
            starts_at: exception.starts_at,
            ends_at: exception.ends_at,
            reason: exception.reason,
            authorized_by: Some(exception.authorized_by),
            active: true,
            created_at: exception.created_at,
            revoked_at: None,
            revoked_by: None,
        };
        state.exceptions.insert(id, row.clone());

        audit.annotate("exception_id", serde_json::json!(id));
        let audit = state.append_audit(audit);
        Ok((row, audit))
    }

    async fn revoke_exception(
        &self,
        exception_id: ExceptionId,
        revoked_by: UserId,
        at: DateTime<Utc>,
        mut audit: NewAuditRecord,
    ) -> Result<(ExceptionalGrant, AccessAuditRecord)> {
        let mut state = self.state.write().await;
        state.ensure_user(revoked_by)?;

        match state.exceptions.get(&exception_id) {
            None => return Err(PermissionError::UnknownException(exception_id)),
            Some(row) if !row.active => {
                return Err(PermissionError::InvalidInput(format!(
                    "Exception {} is already inactive",
                    exception_id
                )))
            }
            Some(_) => {}
        }

        self.ensure_audit_writable()?;

        let row = match state.exceptions.get_mut(&exception_id) {
            Some(row) => {
                row.active = false;
                row.revoked_at = Some(at);
                row.revoked_by = Some(revoked_by);
                row.clone()
            }
            None => return Err(PermissionError::UnknownException(exception_id)),
        };

        audit.annotate("exception_id", serde_json::json!(exception_id));
        let audit = state.append_audit(audit);
        Ok((row, audit))
    }

    async fn append_audit(&self, record: NewAuditRecord) -> Result<AccessAuditRecord> {
        self.ensure_audit_writable()?;
        let mut state = self.state.write().await;
        Ok(state.append_audit(record))
    }

    async fn query_audit(&self, query: &AuditQuery) -> Result<Vec<AccessAuditRecord>> {
        let state = self.state.read().await;
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(state
            .audit
            .iter()
            .rev()
            .filter(|r| query.matches(r))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn audit_chain(&self) -> Result<Vec<AccessAuditRecord>> {
        Ok(self.state.read().await.audit.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEvent;
    use crate::types::{AccessCategory, ExceptionKind, SensitivityLevel};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    async fn seeded() -> (InMemoryStore, Capability, PermissionGroup) {
        let store = InMemoryStore::new();
        store.register_user(1).await.unwrap();
        store.register_user(99).await.unwrap();

        let cap = store
            .insert_capability(
                Capability::new("sistema.operaciones.llamadas.registrar", SensitivityLevel::Bajo)
                    .unwrap(),
            )
            .await
            .unwrap();
        let group = store
            .insert_group(PermissionGroup::new("atencion_cliente", AccessCategory::Operativo).unwrap())
            .await
            .unwrap();
        store.grant_group_capability(group.id, cap.id).await.unwrap();

        (store, cap, group)
    }

    fn assignment(group_id: GroupId, at: DateTime<Utc>, expires_at: Option<DateTime<Utc>>) -> NewMembership {
        NewMembership {
            user_id: 1,
            group_id,
            assigned_by: 99,
            assigned_at: at,
            expires_at,
            reason: None,
        }
    }

    fn audit_for(group: &PermissionGroup, at: DateTime<Utc>) -> NewAuditRecord {
        NewAuditRecord::mutation(
            AuditEvent::GroupAssigned,
            1,
            99,
            format!("grupo:{}", group.code),
            json!({}),
            at,
        )
    }

    #[tokio::test]
    async fn test_duplicate_codes_rejected() {
        let (store, _, _) = seeded().await;

        let dup = store
            .insert_capability(
                Capability::new("sistema.operaciones.llamadas.registrar", SensitivityLevel::Alto)
                    .unwrap(),
            )
            .await;
        assert!(matches!(dup, Err(PermissionError::DuplicateCode(_))));
    }

    #[tokio::test]
    async fn test_duplicate_group_capability_rejected() {
        let (store, cap, group) = seeded().await;

        let result = store.grant_group_capability(group.id, cap.id).await;
        assert!(matches!(
            result,
            Err(PermissionError::DuplicateGroupCapability { .. })
        ));
    }

    #[tokio::test]
    async fn test_assign_is_idempotent() {
        let (store, _, group) = seeded().await;
        let now = Utc::now();

        let first = store
            .assign_group(assignment(group.id, now, None), now, audit_for(&group, now))
            .await
            .unwrap();
        let second = store
            .assign_group(assignment(group.id, now, None), now, audit_for(&group, now))
            .await
            .unwrap();

        assert!(matches!(first, AssignOutcome::Created { .. }));
        assert!(matches!(second, AssignOutcome::Existing(_)));
        assert_eq!(first.membership().id, second.membership().id);
        assert_eq!(store.flagged_memberships(1).await.unwrap().len(), 1);
        assert_eq!(store.audit_len().await, 1);
    }

    #[tokio::test]
    async fn test_reassign_after_expiry_supersedes_row() {
        let (store, _, group) = seeded().await;
        let start = Utc::now();
        let expiry = start + ChronoDuration::days(1);

        store
            .assign_group(assignment(group.id, start, Some(expiry)), start, audit_for(&group, start))
            .await
            .unwrap();

        let later = start + ChronoDuration::days(2);
        let outcome = store
            .assign_group(assignment(group.id, later, None), later, audit_for(&group, later))
            .await
            .unwrap();
        assert!(matches!(outcome, AssignOutcome::Created { .. }));

        let history = store.memberships_for_user(1).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|m| m.active).count(), 1);
    }

    #[tokio::test]
    async fn test_failed_audit_leaves_ledger_untouched() {
        let (store, _, group) = seeded().await;
        let now = Utc::now();
        store.set_fail_audit_writes(true);

        let result = store
            .assign_group(assignment(group.id, now, None), now, audit_for(&group, now))
            .await;

        assert!(result.is_err());
        assert!(store.memberships_for_user(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_protected_deletes() {
        let (store, cap, group) = seeded().await;
        let now = Utc::now();

        store
            .assign_group(assignment(group.id, now, None), now, audit_for(&group, now))
            .await
            .unwrap();
        store
            .insert_exception(
                NewException {
                    user_id: 1,
                    capability_id: cap.id,
                    kind: ExceptionKind::Revoke,
                    starts_at: now,
                    ends_at: None,
                    reason: "incident".to_string(),
                    authorized_by: 99,
                    created_at: now,
                },
                audit_for(&group, now),
            )
            .await
            .unwrap();

        assert!(matches!(
            store.delete_group(group.id).await,
            Err(PermissionError::ProtectedReference(_))
        ));
        assert!(matches!(
            store.delete_capability(cap.id).await,
            Err(PermissionError::ProtectedReference(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_capability_cascades_links() {
        let (store, cap, group) = seeded().await;

        store.delete_capability(cap.id).await.unwrap();

        assert!(store.group_capabilities(&[group.id]).await.unwrap().is_empty());
        assert!(store.capability_by_code(&cap.code).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_user_nulls_actor_refs() {
        let (store, _, group) = seeded().await;
        let now = Utc::now();
        store.register_user(2).await.unwrap();

        store
            .assign_group(
                NewMembership {
                    user_id: 2,
                    ..assignment(group.id, now, None)
                },
                now,
                audit_for(&group, now),
            )
            .await
            .unwrap();

        store.delete_user(99).await.unwrap();

        let memberships = store.memberships_for_user(2).await.unwrap();
        assert_eq!(memberships[0].assigned_by, None);

        let chain = store.audit_chain().await.unwrap();
        assert_eq!(chain[0].performed_by, None);
        assert!(crate::audit::verify_chain(&chain).valid);
    }
}
