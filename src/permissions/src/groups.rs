//! Permission group registry
//!
//! Groups bundle capabilities. Bundles have no time dimension; only a user's
//! membership in a group is time-bounded. Inactive groups and inactive
//! capabilities confer nothing.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

use crate::error::{PermissionError, Result};
use crate::store::PermissionStore;
use crate::types::{CapabilityCode, CapabilityId, GroupId, PermissionGroup};

pub struct GroupRegistry {
    store: Arc<dyn PermissionStore>,
}

impl GroupRegistry {
    pub fn new(store: Arc<dyn PermissionStore>) -> Self {
        Self { store }
    }

    /// Capability codes conferred by a group
    pub async fn capabilities_for(&self, group_id: GroupId) -> Result<BTreeSet<CapabilityCode>> {
        self.capabilities_for_groups(&[group_id]).await
    }

    /// Union of the capabilities conferred by the active groups among `group_ids`
    pub async fn capabilities_for_groups(
        &self,
        group_ids: &[GroupId],
    ) -> Result<BTreeSet<CapabilityCode>> {
        let active = self.active_ids(group_ids).await?;
        if active.is_empty() {
            return Ok(BTreeSet::new());
        }

        Ok(self
            .store
            .group_capabilities(&active)
            .await?
            .into_iter()
            .filter(|(_, cap)| cap.active)
            .map(|(_, cap)| cap.code)
            .collect())
    }

    /// Active groups among `group_ids` that confer `capability_id`, ascending
    pub async fn groups_granting(
        &self,
        group_ids: &[GroupId],
        capability_id: CapabilityId,
    ) -> Result<Vec<GroupId>> {
        let active = self.active_ids(group_ids).await?;
        if active.is_empty() {
            return Ok(Vec::new());
        }

        let granting: BTreeSet<GroupId> = self
            .store
            .group_capabilities(&active)
            .await?
            .into_iter()
            .filter(|(_, cap)| cap.id == capability_id && cap.active)
            .map(|(group_id, _)| group_id)
            .collect();
        Ok(granting.into_iter().collect())
    }

    pub async fn group(&self, group_id: GroupId) -> Result<PermissionGroup> {
        self.store
            .group_by_id(group_id)
            .await?
            .ok_or_else(|| PermissionError::UnknownGroup(format!("id {}", group_id)))
    }

    pub async fn group_by_code(&self, code: &str) -> Result<PermissionGroup> {
        self.store
            .group_by_code(code)
            .await?
            .ok_or_else(|| PermissionError::UnknownGroup(code.to_string()))
    }

    /// Active groups among `group_ids`, in id order
    pub async fn active_groups(&self, group_ids: &[GroupId]) -> Result<Vec<PermissionGroup>> {
        let mut groups: Vec<PermissionGroup> = self
            .store
            .groups_by_ids(group_ids)
            .await?
            .into_iter()
            .filter(|g| g.active)
            .collect();
        groups.sort_by_key(|g| g.id);
        groups.dedup_by_key(|g| g.id);
        Ok(groups)
    }

    async fn active_ids(&self, group_ids: &[GroupId]) -> Result<Vec<GroupId>> {
        Ok(self
            .active_groups(group_ids)
            .await?
            .into_iter()
            .map(|g| g.id)
            .collect())
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    pub async fn register_group(&self, group: PermissionGroup) -> Result<PermissionGroup> {
        let group = self.store.insert_group(group).await?;
        info!(
            "Registered permission group '{}' (risk={}, approval={})",
            group.code, group.risk_level, group.requires_approval
        );
        Ok(group)
    }

    /// Add a capability to a group's bundle
    pub async fn grant_capability(&self, group_code: &str, capability_code: &str) -> Result<()> {
        let group = self.group_by_code(group_code).await?;
        let capability = self
            .store
            .capability_by_code(capability_code)
            .await?
            .ok_or_else(|| PermissionError::UnknownCapability(capability_code.to_string()))?;

        self.store.grant_group_capability(group.id, capability.id).await?;
        info!("Group '{}' now grants '{}'", group_code, capability_code);
        Ok(())
    }

    /// Remove a capability from a group's bundle; returns whether it was there
    pub async fn revoke_capability(&self, group_code: &str, capability_code: &str) -> Result<bool> {
        let group = self.group_by_code(group_code).await?;
        let capability = self
            .store
            .capability_by_code(capability_code)
            .await?
            .ok_or_else(|| PermissionError::UnknownCapability(capability_code.to_string()))?;

        self.store.revoke_group_capability(group.id, capability.id).await
    }

    pub async fn set_group_active(&self, group_code: &str, active: bool) -> Result<()> {
        let group = self.group_by_code(group_code).await?;
        self.store.set_group_active(group.id, active).await?;
        info!("Group '{}' active={}", group_code, active);
        Ok(())
    }

    /// Hard delete; rejected while memberships reference the group
    pub async fn delete_group(&self, group_code: &str) -> Result<()> {
        let group = self.group_by_code(group_code).await?;
        self.store.delete_group(group.id).await
    }
}
