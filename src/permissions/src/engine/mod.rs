//! Permission engine
//!
//! Façade over the catalog, group registry, ledgers, resolver, audit recorder
//! and capability cache. This is the surface collaborators call.

pub mod metrics;

pub use metrics::{EngineMetrics, MetricsCollector};

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt::Display;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::audit::{
    AccessAuditRecord, AccessContext, AuditConfig, AuditQuery, AuditRecorder, ChainVerification,
    NewAuditRecord,
};
use crate::cache::{CacheConfig, CacheStats, CapabilityCache};
use crate::catalog::{CapabilityCatalog, MenuRule};
use crate::clock::{Clock, SystemClock};
use crate::error::{PermissionError, Result};
use crate::exception::{ExceptionLedger, ExceptionRequest};
use crate::groups::GroupRegistry;
use crate::membership::{GroupAssignment, MembershipLedger};
use crate::resolver::{decide, Decision, DecisionReason, Resolver};
use crate::store::{AssignOutcome, PermissionStore};
use crate::types::{
    CapabilityCode, ExceptionId, Function, GroupId, MembershipId, PermissionGroup, UserId,
};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default deadline for reading the ledgers during a check
    pub check_timeout: Duration,

    /// Deadline for administrative mutations
    pub mutation_timeout: Duration,

    /// Memoize effective capability sets
    pub enable_cache: bool,

    pub cache_config: CacheConfig,

    pub audit_config: AuditConfig,

    pub enable_metrics: bool,

    /// How `required` links gate menu visibility
    pub menu_rule: MenuRule,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_millis(250),
            mutation_timeout: Duration::from_secs(5),
            enable_cache: true,
            cache_config: CacheConfig::default(),
            audit_config: AuditConfig::default(),
            enable_metrics: true,
            menu_rule: MenuRule::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `PERMISSIONS_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with values from `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64, _>(&lookup, "PERMISSIONS_CHECK_TIMEOUT_MS")? {
            config.check_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PERMISSIONS_MUTATION_TIMEOUT_MS")? {
            config.mutation_timeout = Duration::from_millis(ms);
        }
        if let Some(enabled) = parse_var::<bool, _>(&lookup, "PERMISSIONS_CACHE_ENABLED")? {
            config.enable_cache = enabled;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "PERMISSIONS_CACHE_TTL_SECS")? {
            config.cache_config.ttl = Duration::from_secs(secs);
        }
        if let Some(capacity) = parse_var::<usize, _>(&lookup, "PERMISSIONS_CACHE_CAPACITY")? {
            config.cache_config.capacity = capacity;
        }
        if let Some(enabled) = parse_var::<bool, _>(&lookup, "PERMISSIONS_ASYNC_AUDIT")? {
            config.audit_config.async_best_effort = enabled;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PERMISSIONS_AUDIT_TIMEOUT_MS")? {
            config.audit_config.write_timeout = Duration::from_millis(ms);
        }
        if let Some(enabled) = parse_var::<bool, _>(&lookup, "PERMISSIONS_METRICS_ENABLED")? {
            config.enable_metrics = enabled;
        }
        if let Some(rule) = parse_var::<MenuRule, _>(&lookup, "PERMISSIONS_MENU_RULE")? {
            config.menu_rule = rule;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.check_timeout.is_zero() || self.mutation_timeout.is_zero() {
            return Err(PermissionError::InvalidInput(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.audit_config.write_timeout.is_zero() {
            return Err(PermissionError::InvalidInput(
                "audit write timeout must be greater than zero".to_string(),
            ));
        }
        if self.enable_cache && (self.cache_config.ttl.is_zero() || self.cache_config.capacity == 0) {
            return Err(PermissionError::InvalidInput(
                "cache ttl and capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| PermissionError::InvalidInput(format!("{}: {}", name, e))),
    }
}

/// Permission engine
///
/// # Architecture
///
/// ```text
/// check_access → Catalog → ExceptionLedger → MembershipLedger + GroupRegistry → decide
///                                                                                 ↓
///                                                   AuditRecorder (mandatory | best-effort)
///                                                                                 ↓
///                                                                              [Metrics]
///
/// effective_capabilities → [CapabilityCache] → Resolver::effective
/// ```
pub struct PermissionEngine {
    store: Arc<dyn PermissionStore>,
    catalog: Arc<CapabilityCatalog>,
    groups: Arc<GroupRegistry>,
    memberships: Arc<MembershipLedger>,
    exceptions: Arc<ExceptionLedger>,
    resolver: Resolver,
    audit: AuditRecorder,
    cache: Option<CapabilityCache>,
    metrics: Option<MetricsCollector>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl PermissionEngine {
    /// Create an engine reading time from the system clock
    pub async fn new(config: EngineConfig, store: Arc<dyn PermissionStore>) -> Result<Self> {
        Self::with_clock(config, store, Arc::new(SystemClock)).await
    }

    /// Create an engine with an explicit time source
    pub async fn with_clock(
        config: EngineConfig,
        store: Arc<dyn PermissionStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let catalog = Arc::new(CapabilityCatalog::new(store.clone()));
        let groups = Arc::new(GroupRegistry::new(store.clone()));
        let memberships = Arc::new(MembershipLedger::new(store.clone()));
        let exceptions = Arc::new(ExceptionLedger::new(store.clone()));
        let resolver = Resolver::new(
            store.clone(),
            catalog.clone(),
            groups.clone(),
            memberships.clone(),
            exceptions.clone(),
        );
        let audit = AuditRecorder::new(store.clone(), config.audit_config.clone());

        let cache = config
            .enable_cache
            .then(|| CapabilityCache::new(config.cache_config.clone()));
        let metrics = config.enable_metrics.then(MetricsCollector::new);

        info!(
            "PermissionEngine initialized with cache={}, async_audit={}, metrics={}, menu_rule={}",
            config.enable_cache,
            config.audit_config.async_best_effort,
            config.enable_metrics,
            config.menu_rule
        );

        Ok(Self {
            store,
            catalog,
            groups,
            memberships,
            exceptions,
            resolver,
            audit,
            cache,
            metrics,
            clock,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Catalog access for seeding and menu projections
    pub fn catalog(&self) -> &CapabilityCatalog {
        &self.catalog
    }

    /// Group registry access for seeding. Bundle changes made here are not
    /// pushed to the capability cache; use the engine methods for live changes.
    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    pub fn memberships(&self) -> &MembershipLedger {
        &self.memberships
    }

    pub fn exceptions(&self) -> &ExceptionLedger {
        &self.exceptions
    }

    // ------------------------------------------------------------------
    // Decision path
    // ------------------------------------------------------------------

    /// Decide whether `user_id` may use `capability_code`.
    ///
    /// Never fails: unknown inputs, ledger errors, an exceeded deadline and a
    /// failed mandatory audit write all come back as a denial whose reason
    /// tells them apart.
    pub async fn check_access(
        &self,
        user_id: UserId,
        capability_code: &str,
        context: &AccessContext,
    ) -> Decision {
        let start = Instant::now();
        let as_of = context.as_of.unwrap_or_else(|| self.clock.now());
        let deadline = context.deadline.unwrap_or(self.config.check_timeout);

        debug!(
            "Access check: user={}, capability={}, as_of={}",
            user_id, capability_code, as_of
        );

        let gathered =
            tokio::time::timeout(deadline, self.resolver.gather(user_id, capability_code, as_of)).await;

        // Unreadable ledgers are audited as if the capability were sensitive
        let (decision, mandatory, user_known) = match gathered {
            Ok(Ok(evidence)) => (
                decide(user_id, capability_code, as_of, &evidence),
                evidence.audit_mandatory(),
                evidence.user_known,
            ),
            Ok(Err(e)) => {
                warn!(
                    "Ledger read failed for user={} capability={}: {}",
                    user_id, capability_code, e
                );
                let denied = Decision::denied(
                    user_id,
                    capability_code,
                    as_of,
                    DecisionReason::LedgerUnavailable,
                );
                (denied, true, false)
            }
            Err(_) => {
                warn!(
                    "Access check for user={} capability={} exceeded {:?}",
                    user_id, capability_code, deadline
                );
                let denied =
                    Decision::denied(user_id, capability_code, as_of, DecisionReason::Timeout);
                (denied, true, false)
            }
        };

        let entry = NewAuditRecord::access(&decision, context, user_known, self.clock.now());
        let decision = match self.audit.record(entry, mandatory).await {
            Ok(_) => decision,
            Err(e) => {
                error!(
                    "Mandatory audit for user={} capability={} failed, denying: {}",
                    user_id, capability_code, e
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_audit_failure().await;
                }
                match decision.reason {
                    DecisionReason::Timeout | DecisionReason::LedgerUnavailable => decision,
                    _ => decision.into_denied(DecisionReason::AuditFailure),
                }
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_decision(decision.allowed, decision.reason).await;
            metrics.record_latency(start.elapsed()).await;
        }

        debug!(
            "Decision: user={} capability={} -> {} ({})",
            user_id,
            capability_code,
            decision.verdict(),
            decision.reason
        );
        decision
    }

    /// Shorthand for a check without request context
    pub async fn is_allowed(&self, user_id: UserId, capability_code: &str) -> bool {
        self.check_access(user_id, capability_code, &AccessContext::new())
            .await
            .allowed
    }

    // ------------------------------------------------------------------
    // Read projections
    // ------------------------------------------------------------------

    /// Capabilities the user holds now, served from the cache when enabled.
    ///
    /// Unknown users hold nothing.
    pub async fn effective_capabilities(&self, user_id: UserId) -> Result<BTreeSet<CapabilityCode>> {
        let as_of = self.clock.now();

        let Some(cache) = &self.cache else {
            return self.compute_effective(user_id, as_of).await.map(|(set, _)| set);
        };

        if let Some(hit) = cache.get(user_id, as_of) {
            if let Some(metrics) = &self.metrics {
                metrics.record_cache_hit().await;
            }
            return Ok((*hit).clone());
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_miss().await;
        }

        let generation = cache.generation(user_id);
        let (set, valid_until) = self.compute_effective(user_id, as_of).await?;
        cache.put(user_id, generation, set.clone(), as_of, valid_until);
        Ok(set)
    }

    /// Effective capabilities read straight from the ledgers
    pub async fn effective_capabilities_fresh(&self, user_id: UserId) -> Result<BTreeSet<CapabilityCode>> {
        self.effective_capabilities_at(user_id, self.clock.now()).await
    }

    /// Effective capabilities as of an arbitrary instant (never cached)
    pub async fn effective_capabilities_at(
        &self,
        user_id: UserId,
        as_of: DateTime<Utc>,
    ) -> Result<BTreeSet<CapabilityCode>> {
        Ok(self.compute_effective(user_id, as_of).await?.0)
    }

    /// Active functions the user can reach, in menu order
    pub async fn accessible_functions(&self, user_id: UserId) -> Result<Vec<Function>> {
        let effective = self.effective_capabilities(user_id).await?;
        self.with_deadline(
            self.config.check_timeout,
            self.catalog
                .accessible_functions(&effective, self.config.menu_rule),
        )
        .await
    }

    /// Active groups the user currently belongs to
    pub async fn groups_for(&self, user_id: UserId) -> Result<Vec<PermissionGroup>> {
        let as_of = self.clock.now();
        self.with_deadline(self.config.check_timeout, async {
            let ids = self.memberships.active_groups_for(user_id, as_of).await?;
            self.groups.active_groups(&ids).await
        })
        .await
    }

    async fn compute_effective(
        &self,
        user_id: UserId,
        as_of: DateTime<Utc>,
    ) -> Result<(BTreeSet<CapabilityCode>, Option<DateTime<Utc>>)> {
        self.with_deadline(self.config.check_timeout, self.resolver.effective(user_id, as_of))
            .await
    }

    // ------------------------------------------------------------------
    // Administrative mutations
    // ------------------------------------------------------------------

    /// Place a user in a group; idempotent while the membership is active
    pub async fn assign_group(
        &self,
        user_id: UserId,
        group_id: GroupId,
        assigned_by: UserId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<MembershipId> {
        let mut assignment = GroupAssignment::new(user_id, group_id, assigned_by);
        assignment.expires_at = expires_at;
        self.assign_group_with(assignment).await
    }

    /// [`assign_group`](Self::assign_group) with the full request, reason included
    pub async fn assign_group_with(&self, assignment: GroupAssignment) -> Result<MembershipId> {
        let at = self.clock.now();
        let user_id = assignment.user_id;

        let outcome = self
            .mutate(async {
                let group = self.groups.group(assignment.group_id).await?;
                self.memberships.assign(&group, assignment, at).await
            })
            .await?;

        if let AssignOutcome::Created { .. } = outcome {
            self.invalidate_user(user_id);
        }
        Ok(outcome.membership().id)
    }

    /// Deactivate a user's membership in a group
    pub async fn revoke_group_membership(
        &self,
        user_id: UserId,
        group_id: GroupId,
        revoked_by: UserId,
    ) -> Result<()> {
        let at = self.clock.now();

        self.mutate(async {
            let group = self.groups.group(group_id).await?;
            self.memberships.revoke(user_id, &group, revoked_by, at).await
        })
        .await?;

        self.invalidate_user(user_id);
        Ok(())
    }

    /// Record an exceptional grant or revoke for one capability
    pub async fn grant_exception(&self, request: ExceptionRequest) -> Result<ExceptionId> {
        let at = self.clock.now();
        let user_id = request.user_id;

        let (row, _) = self
            .mutate(async {
                let capability = self
                    .catalog
                    .lookup(&request.capability_code)
                    .await?
                    .ok_or_else(|| PermissionError::UnknownCapability(request.capability_code.clone()))?;
                self.exceptions.grant(&capability, request, at).await
            })
            .await?;

        self.invalidate_user(user_id);
        Ok(row.id)
    }

    /// Deactivate an exception (the row is kept)
    pub async fn revoke_exception(&self, exception_id: ExceptionId, revoked_by: UserId) -> Result<()> {
        let at = self.clock.now();

        let (row, _) = self
            .mutate(self.exceptions.revoke(exception_id, revoked_by, at))
            .await?;

        self.invalidate_user(row.user_id);
        Ok(())
    }

    /// Make a user known to the engine
    pub async fn register_user(&self, user_id: UserId) -> Result<()> {
        self.mutate(self.store.register_user(user_id)).await
    }

    /// Remove a user; memberships and exceptions go with them, audit rows stay
    pub async fn delete_user(&self, user_id: UserId) -> Result<()> {
        self.mutate(self.store.delete_user(user_id)).await?;
        self.invalidate_user(user_id);
        info!("User {} deleted", user_id);
        Ok(())
    }

    /// Add a capability to a group bundle
    pub async fn grant_group_capability(&self, group_code: &str, capability_code: &str) -> Result<()> {
        self.mutate(self.groups.grant_capability(group_code, capability_code))
            .await?;
        self.invalidate_all();
        Ok(())
    }

    /// Remove a capability from a group bundle
    pub async fn revoke_group_capability(&self, group_code: &str, capability_code: &str) -> Result<bool> {
        let removed = self
            .mutate(self.groups.revoke_capability(group_code, capability_code))
            .await?;
        self.invalidate_all();
        Ok(removed)
    }

    pub async fn set_group_active(&self, group_code: &str, active: bool) -> Result<()> {
        self.mutate(self.groups.set_group_active(group_code, active))
            .await?;
        self.invalidate_all();
        Ok(())
    }

    pub async fn set_capability_active(&self, capability_code: &str, active: bool) -> Result<()> {
        self.mutate(self.catalog.set_capability_active(capability_code, active))
            .await?;
        self.invalidate_all();
        Ok(())
    }

    /// Hard delete; rejected while memberships reference the group
    pub async fn delete_group(&self, group_code: &str) -> Result<()> {
        self.mutate(self.groups.delete_group(group_code)).await?;
        self.invalidate_all();
        Ok(())
    }

    /// Hard delete; rejected while exceptions reference the capability
    pub async fn delete_capability(&self, capability_code: &str) -> Result<()> {
        self.mutate(self.catalog.delete_capability(capability_code))
            .await?;
        self.invalidate_all();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Audit trail
    // ------------------------------------------------------------------

    /// Audit records matching `query`, newest first
    pub async fn query_audit_trail(&self, query: &AuditQuery) -> Result<Vec<AccessAuditRecord>> {
        self.audit.query(query).await
    }

    /// Recompute the audit hash chain
    pub async fn verify_audit_trail(&self) -> Result<ChainVerification> {
        let verification = self.audit.verify().await?;
        if !verification.valid {
            warn!(
                "Audit chain verification failed at sequence {:?}",
                verification.first_invalid
            );
        }
        Ok(verification)
    }

    /// Wait for queued best-effort audit records to be written
    pub async fn flush_audit(&self) {
        self.audit.flush().await;
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    pub async fn get_metrics(&self) -> Option<EngineMetrics> {
        match &self.metrics {
            Some(metrics) => Some(metrics.get_metrics().await),
            None => None,
        }
    }

    pub async fn export_prometheus(&self) -> Option<String> {
        match &self.metrics {
            Some(metrics) => Some(metrics.export_prometheus().await),
            None => None,
        }
    }

    pub fn get_cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|cache| cache.stats())
    }

    // Private helpers

    fn invalidate_user(&self, user_id: UserId) {
        if let Some(cache) = &self.cache {
            cache.invalidate(user_id);
            debug!("Capability cache invalidated for user {}", user_id);
        }
    }

    fn invalidate_all(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
            debug!("Capability cache cleared");
        }
    }

    async fn with_deadline<T, F>(&self, deadline: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(deadline, fut)
            .await
            .map_err(|_| PermissionError::Timeout(deadline))?
    }

    async fn mutate<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let result = self.with_deadline(self.config.mutation_timeout, fut).await;

        if let Some(metrics) = &self.metrics {
            metrics.record_mutation(result.is_ok()).await;
        }
        if let Err(e) = &result {
            debug!("Mutation rejected: {}", e);
        }
        result
    }
}
