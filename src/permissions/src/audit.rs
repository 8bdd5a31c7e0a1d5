//! Append-only, hash-chained audit trail
//!
//! Every access check and every administrative mutation produces an
//! [`AccessAuditRecord`]. Records are chained with BLAKE3: each record's hash
//! covers its content, its sequence number and the previous record's hash, so
//! any edit or deletion inside the trail breaks [`verify_chain`].
//!
//! Writes come in two modes:
//!
//! - **mandatory** (audit-required or alto/critico capabilities): the write is
//!   awaited and a failure is reported to the caller, which turns the verdict
//!   into `Denied(AuditFailure)`
//! - **best-effort**: failures are logged and swallowed; when the async queue is
//!   enabled the write is handed to a background worker that retries
//!   (at-least-once, duplicates tolerated)

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{PermissionError, Result};
use crate::resolver::{Decision, DecisionReason, Verdict};
use crate::store::PermissionStore;
use crate::types::UserId;

/// Audit record identifier
pub type AuditId = Uuid;

/// Hash that precedes the first record of the chain
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Kind of event an audit record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    AccessAllowed,
    AccessDenied,
    GroupAssigned,
    GroupRevoked,
    ExceptionGranted,
    ExceptionRevoked,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::AccessAllowed => "access_allowed",
            AuditEvent::AccessDenied => "access_denied",
            AuditEvent::GroupAssigned => "group_assigned",
            AuditEvent::GroupRevoked => "group_revoked",
            AuditEvent::ExceptionGranted => "exception_granted",
            AuditEvent::ExceptionRevoked => "exception_revoked",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "access_allowed" => Ok(AuditEvent::AccessAllowed),
            "access_denied" => Ok(AuditEvent::AccessDenied),
            "group_assigned" => Ok(AuditEvent::GroupAssigned),
            "group_revoked" => Ok(AuditEvent::GroupRevoked),
            "exception_granted" => Ok(AuditEvent::ExceptionGranted),
            "exception_revoked" => Ok(AuditEvent::ExceptionRevoked),
            other => Err(PermissionError::InvalidInput(format!(
                "Unknown audit event: {}",
                other
            ))),
        }
    }
}

/// Audit record before the store assigns its id and chain position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditRecord {
    /// Subject of the check or mutation
    pub user_id: Option<UserId>,

    /// Administrator behind a mutation
    pub performed_by: Option<UserId>,

    /// Capability code, or `grupo:<code>` for group mutations
    pub capability_code: String,

    pub event: AuditEvent,

    /// Business action performed by the caller (e.g., "LLAMADA_INICIADA")
    pub action: String,

    pub resource_id: Option<String>,
    pub ip_address: Option<IpAddr>,
    pub user_agent: Option<String>,

    /// Verdict for access checks
    pub decision: Option<Verdict>,
    pub reason: Option<DecisionReason>,

    pub metadata: serde_json::Value,

    /// Truncated to microseconds so the hash survives a database round trip
    pub timestamp: DateTime<Utc>,
}

impl NewAuditRecord {
    /// Record for a single access decision, written at `recorded_at`.
    ///
    /// An evaluation instant that differs from `recorded_at` is kept in the
    /// metadata as `evaluated_at`.
    pub fn access(
        decision: &Decision,
        context: &AccessContext,
        user_known: bool,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        let mut entry = Self {
            user_id: user_known.then_some(decision.user_id),
            performed_by: None,
            capability_code: decision.capability.clone(),
            event: if decision.allowed {
                AuditEvent::AccessAllowed
            } else {
                AuditEvent::AccessDenied
            },
            action: context
                .action
                .clone()
                .unwrap_or_else(|| "check_access".to_string()),
            resource_id: context.resource_id.clone(),
            ip_address: context.ip_address,
            user_agent: context.user_agent.clone(),
            decision: Some(decision.verdict()),
            reason: Some(decision.reason),
            metadata: context.metadata.clone(),
            timestamp: recorded_at.trunc_subsecs(6),
        };

        if !user_known {
            entry.annotate("requested_user_id", serde_json::json!(decision.user_id));
        }
        let evaluated_at = decision.as_of.trunc_subsecs(6);
        if evaluated_at != entry.timestamp {
            entry.annotate("evaluated_at", serde_json::json!(evaluated_at.to_rfc3339()));
        }
        entry
    }

    /// Record for an administrative mutation
    pub fn mutation(
        event: AuditEvent,
        user_id: UserId,
        performed_by: UserId,
        capability_code: impl Into<String>,
        metadata: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: Some(user_id),
            performed_by: Some(performed_by),
            capability_code: capability_code.into(),
            event,
            action: event.as_str().to_string(),
            resource_id: None,
            ip_address: None,
            user_agent: None,
            decision: None,
            reason: None,
            metadata,
            timestamp: at.trunc_subsecs(6),
        }
    }

    /// Insert a key into the metadata object
    pub fn annotate(&mut self, key: &str, value: serde_json::Value) {
        if !self.metadata.is_object() {
            self.metadata = serde_json::json!({});
        }
        if let serde_json::Value::Object(map) = &mut self.metadata {
            map.insert(key.to_string(), value);
        }
    }

    /// Assign id and chain position, computing the record hash
    pub fn seal(self, id: AuditId, sequence: u64, prev_hash: String) -> AccessAuditRecord {
        let mut record = AccessAuditRecord {
            id,
            sequence,
            user_id: self.user_id,
            performed_by: self.performed_by,
            capability_code: self.capability_code,
            event: self.event,
            action: self.action,
            resource_id: self.resource_id,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            decision: self.decision,
            reason: self.reason,
            metadata: self.metadata,
            timestamp: self.timestamp,
            prev_hash,
            hash: String::new(),
        };
        record.hash = record.compute_hash();
        record
    }
}

/// Immutable record of one access decision or administrative mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessAuditRecord {
    pub id: AuditId,

    /// Position in the chain (1-based)
    pub sequence: u64,

    /// Nulled when the user is deleted
    pub user_id: Option<UserId>,

    /// Nulled when the administrator is deleted
    pub performed_by: Option<UserId>,

    pub capability_code: String,
    pub event: AuditEvent,
    pub action: String,
    pub resource_id: Option<String>,
    pub ip_address: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub decision: Option<Verdict>,
    pub reason: Option<DecisionReason>,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,

    /// Hash of the previous record ([`GENESIS_HASH`] for the first)
    pub prev_hash: String,

    /// BLAKE3 hash of this record
    pub hash: String,
}

/// Hashed view of a record. Actor references are left out: they are nulled
/// when users are deleted and must not invalidate the chain.
#[derive(Serialize)]
struct HashedContent<'a> {
    sequence: u64,
    capability_code: &'a str,
    event: AuditEvent,
    action: &'a str,
    resource_id: &'a Option<String>,
    ip_address: &'a Option<IpAddr>,
    user_agent: &'a Option<String>,
    decision: &'a Option<Verdict>,
    reason: &'a Option<DecisionReason>,
    metadata: &'a serde_json::Value,
    timestamp: &'a DateTime<Utc>,
}

impl AccessAuditRecord {
    /// Recompute this record's hash from its content and `prev_hash`
    pub fn compute_hash(&self) -> String {
        let content = HashedContent {
            sequence: self.sequence,
            capability_code: &self.capability_code,
            event: self.event,
            action: &self.action,
            resource_id: &self.resource_id,
            ip_address: &self.ip_address,
            user_agent: &self.user_agent,
            decision: &self.decision,
            reason: &self.reason,
            metadata: &self.metadata,
            timestamp: &self.timestamp,
        };

        // serde_json maps are BTreeMap-backed, so the encoding is canonical
        let encoded = serde_json::to_vec(&content).unwrap_or_default();

        let mut hasher = blake3::Hasher::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(&self.sequence.to_le_bytes());
        hasher.update(&encoded);
        hasher.finalize().to_hex().to_string()
    }
}

/// Result of walking the audit chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub records_checked: usize,
    pub valid: bool,

    /// Sequence of the first record that fails verification
    pub first_invalid: Option<u64>,
}

/// Verify a chain given in ascending sequence order
pub fn verify_chain(records: &[AccessAuditRecord]) -> ChainVerification {
    let mut prev_hash = GENESIS_HASH.to_string();
    let mut expected_sequence = 1u64;

    for record in records {
        let intact = record.sequence == expected_sequence
            && record.prev_hash == prev_hash
            && record.compute_hash() == record.hash;

        if !intact {
            debug!("Audit chain broken at sequence {}", record.sequence);
            return ChainVerification {
                records_checked: records.len(),
                valid: false,
                first_invalid: Some(record.sequence),
            };
        }

        prev_hash = record.hash.clone();
        expected_sequence += 1;
    }

    ChainVerification {
        records_checked: records.len(),
        valid: true,
        first_invalid: None,
    }
}

/// Filters for reading the audit trail
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    pub user_id: Option<UserId>,
    pub event: Option<AuditEvent>,

    /// Caller-supplied business action
    pub action: Option<String>,

    pub capability_code: Option<String>,

    /// Inclusive lower bound
    pub from: Option<DateTime<Utc>>,

    /// Inclusive upper bound
    pub to: Option<DateTime<Utc>>,

    /// Maximum number of records (newest first)
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &AccessAuditRecord) -> bool {
        self.user_id.map_or(true, |u| record.user_id == Some(u))
            && self.event.map_or(true, |e| record.event == e)
            && self.action.as_ref().map_or(true, |a| &record.action == a)
            && self
                .capability_code
                .as_ref()
                .map_or(true, |c| &record.capability_code == c)
            && self.from.map_or(true, |from| record.timestamp >= from)
            && self.to.map_or(true, |to| record.timestamp <= to)
    }
}

/// Per-request context supplied by the caller of `check_access`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessContext {
    pub ip_address: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub resource_id: Option<String>,

    /// Business action being performed (recorded verbatim)
    pub action: Option<String>,

    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,

    /// Evaluate as of this instant instead of the engine clock
    pub as_of: Option<DateTime<Utc>>,

    /// Overrides the engine's default check deadline
    #[serde(skip)]
    pub deadline: Option<Duration>,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

impl Default for AccessContext {
    fn default() -> Self {
        Self {
            ip_address: None,
            user_agent: None,
            resource_id: None,
            action: None,
            metadata: empty_object(),
            as_of: None,
            deadline: None,
        }
    }
}

impl AccessContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip_address = Some(ip);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        if !self.metadata.is_object() {
            self.metadata = empty_object();
        }
        if let serde_json::Value::Object(map) = &mut self.metadata {
            map.insert(key.into(), value);
        }
        self
    }

    pub fn as_of(mut self, as_of: DateTime<Utc>) -> Self {
        self.as_of = Some(as_of);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Audit recorder configuration
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Hand best-effort writes to a background worker
    pub async_best_effort: bool,

    /// Capacity of the background queue
    pub queue_capacity: usize,

    /// Retries per queued record before it is dropped with an error log
    pub max_retries: u32,

    /// Delay between retries
    pub retry_backoff: Duration,

    /// Deadline for a single audit write
    pub write_timeout: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            async_best_effort: false,
            queue_capacity: 1_024,
            max_retries: 3,
            retry_backoff: Duration::from_millis(50),
            write_timeout: Duration::from_secs(2),
        }
    }
}

/// Tracks queued records so callers can wait for the worker to drain
#[derive(Default)]
struct PendingWrites {
    count: AtomicUsize,
    drained: Notify,
}

impl PendingWrites {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// The only writer of the audit trail
pub struct AuditRecorder {
    store: Arc<dyn PermissionStore>,
    config: AuditConfig,
    queue: Option<mpsc::Sender<NewAuditRecord>>,
    pending: Arc<PendingWrites>,
}

impl AuditRecorder {
    /// Create a recorder; spawns the background worker when async writes are enabled
    pub fn new(store: Arc<dyn PermissionStore>, config: AuditConfig) -> Self {
        let pending = Arc::new(PendingWrites::default());

        let queue = if config.async_best_effort {
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            tokio::spawn(Self::run_worker(
                store.clone(),
                config.clone(),
                rx,
                pending.clone(),
            ));
            Some(tx)
        } else {
            None
        };

        Self {
            store,
            config,
            queue,
            pending,
        }
    }

    /// Persist a record.
    ///
    /// Mandatory writes return the new record id or `AuditFailure`. Best-effort
    /// writes never fail; they return `None` when queued or when the write was
    /// lost.
    pub async fn record(&self, entry: NewAuditRecord, mandatory: bool) -> Result<Option<AuditId>> {
        if mandatory {
            return self.write_now(entry).await.map(Some);
        }

        if let Some(queue) = &self.queue {
            self.pending.add();
            match queue.try_send(entry) {
                Ok(()) => return Ok(None),
                Err(mpsc::error::TrySendError::Full(entry))
                | Err(mpsc::error::TrySendError::Closed(entry)) => {
                    // Queue unavailable: write inline rather than lose the record
                    self.pending.done();
                    return Ok(self.write_best_effort(entry).await);
                }
            }
        }

        Ok(self.write_best_effort(entry).await)
    }

    /// Wait until every queued best-effort record has been processed
    pub async fn flush(&self) {
        loop {
            let drained = self.pending.drained.notified();
            if self.pending.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Read the trail, newest first
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AccessAuditRecord>> {
        self.store.query_audit(query).await
    }

    /// Recompute the hash chain over the whole trail
    pub async fn verify(&self) -> Result<ChainVerification> {
        let chain = self.store.audit_chain().await?;
        Ok(verify_chain(&chain))
    }

    async fn write_now(&self, entry: NewAuditRecord) -> Result<AuditId> {
        match tokio::time::timeout(self.config.write_timeout, self.store.append_audit(entry)).await {
            Ok(Ok(record)) => {
                debug!("Audit record {} written (seq {})", record.id, record.sequence);
                Ok(record.id)
            }
            Ok(Err(e)) => Err(PermissionError::AuditFailure(e.to_string())),
            Err(_) => Err(PermissionError::AuditFailure(format!(
                "write exceeded {:?}",
                self.config.write_timeout
            ))),
        }
    }

    async fn write_best_effort(&self, entry: NewAuditRecord) -> Option<AuditId> {
        let capability = entry.capability_code.clone();
        match self.write_now(entry).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Best-effort audit write for '{}' lost: {}", capability, e);
                None
            }
        }
    }

    async fn run_worker(
        store: Arc<dyn PermissionStore>,
        config: AuditConfig,
        mut rx: mpsc::Receiver<NewAuditRecord>,
        pending: Arc<PendingWrites>,
    ) {
        while let Some(entry) = rx.recv().await {
            let mut attempt = 0;
            loop {
                let write = store.append_audit(entry.clone());
                match tokio::time::timeout(config.write_timeout, write).await {
                    Ok(Ok(_)) => break,
                    Ok(Err(e)) if attempt < config.max_retries => {
                        debug!("Queued audit write failed (attempt {}): {}", attempt + 1, e);
                    }
                    Err(_) if attempt < config.max_retries => {
                        debug!("Queued audit write timed out (attempt {})", attempt + 1);
                    }
                    Ok(Err(e)) => {
                        error!(
                            "Dropping audit record for '{}' after {} retries: {}",
                            entry.capability_code, config.max_retries, e
                        );
                        break;
                    }
                    Err(_) => {
                        error!(
                            "Dropping audit record for '{}' after {} timed-out retries",
                            entry.capability_code, config.max_retries
                        );
                        break;
                    }
                }
                attempt += 1;
                tokio::time::sleep(config.retry_backoff).await;
            }
            pending.done();
        }
        debug!("Audit worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn sample(n: u64) -> NewAuditRecord {
        NewAuditRecord::mutation(
            AuditEvent::GroupAssigned,
            1,
            2,
            format!("grupo:grupo_{}", n),
            json!({ "n": n }),
            Utc::now(),
        )
    }

    fn build_chain(len: u64) -> Vec<AccessAuditRecord> {
        let mut prev = GENESIS_HASH.to_string();
        (1..=len)
            .map(|seq| {
                let record = sample(seq).seal(Uuid::new_v4(), seq, prev.clone());
                prev = record.hash.clone();
                record
            })
            .collect()
    }

    #[test]
    fn test_chain_verifies() {
        let chain = build_chain(5);
        let verification = verify_chain(&chain);
        assert!(verification.valid);
        assert_eq!(verification.records_checked, 5);
    }

    #[test]
    fn test_tampered_record_detected() {
        let mut chain = build_chain(4);
        chain[2].action = "edited".to_string();

        let verification = verify_chain(&chain);
        assert!(!verification.valid);
        assert_eq!(verification.first_invalid, Some(3));
    }

    #[test]
    fn test_removed_record_detected() {
        let mut chain = build_chain(4);
        chain.remove(1);

        let verification = verify_chain(&chain);
        assert!(!verification.valid);
        assert_eq!(verification.first_invalid, Some(3));
    }

    #[test]
    fn test_nulling_actor_keeps_chain_valid() {
        let mut chain = build_chain(3);
        chain[1].user_id = None;
        chain[1].performed_by = None;

        assert!(verify_chain(&chain).valid);
    }

    #[test]
    fn test_query_filters() {
        let record = sample(1).seal(Uuid::new_v4(), 1, GENESIS_HASH.to_string());

        assert!(AuditQuery::for_user(1).matches(&record));
        assert!(!AuditQuery::for_user(9).matches(&record));

        let by_event = AuditQuery {
            event: Some(AuditEvent::GroupRevoked),
            ..Default::default()
        };
        assert!(!by_event.matches(&record));

        let window = AuditQuery {
            from: Some(record.timestamp),
            to: Some(record.timestamp),
            ..Default::default()
        };
        assert!(window.matches(&record));
    }

    #[tokio::test]
    async fn test_mandatory_write_failure_is_reported() {
        let store = Arc::new(InMemoryStore::new());
        store.set_fail_audit_writes(true);
        let recorder = AuditRecorder::new(store.clone(), AuditConfig::default());

        let result = recorder.record(sample(1), true).await;
        assert!(matches!(result, Err(PermissionError::AuditFailure(_))));

        // Best-effort failure is swallowed
        let result = recorder.record(sample(2), false).await;
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn test_async_queue_delivers_after_retries() {
        let store = Arc::new(InMemoryStore::new());
        let config = AuditConfig {
            async_best_effort: true,
            retry_backoff: Duration::from_millis(20),
            max_retries: 10,
            ..Default::default()
        };
        let recorder = AuditRecorder::new(store.clone(), config);

        store.set_fail_audit_writes(true);
        recorder.record(sample(1), false).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        store.set_fail_audit_writes(false);
        recorder.flush().await;

        let records = recorder.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(recorder.verify().await.unwrap().valid);
    }
}
