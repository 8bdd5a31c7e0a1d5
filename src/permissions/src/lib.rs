//! # Call Center Permission Engine
//!
//! Granular permission resolution for the call center platform: decides
//! whether a user may use a capability and leaves a tamper-evident audit
//! trail of every decision and administrative change.
//!
//! ## Features
//!
//! - **Layered model**: functions, capabilities, permission groups, time-bounded
//!   memberships and per-user exceptional grants/revokes
//! - **Deterministic precedence**: revoke beats grant beats group membership;
//!   unknown capabilities and users fail closed
//! - **Mandatory audit** for audit-flagged and alto/critico capabilities; a
//!   failed write turns the verdict into a denial
//! - **Hash-chained audit trail** (BLAKE3) with chain verification
//! - **Effective capability cache** with per-user invalidation
//! - **Pluggable storage**: in-memory, or PostgreSQL behind the `postgres` feature
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use callcenter_permissions::{
//!     AccessContext, Capability, EngineConfig, InMemoryStore, PermissionEngine, SensitivityLevel,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = PermissionEngine::new(EngineConfig::default(), Arc::new(InMemoryStore::new())).await?;
//!
//!     engine
//!         .catalog()
//!         .register_capability(Capability::new(
//!             "sistema.operaciones.llamadas.registrar",
//!             SensitivityLevel::Bajo,
//!         )?)
//!         .await?;
//!
//!     let decision = engine
//!         .check_access(42, "sistema.operaciones.llamadas.registrar", &AccessContext::new())
//!         .await;
//!
//!     if decision.allowed {
//!         println!("Access granted via {:?}", decision.matched_via);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod cache;
pub mod catalog;
pub mod clock;
pub mod engine;
pub mod error;
pub mod exception;
pub mod groups;
pub mod membership;
pub mod resolver;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use audit::{
    AccessAuditRecord, AccessContext, AuditConfig, AuditEvent, AuditQuery, ChainVerification,
};
pub use cache::{CacheConfig, CacheStats, Generation};
pub use catalog::MenuRule;
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{EngineConfig, EngineMetrics, PermissionEngine};
pub use error::{PermissionError, Result};
pub use exception::ExceptionRequest;
pub use membership::GroupAssignment;
pub use resolver::{Decision, DecisionReason, MatchedVia, Verdict};
pub use store::{InMemoryStore, PermissionStore};
#[cfg(feature = "postgres")]
pub use store::PostgresStore;
pub use types::{
    AccessCategory, Capability, CapabilityCode, ExceptionKind, ExceptionalGrant, Function,
    Membership, PermissionGroup, RiskLevel, SensitivityLevel, UserId,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
