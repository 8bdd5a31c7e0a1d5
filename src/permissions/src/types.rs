//! Core permission data model
//!
//! Entities mirror the persisted tables: functions, capabilities, their
//! association, permission groups, group capabilities, user memberships and
//! exceptional grants. Audit records live in [`crate::audit`].

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::{PermissionError, Result};

/// User identifier (owned by the external user directory)
pub type UserId = i64;

/// Function row identifier
pub type FunctionId = i64;

/// Capability row identifier
pub type CapabilityId = i64;

/// Permission group identifier
pub type GroupId = i64;

/// Membership row identifier
pub type MembershipId = i64;

/// Exceptional grant row identifier
pub type ExceptionId = i64;

/// Hierarchical capability code (`sistema.<dominio>.<recurso>.<accion>`)
pub type CapabilityCode = String;

/// Capability sensitivity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensitivityLevel {
    Bajo,
    Normal,
    Alto,
    Critico,
}

impl SensitivityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensitivityLevel::Bajo => "bajo",
            SensitivityLevel::Normal => "normal",
            SensitivityLevel::Alto => "alto",
            SensitivityLevel::Critico => "critico",
        }
    }

    /// Alto and critico capabilities always require a durable audit write
    pub fn is_high(&self) -> bool {
        match self {
            SensitivityLevel::Alto | SensitivityLevel::Critico => true,
            SensitivityLevel::Bajo | SensitivityLevel::Normal => false,
        }
    }
}

impl fmt::Display for SensitivityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensitivityLevel {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bajo" => Ok(SensitivityLevel::Bajo),
            "normal" => Ok(SensitivityLevel::Normal),
            "alto" => Ok(SensitivityLevel::Alto),
            "critico" => Ok(SensitivityLevel::Critico),
            other => Err(PermissionError::InvalidInput(format!(
                "Unknown sensitivity level: {}",
                other
            ))),
        }
    }
}

/// Risk level of a permission group
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Bajo,
    Medio,
    Alto,
    Critico,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Bajo => "bajo",
            RiskLevel::Medio => "medio",
            RiskLevel::Alto => "alto",
            RiskLevel::Critico => "critico",
        }
    }

    pub fn is_high(&self) -> bool {
        matches!(self, RiskLevel::Alto | RiskLevel::Critico)
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bajo" => Ok(RiskLevel::Bajo),
            "medio" => Ok(RiskLevel::Medio),
            "alto" => Ok(RiskLevel::Alto),
            "critico" => Ok(RiskLevel::Critico),
            other => Err(PermissionError::InvalidInput(format!(
                "Unknown risk level: {}",
                other
            ))),
        }
    }
}

/// Access category of a permission group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessCategory {
    Operativo,
    Gestion,
    Analisis,
    Estrategico,
    Tecnico,
    Finanzas,
    Calidad,
}

impl AccessCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessCategory::Operativo => "operativo",
            AccessCategory::Gestion => "gestion",
            AccessCategory::Analisis => "analisis",
            AccessCategory::Estrategico => "estrategico",
            AccessCategory::Tecnico => "tecnico",
            AccessCategory::Finanzas => "finanzas",
            AccessCategory::Calidad => "calidad",
        }
    }
}

impl fmt::Display for AccessCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessCategory {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "operativo" => Ok(AccessCategory::Operativo),
            "gestion" => Ok(AccessCategory::Gestion),
            "analisis" => Ok(AccessCategory::Analisis),
            "estrategico" => Ok(AccessCategory::Estrategico),
            "tecnico" => Ok(AccessCategory::Tecnico),
            "finanzas" => Ok(AccessCategory::Finanzas),
            "calidad" => Ok(AccessCategory::Calidad),
            other => Err(PermissionError::InvalidInput(format!(
                "Unknown access category: {}",
                other
            ))),
        }
    }
}

/// Direction of an exceptional override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionKind {
    /// Grants the capability regardless of group membership
    Grant,
    /// Removes the capability regardless of any grant
    Revoke,
}

impl ExceptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExceptionKind::Grant => "grant",
            ExceptionKind::Revoke => "revoke",
        }
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExceptionKind {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "grant" | "conceder" => Ok(ExceptionKind::Grant),
            "revoke" | "revocar" => Ok(ExceptionKind::Revoke),
            other => Err(PermissionError::InvalidInput(format!(
                "Unknown exception type: {}",
                other
            ))),
        }
    }
}

fn segment_pattern(segments: usize) -> String {
    format!(r"^sistema(\.[a-z][a-z0-9_]*){{{}}}$", segments)
}

fn function_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&segment_pattern(2)).expect("static regex"))
}

fn capability_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&segment_pattern(3)).expect("static regex"))
}

fn group_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("static regex"))
}

/// Validate a function code (`sistema.<dominio>.<recurso>`)
pub fn validate_function_code(code: &str) -> Result<()> {
    if function_code_regex().is_match(code) {
        Ok(())
    } else {
        Err(PermissionError::InvalidInput(format!(
            "Function code '{}' must look like sistema.<dominio>.<recurso>",
            code
        )))
    }
}

/// Validate a capability code (`sistema.<dominio>.<recurso>.<accion>`)
pub fn validate_capability_code(code: &str) -> Result<()> {
    if capability_code_regex().is_match(code) {
        Ok(())
    } else {
        Err(PermissionError::InvalidInput(format!(
            "Capability code '{}' must look like sistema.<dominio>.<recurso>.<accion>",
            code
        )))
    }
}

/// Validate a permission group code (`atencion_cliente`)
pub fn validate_group_code(code: &str) -> Result<()> {
    if group_code_regex().is_match(code) {
        Ok(())
    } else {
        Err(PermissionError::InvalidInput(format!(
            "Group code '{}' must be lowercase snake_case",
            code
        )))
    }
}

/// A system resource or menu node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    /// Row id (assigned by the store)
    pub id: FunctionId,

    /// Hierarchical code: `sistema.<dominio>.<recurso>`
    pub code: String,

    /// Short name (e.g., "llamadas")
    pub name: String,

    /// Domain segment (e.g., "operaciones")
    pub domain: String,

    /// Functional category used for menu grouping
    pub category: String,

    /// Optional menu icon
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    /// Menu ordering (lower first)
    pub menu_order: i32,

    /// Soft-delete flag
    pub active: bool,
}

impl Function {
    /// Create a function from its hierarchical code
    pub fn new(code: impl Into<String>) -> Result<Self> {
        let code = code.into();
        validate_function_code(&code)?;

        let mut segments = code.split('.').skip(1);
        let domain = segments.next().unwrap_or_default().to_string();
        let name = segments.next().unwrap_or_default().to_string();

        Ok(Self {
            id: 0,
            category: domain.clone(),
            code,
            name,
            domain,
            icon: None,
            menu_order: 999,
            active: true,
        })
    }

    pub fn with_menu_order(mut self, menu_order: i32) -> Self {
        self.menu_order = menu_order;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }
}

/// A fine-grained permission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    /// Row id (assigned by the store)
    pub id: CapabilityId,

    /// Hierarchical code: `sistema.<dominio>.<recurso>.<accion>`
    pub code: CapabilityCode,

    /// Domain segment
    pub domain: String,

    /// Resource segment
    pub resource: String,

    /// Action segment
    pub action: String,

    /// Sensitivity classification
    pub sensitivity: SensitivityLevel,

    /// Every access check must be audited durably
    pub requires_audit: bool,

    /// Soft-delete flag
    pub active: bool,
}

impl Capability {
    /// Create a capability from its hierarchical code
    pub fn new(code: impl Into<String>, sensitivity: SensitivityLevel) -> Result<Self> {
        let code = code.into();
        validate_capability_code(&code)?;

        let segments: Vec<&str> = code.split('.').collect();
        let (domain, resource, action) = (
            segments[1].to_string(),
            segments[2].to_string(),
            segments[3].to_string(),
        );

        Ok(Self {
            id: 0,
            code,
            domain,
            resource,
            action,
            sensitivity,
            requires_audit: false,
            active: true,
        })
    }

    /// Mark the capability as audit-required
    pub fn with_audit(mut self, requires_audit: bool) -> Self {
        self.requires_audit = requires_audit;
        self
    }

    /// Code of the function this capability belongs to
    pub fn function_code(&self) -> String {
        format!("sistema.{}.{}", self.domain, self.resource)
    }

    /// Whether every access check against this capability must be durably audited
    pub fn audit_mandatory(&self) -> bool {
        self.requires_audit || self.sensitivity.is_high()
    }
}

/// Association between a function and a capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCapability {
    pub function_id: FunctionId,
    pub capability_id: CapabilityId,

    /// Required to reach the function
    pub required: bool,

    /// Shown in menus / UI
    pub visible_in_ui: bool,
}

/// A named bundle of capabilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGroup {
    /// Row id (assigned by the store)
    pub id: GroupId,

    /// Unique code (e.g., "atencion_cliente")
    pub code: String,

    /// Display name
    pub name: String,

    /// Access category
    pub category: AccessCategory,

    /// Risk level
    pub risk_level: RiskLevel,

    /// Assignment needs a second actor (no self-assignment)
    pub requires_approval: bool,

    /// Soft-delete flag
    pub active: bool,
}

impl PermissionGroup {
    /// Create a new permission group
    pub fn new(code: impl Into<String>, category: AccessCategory) -> Result<Self> {
        let code = code.into();
        validate_group_code(&code)?;

        Ok(Self {
            id: 0,
            name: code.clone(),
            code,
            category,
            risk_level: RiskLevel::Bajo,
            requires_approval: false,
            active: true,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_risk_level(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    pub fn with_approval(mut self, requires_approval: bool) -> Self {
        self.requires_approval = requires_approval;
        self
    }
}

/// A user's time-bounded membership in a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub id: MembershipId,
    pub user_id: UserId,
    pub group_id: GroupId,
    pub assigned_at: DateTime<Utc>,

    /// `None` means permanent
    pub expires_at: Option<DateTime<Utc>>,

    /// Administrator who assigned it (nulled when that user is deleted)
    pub assigned_by: Option<UserId>,

    pub active: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_by: Option<UserId>,
}

impl Membership {
    /// Active iff flagged active and not yet expired at `as_of`
    pub fn is_active_at(&self, as_of: DateTime<Utc>) -> bool {
        self.active && self.expires_at.map_or(true, |expires| expires > as_of)
    }
}

/// A time-bounded per-user, per-capability override
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionalGrant {
    pub id: ExceptionId,
    pub user_id: UserId,
    pub capability_id: CapabilityId,
    pub capability_code: CapabilityCode,
    pub kind: ExceptionKind,
    pub starts_at: DateTime<Utc>,

    /// `None` means indefinite
    pub ends_at: Option<DateTime<Utc>>,

    pub reason: String,

    /// Administrator who authorized it (nulled when that user is deleted)
    pub authorized_by: Option<UserId>,

    pub active: bool,
    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_by: Option<UserId>,
}

impl ExceptionalGrant {
    /// Active iff flagged active and `starts_at <= as_of <= ends_at`
    pub fn is_active_at(&self, as_of: DateTime<Utc>) -> bool {
        self.active
            && self.starts_at <= as_of
            && self.ends_at.map_or(true, |ends| ends >= as_of)
    }
}
