//! Capability catalog
//!
//! Registry of functions, capabilities and their associations. Lookups fail
//! closed: an unknown or inactive capability code is reported as absent, and
//! the resolver turns that into an unconditional denial.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{PermissionError, Result};
use crate::store::PermissionStore;
use crate::types::{Capability, CapabilityCode, Function, FunctionCapability};

/// How `required` links gate menu visibility of a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MenuRule {
    /// Visible when the user holds at least one candidate capability
    #[default]
    AnyRequired,
    /// Visible only when the user holds every candidate capability
    AllRequired,
}

impl fmt::Display for MenuRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MenuRule::AnyRequired => f.write_str("any_required"),
            MenuRule::AllRequired => f.write_str("all_required"),
        }
    }
}

impl FromStr for MenuRule {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "any" | "any_required" => Ok(MenuRule::AnyRequired),
            "all" | "all_required" => Ok(MenuRule::AllRequired),
            other => Err(PermissionError::InvalidInput(format!(
                "Unknown menu rule: {}",
                other
            ))),
        }
    }
}

/// Whether a function is reachable with the given effective capabilities.
///
/// The candidate set is the function's active `required` links, or its active
/// `visible_in_ui` links when nothing is marked required. A function without
/// candidates is never visible.
pub fn function_visible(
    links: &[(FunctionCapability, Capability)],
    effective: &BTreeSet<CapabilityCode>,
    rule: MenuRule,
) -> bool {
    let active = || links.iter().filter(|(_, cap)| cap.active);

    let mut candidates: Vec<&Capability> =
        active().filter(|(link, _)| link.required).map(|(_, cap)| cap).collect();
    if candidates.is_empty() {
        candidates = active()
            .filter(|(link, _)| link.visible_in_ui)
            .map(|(_, cap)| cap)
            .collect();
    }
    if candidates.is_empty() {
        return false;
    }

    match rule {
        MenuRule::AnyRequired => candidates.iter().any(|cap| effective.contains(&cap.code)),
        MenuRule::AllRequired => candidates.iter().all(|cap| effective.contains(&cap.code)),
    }
}

/// Registry of functions and capabilities
pub struct CapabilityCatalog {
    store: Arc<dyn PermissionStore>,
}

impl CapabilityCatalog {
    pub fn new(store: Arc<dyn PermissionStore>) -> Self {
        Self { store }
    }

    /// Look up an active capability. Unknown and inactive codes both yield `None`.
    pub async fn lookup(&self, code: &str) -> Result<Option<Capability>> {
        let capability = self.store.capability_by_code(code).await?;
        match capability {
            Some(cap) if cap.active => Ok(Some(cap)),
            Some(_) => {
                debug!("Capability '{}' is inactive", code);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Whether an active capability with this code exists
    pub async fn exists(&self, code: &str) -> Result<bool> {
        Ok(self.lookup(code).await?.is_some())
    }

    /// Active capabilities marked `required` for a function (menu gating only)
    pub async fn required_capabilities_for(&self, function_code: &str) -> Result<Vec<Capability>> {
        let links = self.function_links(function_code).await?;
        Ok(links
            .into_iter()
            .filter(|(link, cap)| link.required && cap.active)
            .map(|(_, cap)| cap)
            .collect())
    }

    /// Every link of a function joined with its capability
    pub async fn function_links(
        &self,
        function_code: &str,
    ) -> Result<Vec<(FunctionCapability, Capability)>> {
        let function = self
            .store
            .function_by_code(function_code)
            .await?
            .ok_or_else(|| PermissionError::UnknownFunction(function_code.to_string()))?;

        self.store.function_capabilities(function.id).await
    }

    /// Active functions, in menu order, reachable with `effective`
    pub async fn accessible_functions(
        &self,
        effective: &BTreeSet<CapabilityCode>,
        rule: MenuRule,
    ) -> Result<Vec<Function>> {
        let mut functions: Vec<Function> = self
            .store
            .list_functions()
            .await?
            .into_iter()
            .filter(|f| f.active)
            .collect();
        functions.sort_by(|a, b| a.menu_order.cmp(&b.menu_order).then_with(|| a.name.cmp(&b.name)));

        let mut accessible = Vec::new();
        for function in functions {
            let links = self.store.function_capabilities(function.id).await?;
            if function_visible(&links, effective, rule) {
                accessible.push(function);
            }
        }
        Ok(accessible)
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    pub async fn register_function(&self, function: Function) -> Result<Function> {
        let function = self.store.insert_function(function).await?;
        info!("Registered function '{}'", function.code);
        Ok(function)
    }

    pub async fn register_capability(&self, capability: Capability) -> Result<Capability> {
        let capability = self.store.insert_capability(capability).await?;
        info!(
            "Registered capability '{}' (sensitivity={}, audit={})",
            capability.code, capability.sensitivity, capability.requires_audit
        );
        Ok(capability)
    }

    /// Associate a capability with a function
    pub async fn link(
        &self,
        function_code: &str,
        capability_code: &str,
        required: bool,
        visible_in_ui: bool,
    ) -> Result<()> {
        let function = self.function(function_code).await?;
        let capability = self.capability(capability_code).await?;

        self.store
            .link_function_capability(FunctionCapability {
                function_id: function.id,
                capability_id: capability.id,
                required,
                visible_in_ui,
            })
            .await
    }

    pub async fn set_function_active(&self, function_code: &str, active: bool) -> Result<()> {
        let function = self.function(function_code).await?;
        self.store.set_function_active(function.id, active).await?;
        info!("Function '{}' active={}", function_code, active);
        Ok(())
    }

    pub async fn set_capability_active(&self, capability_code: &str, active: bool) -> Result<()> {
        let capability = self.capability(capability_code).await?;
        self.store.set_capability_active(capability.id, active).await?;
        info!("Capability '{}' active={}", capability_code, active);
        Ok(())
    }

    pub async fn delete_function(&self, function_code: &str) -> Result<()> {
        let function = self.function(function_code).await?;
        self.store.delete_function(function.id).await
    }

    /// Hard delete; rejected while exceptions reference the capability
    pub async fn delete_capability(&self, capability_code: &str) -> Result<()> {
        let capability = self.capability(capability_code).await?;
        self.store.delete_capability(capability.id).await
    }

    /// Capability row regardless of its active flag
    pub async fn capability(&self, code: &str) -> Result<Capability> {
        self.store
            .capability_by_code(code)
            .await?
            .ok_or_else(|| PermissionError::UnknownCapability(code.to_string()))
    }

    /// Function row regardless of its active flag
    pub async fn function(&self, code: &str) -> Result<Function> {
        self.store
            .function_by_code(code)
            .await?
            .ok_or_else(|| PermissionError::UnknownFunction(code.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::SensitivityLevel;

    async fn catalog() -> CapabilityCatalog {
        let catalog = CapabilityCatalog::new(Arc::new(InMemoryStore::new()));

        catalog
            .register_function(Function::new("sistema.operaciones.llamadas").unwrap().with_menu_order(2))
            .await
            .unwrap();
        catalog
            .register_function(Function::new("sistema.vistas.dashboards").unwrap().with_menu_order(1))
            .await
            .unwrap();

        for (code, sensitivity) in [
            ("sistema.operaciones.llamadas.ver", SensitivityLevel::Bajo),
            ("sistema.operaciones.llamadas.registrar", SensitivityLevel::Normal),
            ("sistema.vistas.dashboards.ver", SensitivityLevel::Bajo),
        ] {
            catalog
                .register_capability(Capability::new(code, sensitivity).unwrap())
                .await
                .unwrap();
        }

        catalog
            .link("sistema.operaciones.llamadas", "sistema.operaciones.llamadas.ver", true, true)
            .await
            .unwrap();
        catalog
            .link("sistema.operaciones.llamadas", "sistema.operaciones.llamadas.registrar", true, true)
            .await
            .unwrap();
        catalog
            .link("sistema.vistas.dashboards", "sistema.vistas.dashboards.ver", false, true)
            .await
            .unwrap();

        catalog
    }

    fn codes(codes: &[&str]) -> BTreeSet<CapabilityCode> {
        codes.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn test_lookup_fails_closed() {
        let catalog = catalog().await;

        assert!(catalog.lookup("sistema.operaciones.llamadas.ver").await.unwrap().is_some());
        assert!(catalog.lookup("sistema.nada.nada.nada").await.unwrap().is_none());

        catalog
            .set_capability_active("sistema.operaciones.llamadas.ver", false)
            .await
            .unwrap();
        assert!(!catalog.exists("sistema.operaciones.llamadas.ver").await.unwrap());
    }

    #[tokio::test]
    async fn test_required_capabilities() {
        let catalog = catalog().await;

        let required = catalog
            .required_capabilities_for("sistema.operaciones.llamadas")
            .await
            .unwrap();
        assert_eq!(required.len(), 2);

        let missing = catalog.required_capabilities_for("sistema.nada.nada").await;
        assert!(matches!(missing, Err(PermissionError::UnknownFunction(_))));
    }

    #[tokio::test]
    async fn test_menu_rule_any_vs_all() {
        let catalog = catalog().await;
        let held = codes(&["sistema.operaciones.llamadas.ver", "sistema.vistas.dashboards.ver"]);

        let any = catalog
            .accessible_functions(&held, MenuRule::AnyRequired)
            .await
            .unwrap();
        let any_codes: Vec<_> = any.iter().map(|f| f.code.as_str()).collect();
        assert_eq!(any_codes, vec!["sistema.vistas.dashboards", "sistema.operaciones.llamadas"]);

        let all = catalog
            .accessible_functions(&held, MenuRule::AllRequired)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].code, "sistema.vistas.dashboards");
    }

    #[tokio::test]
    async fn test_inactive_function_hidden() {
        let catalog = catalog().await;
        catalog
            .set_function_active("sistema.vistas.dashboards", false)
            .await
            .unwrap();

        let held = codes(&["sistema.vistas.dashboards.ver"]);
        let visible = catalog
            .accessible_functions(&held, MenuRule::AnyRequired)
            .await
            .unwrap();
        assert!(visible.is_empty());
    }

    #[test]
    fn test_menu_rule_parse() {
        assert_eq!("ALL".parse::<MenuRule>().unwrap(), MenuRule::AllRequired);
        assert_eq!("any_required".parse::<MenuRule>().unwrap(), MenuRule::AnyRequired);
        assert!("some".parse::<MenuRule>().is_err());
    }
}
