//! Shared fixtures for the integration suites

#![allow(dead_code)]

use callcenter_permissions::{
    AccessCategory, Capability, EngineConfig, InMemoryStore, ManualClock, PermissionEngine,
    PermissionGroup, SensitivityLevel,
};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, Once};

pub const AGENT: i64 = 1001;
pub const SUPERVISOR: i64 = 2001;
pub const ADMIN: i64 = 9001;

pub const REGISTRAR_LLAMADA: &str = "sistema.operaciones.llamadas.registrar";
pub const CONSULTAR_LLAMADA: &str = "sistema.operaciones.llamadas.consultar";
pub const ELIMINAR_USUARIO: &str = "sistema.administracion.usuarios.eliminar";
pub const EDITAR_CONFIGURACION: &str = "sistema.tecnico.configuracion.editar";
pub const EXPORTAR_REPORTE: &str = "sistema.analisis.reportes.exportar";

static TRACING: Once = Once::new();

/// Install a test subscriber once per binary; honours `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

/// Engine over an in-memory store with a manual clock starting at [`t0`]
pub struct Fixture {
    pub engine: PermissionEngine,
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<ManualClock>,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        init_tracing();

        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = PermissionEngine::with_clock(config, store.clone(), clock.clone())
            .await
            .unwrap();

        for user in [AGENT, SUPERVISOR, ADMIN] {
            engine.register_user(user).await.unwrap();
        }

        Self {
            engine,
            store,
            clock,
        }
    }

    /// Catalog and groups used across the suites:
    ///
    /// - `atencion_cliente` grants registrar + consultar (bajo)
    /// - `soporte_tecnico` grants editar configuracion (alto)
    /// - `supervision` (approval-gated) grants exportar reportes (normal, audited)
    /// - eliminar usuarios (critico, audited) is granted by nobody
    pub async fn seeded() -> Self {
        let fx = Self::new().await;
        fx.seed().await;
        fx
    }

    pub async fn seed(&self) {
        let catalog = self.engine.catalog();
        for capability in [
            Capability::new(REGISTRAR_LLAMADA, SensitivityLevel::Bajo).unwrap(),
            Capability::new(CONSULTAR_LLAMADA, SensitivityLevel::Bajo).unwrap(),
            Capability::new(ELIMINAR_USUARIO, SensitivityLevel::Critico)
                .unwrap()
                .with_audit(true),
            Capability::new(EDITAR_CONFIGURACION, SensitivityLevel::Alto).unwrap(),
            Capability::new(EXPORTAR_REPORTE, SensitivityLevel::Normal)
                .unwrap()
                .with_audit(true),
        ] {
            catalog.register_capability(capability).await.unwrap();
        }

        let groups = self.engine.groups();
        groups
            .register_group(
                PermissionGroup::new("atencion_cliente", AccessCategory::Operativo)
                    .unwrap()
                    .with_name("Atención al cliente"),
            )
            .await
            .unwrap();
        groups
            .register_group(PermissionGroup::new("soporte_tecnico", AccessCategory::Tecnico).unwrap())
            .await
            .unwrap();
        groups
            .register_group(
                PermissionGroup::new("supervision", AccessCategory::Gestion)
                    .unwrap()
                    .with_approval(true),
            )
            .await
            .unwrap();

        for (group, capability) in [
            ("atencion_cliente", REGISTRAR_LLAMADA),
            ("atencion_cliente", CONSULTAR_LLAMADA),
            ("soporte_tecnico", EDITAR_CONFIGURACION),
            ("supervision", EXPORTAR_REPORTE),
        ] {
            groups.grant_capability(group, capability).await.unwrap();
        }
    }

    pub async fn group_id(&self, code: &str) -> i64 {
        self.engine.groups().group_by_code(code).await.unwrap().id
    }
}
