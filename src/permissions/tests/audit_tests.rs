//! Audit trail tests
//!
//! Mandatory-audit coverage, failure escalation, administrative events,
//! trail queries and hash-chain verification.

mod common;

use callcenter_permissions::{
    AccessContext, AuditConfig, AuditEvent, AuditQuery, DecisionReason, EngineConfig,
    ExceptionRequest, PermissionError, Verdict,
};
use chrono::Duration;
use common::*;
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr};

// ============================================================================
// MANDATORY COVERAGE
// ============================================================================

#[tokio::test]
async fn test_every_mandatory_check_writes_one_matching_record() {
    let fx = Fixture::seeded().await;
    let support = fx.group_id("soporte_tecnico").await;
    fx.engine.assign_group(AGENT, support, ADMIN, None).await.unwrap();

    let checks = [
        (AGENT, EDITAR_CONFIGURACION),
        (AGENT, ELIMINAR_USUARIO),
        (SUPERVISOR, EDITAR_CONFIGURACION),
        (SUPERVISOR, EXPORTAR_REPORTE),
        (AGENT, EDITAR_CONFIGURACION),
    ];

    for (user, code) in checks {
        let before = fx.store.audit_len().await;
        let decision = fx.engine.check_access(user, code, &AccessContext::new()).await;
        assert_eq!(fx.store.audit_len().await, before + 1);

        let latest = fx
            .engine
            .query_audit_trail(&AuditQuery {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(latest[0].capability_code, code);
        assert_eq!(latest[0].user_id, Some(user));
        assert_eq!(latest[0].decision, Some(decision.verdict()));
        assert_eq!(latest[0].reason, Some(decision.reason));
    }
}

#[tokio::test]
async fn test_context_is_persisted() {
    let fx = Fixture::seeded().await;
    let ip = IpAddr::V4(Ipv4Addr::new(10, 20, 30, 40));

    let context = AccessContext::new()
        .with_ip(ip)
        .with_user_agent("softphone/4.2")
        .with_resource("llamada-8812")
        .with_action("delete_user")
        .with_metadata("ticket", json!("INC-1200"));
    fx.engine.check_access(SUPERVISOR, ELIMINAR_USUARIO, &context).await;

    let records = fx
        .engine
        .query_audit_trail(&AuditQuery::for_user(SUPERVISOR))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);

    let record = &records[0];
    assert_eq!(record.ip_address, Some(ip));
    assert_eq!(record.user_agent.as_deref(), Some("softphone/4.2"));
    assert_eq!(record.resource_id.as_deref(), Some("llamada-8812"));
    assert_eq!(record.action, "delete_user");
    assert_eq!(record.metadata["ticket"], json!("INC-1200"));
    assert_eq!(record.timestamp, t0());
}

#[tokio::test]
async fn test_unknown_user_is_audited_without_reference() {
    let fx = Fixture::seeded().await;

    fx.engine
        .check_access(5555, ELIMINAR_USUARIO, &AccessContext::new())
        .await;

    let records = fx
        .engine
        .query_audit_trail(&AuditQuery {
            capability_code: Some(ELIMINAR_USUARIO.to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].user_id, None);
    assert_eq!(records[0].reason, Some(DecisionReason::UnknownUser));
    assert_eq!(records[0].metadata["requested_user_id"], json!(5555));
}

#[tokio::test]
async fn test_default_context_keeps_requesting_user() {
    let fx = Fixture::seeded().await;

    let decision = fx
        .engine
        .check_access(5555, ELIMINAR_USUARIO, &AccessContext::default())
        .await;
    assert_eq!(decision.reason, DecisionReason::UnknownUser);

    let records = fx
        .engine
        .query_audit_trail(&AuditQuery {
            capability_code: Some(ELIMINAR_USUARIO.to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].user_id, None);
    assert_eq!(records[0].metadata["requested_user_id"], json!(5555));
}

#[tokio::test]
async fn test_backdated_check_is_stamped_when_written() {
    let fx = Fixture::seeded().await;
    let evaluated_at = t0() - Duration::days(30);

    let context = AccessContext::new().as_of(evaluated_at);
    fx.engine.check_access(AGENT, ELIMINAR_USUARIO, &context).await;
    fx.engine
        .check_access(AGENT, ELIMINAR_USUARIO, &AccessContext::new())
        .await;

    let recent = fx
        .engine
        .query_audit_trail(&AuditQuery {
            from: Some(t0() - Duration::days(1)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(recent.len(), 2);
    assert!(recent.iter().all(|record| record.timestamp == t0()));

    // Newest first; only the backdated record carries its evaluation instant
    assert!(recent[0].metadata.get("evaluated_at").is_none());
    assert_eq!(
        recent[1].metadata["evaluated_at"],
        json!(evaluated_at.to_rfc3339())
    );

    assert!(fx.engine.verify_audit_trail().await.unwrap().valid);
}

// ============================================================================
// FAILURE ESCALATION
// ============================================================================

#[tokio::test]
async fn test_mandatory_audit_failure_denies() {
    let fx = Fixture::seeded().await;
    let support = fx.group_id("soporte_tecnico").await;
    fx.engine.assign_group(AGENT, support, ADMIN, None).await.unwrap();
    assert!(fx.engine.is_allowed(AGENT, EDITAR_CONFIGURACION).await);

    fx.store.set_fail_audit_writes(true);
    let decision = fx
        .engine
        .check_access(AGENT, EDITAR_CONFIGURACION, &AccessContext::new())
        .await;

    assert!(!decision.allowed);
    assert_eq!(decision.reason, DecisionReason::AuditFailure);
    assert_eq!(fx.engine.get_metrics().await.unwrap().audit_failures, 1);
}

#[tokio::test]
async fn test_best_effort_audit_failure_is_swallowed() {
    let fx = Fixture::seeded().await;
    let attention = fx.group_id("atencion_cliente").await;
    fx.engine.assign_group(AGENT, attention, ADMIN, None).await.unwrap();

    fx.store.set_fail_audit_writes(true);
    let decision = fx
        .engine
        .check_access(AGENT, REGISTRAR_LLAMADA, &AccessContext::new())
        .await;

    assert!(decision.allowed);
    assert_eq!(decision.reason, DecisionReason::GroupMembership);
}

#[tokio::test]
async fn test_unknown_capability_audit_is_mandatory() {
    let fx = Fixture::seeded().await;
    fx.store.set_fail_audit_writes(true);

    let decision = fx
        .engine
        .check_access(AGENT, "sistema.operaciones.colas.vaciar", &AccessContext::new())
        .await;

    assert!(!decision.allowed);
    assert_eq!(decision.reason, DecisionReason::AuditFailure);
}

#[tokio::test]
async fn test_mutation_fails_atomically_when_audit_unavailable() {
    let fx = Fixture::seeded().await;
    let attention = fx.group_id("atencion_cliente").await;

    fx.store.set_fail_audit_writes(true);
    let result = fx.engine.assign_group(AGENT, attention, ADMIN, None).await;
    assert!(result.is_err());

    let grant = fx
        .engine
        .grant_exception(ExceptionRequest::grant(AGENT, EXPORTAR_REPORTE, "Close", ADMIN))
        .await;
    assert!(grant.is_err());

    fx.store.set_fail_audit_writes(false);
    assert!(fx.engine.memberships().memberships_for(AGENT).await.unwrap().is_empty());
    assert!(fx.engine.effective_capabilities(AGENT).await.unwrap().is_empty());
    assert_eq!(fx.engine.get_metrics().await.unwrap().mutation_errors, 2);
}

// ============================================================================
// ADMINISTRATIVE EVENTS
// ============================================================================

#[tokio::test]
async fn test_administrative_events_are_recorded() {
    let fx = Fixture::seeded().await;
    let attention = fx.group_id("atencion_cliente").await;

    let membership = fx
        .engine
        .assign_group(AGENT, attention, ADMIN, None)
        .await
        .unwrap();
    fx.engine
        .revoke_group_membership(AGENT, attention, SUPERVISOR)
        .await
        .unwrap();
    let exception = fx
        .engine
        .grant_exception(ExceptionRequest::grant(AGENT, EXPORTAR_REPORTE, "Close", ADMIN))
        .await
        .unwrap();
    fx.engine.revoke_exception(exception, SUPERVISOR).await.unwrap();

    let trail = fx
        .engine
        .query_audit_trail(&AuditQuery::for_user(AGENT))
        .await
        .unwrap();
    let events: Vec<AuditEvent> = trail.iter().map(|r| r.event).collect();
    assert_eq!(
        events,
        vec![
            AuditEvent::ExceptionRevoked,
            AuditEvent::ExceptionGranted,
            AuditEvent::GroupRevoked,
            AuditEvent::GroupAssigned,
        ]
    );

    let assigned = &trail[3];
    assert_eq!(assigned.performed_by, Some(ADMIN));
    assert_eq!(assigned.capability_code, "grupo:atencion_cliente");
    assert_eq!(assigned.metadata["membership_id"], json!(membership));
    assert!(assigned.decision.is_none());

    let revoked = &trail[0];
    assert_eq!(revoked.performed_by, Some(SUPERVISOR));
    assert_eq!(revoked.metadata["exception_id"], json!(exception));
}

#[tokio::test]
async fn test_idempotent_assignment_writes_no_event() {
    let fx = Fixture::seeded().await;
    let attention = fx.group_id("atencion_cliente").await;

    fx.engine.assign_group(AGENT, attention, ADMIN, None).await.unwrap();
    let len = fx.store.audit_len().await;

    fx.engine.assign_group(AGENT, attention, ADMIN, None).await.unwrap();
    assert_eq!(fx.store.audit_len().await, len);
}

// ============================================================================
// QUERIES
// ============================================================================

#[tokio::test]
async fn test_query_filters() {
    let fx = Fixture::seeded().await;

    fx.engine
        .check_access(AGENT, ELIMINAR_USUARIO, &AccessContext::new().with_action("purge"))
        .await;
    fx.clock.advance(Duration::hours(1));
    fx.engine
        .check_access(AGENT, EDITAR_CONFIGURACION, &AccessContext::new())
        .await;
    fx.engine
        .check_access(SUPERVISOR, EDITAR_CONFIGURACION, &AccessContext::new())
        .await;

    let by_action = fx
        .engine
        .query_audit_trail(&AuditQuery {
            action: Some("purge".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_action.len(), 1);
    assert_eq!(by_action[0].capability_code, ELIMINAR_USUARIO);

    let recent = fx
        .engine
        .query_audit_trail(&AuditQuery {
            from: Some(t0() + Duration::minutes(30)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(recent.len(), 2);

    let early = fx
        .engine
        .query_audit_trail(&AuditQuery {
            user_id: Some(AGENT),
            to: Some(t0() + Duration::minutes(30)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(early.len(), 1);

    let denied = fx
        .engine
        .query_audit_trail(&AuditQuery {
            event: Some(AuditEvent::AccessDenied),
            limit: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(denied.len(), 2);
    assert!(denied[0].sequence > denied[1].sequence, "newest first");
    assert!(denied.iter().all(|r| r.decision == Some(Verdict::Denied)));
}

// ============================================================================
// TAMPER EVIDENCE
// ============================================================================

#[tokio::test]
async fn test_chain_verifies_and_detects_tampering() {
    let fx = Fixture::seeded().await;
    let attention = fx.group_id("atencion_cliente").await;
    fx.engine.assign_group(AGENT, attention, ADMIN, None).await.unwrap();
    for code in [REGISTRAR_LLAMADA, ELIMINAR_USUARIO, EDITAR_CONFIGURACION] {
        fx.engine.check_access(AGENT, code, &AccessContext::new()).await;
    }

    let verification = fx.engine.verify_audit_trail().await.unwrap();
    assert!(verification.valid);
    assert_eq!(verification.records_checked, 4);
    assert_eq!(verification.first_invalid, None);

    fx.store.tamper_audit(3, "check_access_forged").await;

    let verification = fx.engine.verify_audit_trail().await.unwrap();
    assert!(!verification.valid);
    assert_eq!(verification.first_invalid, Some(3));
}

// ============================================================================
// ASYNC BEST-EFFORT QUEUE
// ============================================================================

#[tokio::test]
async fn test_async_best_effort_records_flush() {
    let config = EngineConfig {
        audit_config: AuditConfig {
            async_best_effort: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let fx = Fixture::with_config(config).await;
    fx.seed().await;
    let attention = fx.group_id("atencion_cliente").await;
    fx.engine.assign_group(AGENT, attention, ADMIN, None).await.unwrap();

    for _ in 0..10 {
        assert!(fx.engine.is_allowed(AGENT, REGISTRAR_LLAMADA).await);
    }
    fx.engine.flush_audit().await;

    let records = fx
        .engine
        .query_audit_trail(&AuditQuery {
            capability_code: Some(REGISTRAR_LLAMADA.to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(records.len(), 10);
    assert!(fx.engine.verify_audit_trail().await.unwrap().valid);
}

#[tokio::test]
async fn test_audit_failure_error_is_not_retryable() {
    let error = PermissionError::AuditFailure("audit table unavailable".to_string());
    assert!(!error.is_retryable());
    assert!(PermissionError::ConcurrentModification("race".to_string()).is_retryable());
}
