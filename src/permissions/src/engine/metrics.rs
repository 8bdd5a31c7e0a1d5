//! Prometheus-style metrics for the permission engine

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::resolver::DecisionReason;

/// Engine counters and latency summary
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    /// Total number of access checks
    pub total_checks: u64,

    pub allowed_decisions: u64,
    pub denied_decisions: u64,

    /// Decisions per reason
    pub decisions_by_reason: BTreeMap<&'static str, u64>,

    /// Effective-capability cache hits
    pub cache_hits: u64,

    /// Effective-capability cache misses
    pub cache_misses: u64,

    /// Mandatory audit writes that failed (each forced a denial)
    pub audit_failures: u64,

    /// Administrative mutations applied
    pub mutations: u64,

    /// Mutations that returned an error
    pub mutation_errors: u64,

    /// Check latency percentiles
    pub latency_p50_ms: f64,
    pub latency_p90_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_p999_ms: f64,

    pub avg_latency_ms: f64,
}

impl EngineMetrics {
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    pub fn allow_rate(&self) -> f64 {
        let total = self.allowed_decisions + self.denied_decisions;
        if total == 0 {
            0.0
        } else {
            self.allowed_decisions as f64 / total as f64
        }
    }
}

/// Metrics collector
pub struct MetricsCollector {
    metrics: Arc<RwLock<EngineMetrics>>,

    /// Recent latency samples in milliseconds
    latency_samples: Arc<RwLock<Vec<f64>>>,

    max_samples: usize,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(EngineMetrics::default())),
            latency_samples: Arc::new(RwLock::new(Vec::with_capacity(10_000))),
            max_samples: 10_000,
        }
    }

    pub async fn record_cache_hit(&self) {
        self.metrics.write().await.cache_hits += 1;
    }

    pub async fn record_cache_miss(&self) {
        self.metrics.write().await.cache_misses += 1;
    }

    /// Record the final decision of an access check
    pub async fn record_decision(&self, allowed: bool, reason: DecisionReason) {
        let mut metrics = self.metrics.write().await;
        metrics.total_checks += 1;

        if allowed {
            metrics.allowed_decisions += 1;
        } else {
            metrics.denied_decisions += 1;
        }
        *metrics.decisions_by_reason.entry(reason.as_str()).or_insert(0) += 1;
    }

    pub async fn record_audit_failure(&self) {
        self.metrics.write().await.audit_failures += 1;
    }

    pub async fn record_mutation(&self, succeeded: bool) {
        let mut metrics = self.metrics.write().await;
        if succeeded {
            metrics.mutations += 1;
        } else {
            metrics.mutation_errors += 1;
        }
    }

    /// Record check latency
    pub async fn record_latency(&self, latency: Duration) {
        let latency_ms = latency.as_secs_f64() * 1000.0;

        let mut samples = self.latency_samples.write().await;
        samples.push(latency_ms);

        if samples.len() > self.max_samples {
            samples.drain(0..1_000);
        }

        let mut metrics = self.metrics.write().await;

        let sum: f64 = samples.iter().sum();
        metrics.avg_latency_ms = sum / samples.len() as f64;

        let mut sorted = samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));

        metrics.latency_p50_ms = Self::percentile(&sorted, 0.50);
        metrics.latency_p90_ms = Self::percentile(&sorted, 0.90);
        metrics.latency_p95_ms = Self::percentile(&sorted, 0.95);
        metrics.latency_p99_ms = Self::percentile(&sorted, 0.99);
        metrics.latency_p999_ms = Self::percentile(&sorted, 0.999);
    }

    pub async fn get_metrics(&self) -> EngineMetrics {
        self.metrics.read().await.clone()
    }

    pub async fn reset(&self) {
        *self.metrics.write().await = EngineMetrics::default();
        self.latency_samples.write().await.clear();
    }

    /// Export metrics in Prometheus text format
    pub async fn export_prometheus(&self) -> String {
        let metrics = self.metrics.read().await;

        let mut out = format!(
            r#"# HELP permissions_checks_total Total number of access checks
# TYPE permissions_checks_total counter
permissions_checks_total {}

# HELP permissions_allowed_total Number of allowed decisions
# TYPE permissions_allowed_total counter
permissions_allowed_total {}

# HELP permissions_denied_total Number of denied decisions
# TYPE permissions_denied_total counter
permissions_denied_total {}

# HELP permissions_cache_hits_total Effective capability cache hits
# TYPE permissions_cache_hits_total counter
permissions_cache_hits_total {}

# HELP permissions_cache_misses_total Effective capability cache misses
# TYPE permissions_cache_misses_total counter
permissions_cache_misses_total {}

# HELP permissions_audit_failures_total Mandatory audit writes that failed
# TYPE permissions_audit_failures_total counter
permissions_audit_failures_total {}

# HELP permissions_mutations_total Administrative mutations applied
# TYPE permissions_mutations_total counter
permissions_mutations_total {}

# HELP permissions_mutation_errors_total Administrative mutations rejected or failed
# TYPE permissions_mutation_errors_total counter
permissions_mutation_errors_total {}

# HELP permissions_check_latency_seconds Access check latency percentiles
# TYPE permissions_check_latency_seconds summary
permissions_check_latency_seconds{{quantile="0.5"}} {}
permissions_check_latency_seconds{{quantile="0.9"}} {}
permissions_check_latency_seconds{{quantile="0.95"}} {}
permissions_check_latency_seconds{{quantile="0.99"}} {}
permissions_check_latency_seconds{{quantile="0.999"}} {}

# HELP permissions_decisions_total Decisions by reason
# TYPE permissions_decisions_total counter
"#,
            metrics.total_checks,
            metrics.allowed_decisions,
            metrics.denied_decisions,
            metrics.cache_hits,
            metrics.cache_misses,
            metrics.audit_failures,
            metrics.mutations,
            metrics.mutation_errors,
            metrics.latency_p50_ms / 1000.0,
            metrics.latency_p90_ms / 1000.0,
            metrics.latency_p95_ms / 1000.0,
            metrics.latency_p99_ms / 1000.0,
            metrics.latency_p999_ms / 1000.0,
        );

        for (reason, count) in &metrics.decisions_by_reason {
            out.push_str(&format!(
                "permissions_decisions_total{{reason=\"{}\"}} {}\n",
                reason, count
            ));
        }
        out
    }

    fn percentile(sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }

        let idx = ((sorted.len() as f64) * p) as usize;
        let idx = idx.min(sorted.len() - 1);
        sorted[idx]
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
