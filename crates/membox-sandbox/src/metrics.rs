//! Prometheus metrics for the membox sandbox.
//!
//! This module is only compiled when the `metrics` feature is enabled.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::audit::AuditEntry;

/// Label set for execution metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ExecutionLabels {
    /// The outcome: "success", "snippet_error", "infrastructure", "raised".
    pub outcome: String,
}

/// Prometheus metrics for the membox sandbox.
pub struct SandboxMetrics {
    /// Total number of executions by outcome.
    pub executions_total: Family<ExecutionLabels, Counter>,
    /// Execution duration in seconds, by outcome.
    pub execution_duration_seconds: Family<ExecutionLabels, Histogram>,
}

impl SandboxMetrics {
    /// Create a new `SandboxMetrics` and register all metrics with the
    /// given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let executions_total = Family::default();
        registry.register(
            "membox_sandbox_executions_total",
            "Total sandbox executions",
            executions_total.clone(),
        );

        let execution_duration_seconds =
            Family::<ExecutionLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(
                    [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0].into_iter(),
                )
            });
        registry.register(
            "membox_sandbox_execution_duration_seconds",
            "Sandbox execution duration",
            execution_duration_seconds.clone(),
        );

        Self {
            executions_total,
            execution_duration_seconds,
        }
    }

    /// Record one finished execution from its audit entry.
    pub fn record(&self, entry: &AuditEntry) {
        let labels = ExecutionLabels {
            outcome: entry.outcome.label().to_string(),
        };
        self.executions_total.get_or_create(&labels).inc();
        self.execution_duration_seconds
            .get_or_create(&labels)
            .observe(entry.duration_ms as f64 / 1000.0);
    }
}
