//! Prometheus metrics for the reconciliation engine
//!
//! # Exported metrics
//! Registered on a caller-provided [`Registry`] (when built with `--features metrics`):
//! - `eksforge_reconcile_duration_seconds` (histogram): stage duration labeled by stage.
//! - `eksforge_reconcile_errors_total` (counter): stage failures labeled by stage and error kind.
//! - `eksforge_mutations_total` (counter): provider mutations labeled by resource kind and action.
//!
//! Counters are registered without the `_total` suffix; the encoder appends it.
//! The handle is carried in [`super::ReconcileContext`]; nothing here is global.

use std::sync::atomic::AtomicU64;

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for stage duration
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StageLabels {
    /// Stage name, e.g. "network", "cluster", "node_pools"
    pub stage: String,
}

/// Labels for stage errors
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub stage: String,
    /// Error kind, see [`crate::error::Error::kind`]
    pub kind: String,
}

/// Labels for provider mutations
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MutationLabels {
    /// Resource kind slug, e.g. "subnet", "node-pool"
    pub resource: String,
    /// "created", "updated" or "deleted"
    pub action: String,
}

fn stage_histogram() -> Histogram {
    // 0.5s .. ~68min across 14 buckets; cluster creation sits near the top.
    Histogram::new(exponential_buckets(0.5, 2.0, 14))
}

#[derive(Debug)]
pub struct Metrics {
    pub reconcile_duration_seconds: Family<StageLabels, Histogram, fn() -> Histogram>,
    pub reconcile_errors_total: Family<ErrorLabels, Counter<u64, AtomicU64>>,
    pub mutations_total: Family<MutationLabels, Counter<u64, AtomicU64>>,
}

impl Metrics {
    /// Create the metric families and register them on `registry`
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            reconcile_duration_seconds: Family::new_with_constructor(stage_histogram),
            reconcile_errors_total: Family::default(),
            mutations_total: Family::default(),
        };

        registry.register(
            "eksforge_reconcile_duration_seconds",
            "Duration of reconcile stages in seconds",
            metrics.reconcile_duration_seconds.clone(),
        );
        registry.register(
            "eksforge_reconcile_errors",
            "Total number of failed reconcile stages",
            metrics.reconcile_errors_total.clone(),
        );
        registry.register(
            "eksforge_mutations",
            "Total number of provider mutations issued",
            metrics.mutations_total.clone(),
        );

        metrics
    }

    /// Observe a stage duration in seconds.
    pub fn observe_stage(&self, stage: &str, seconds: f64) {
        let labels = StageLabels {
            stage: stage.to_string(),
        };
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(seconds);
    }

    /// Increment the stage error counter.
    pub fn inc_error(&self, stage: &str, kind: &str) {
        let labels = ErrorLabels {
            stage: stage.to_string(),
            kind: kind.to_string(),
        };
        self.reconcile_errors_total.get_or_create(&labels).inc();
    }

    pub fn inc_mutation(&self, resource: &str, action: &str) {
        let labels = MutationLabels {
            resource: resource.to_string(),
            action: action.to_string(),
        };
        self.mutations_total.get_or_create(&labels).inc();
    }
}

/// Render a registry in the OpenMetrics text format
pub fn render(registry: &Registry) -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    encode(&mut buffer, registry)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_are_registered_and_encoded() {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        metrics.observe_stage("network", 12.0);
        metrics.inc_error("node_pools", "partial_failure");
        metrics.inc_mutation("subnet", "created");
        metrics.inc_mutation("subnet", "created");

        let text = render(&registry).unwrap();
        assert!(text.contains("eksforge_reconcile_duration_seconds"));
        assert!(text.contains("eksforge_reconcile_errors_total"));
        assert!(text.contains(r#"eksforge_mutations_total{resource="subnet",action="created"} 2"#));
    }
}
