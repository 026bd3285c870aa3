//! Prometheus metrics for the NodeHealthCheck operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `nodehealth_reconcile_duration_seconds` (histogram): reconcile duration
//!   labeled by controller.
//! - `nodehealth_reconcile_errors_total` (counter): reconcile errors labeled
//!   by controller and kind.
//! - `nodehealth_old_remediation_cr` (counter): remediation requests that
//!   crossed the stale threshold without their node recovering, labeled by
//!   node and namespace. Incremented once per request object.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "nodehealthcheck"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Controller name, e.g. "nodehealthcheck"
    pub controller: String,
    /// Error kind/category, e.g. "kube", "template_not_found"
    pub kind: String,
}

/// Labels for the stale remediation counter
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OldRemediationLabels {
    pub node: String,
    pub namespace: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking remediation requests flagged as stale
pub static OLD_REMEDIATION_CR: Lazy<Family<OldRemediationLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "nodehealth_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );

    registry.register(
        "nodehealth_reconcile_errors_total",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );

    registry.register(
        "nodehealth_old_remediation_cr",
        "Remediation requests older than the stale threshold, by node and namespace",
        OLD_REMEDIATION_CR.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

/// Count a remediation request's first stale detection.
pub fn observe_old_remediation_cr(node: &str, namespace: &str) {
    let labels = OldRemediationLabels {
        node: node.to_string(),
        namespace: namespace.to_string(),
    };
    OLD_REMEDIATION_CR.get_or_create(&labels).inc();
}
