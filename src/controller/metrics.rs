//! Prometheus metrics for the addon-manager operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `addonmgr_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `addonmgr_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `addonmgr_workflow_submissions_total` (counter): workflows submitted labeled by lifecycle step.
//! - `addonmgr_dependency_waits_total` (counter): passes spent waiting on a dependency, by state.
//! - `addonmgr_version_cache_entries` (gauge): packages currently in the version cache.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "addon"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Controller name, e.g. "addon"
    pub controller: String,
    /// Error kind/category, e.g. "kube", "validation", "workflow"
    pub kind: String,
}

/// Labels for workflow submissions
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StepLabels {
    /// Lifecycle step, e.g. "prereqs"
    pub step: String,
}

/// Labels for dependency waits
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DependencyLabels {
    /// "pending" or "missing"
    pub state: String,
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

/// Counter tracking lifecycle workflow submissions
pub static WORKFLOW_SUBMISSIONS_TOTAL: Lazy<Family<StepLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking reconciles that stopped to wait on a dependency
pub static DEPENDENCY_WAITS_TOTAL: Lazy<Family<DependencyLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Gauge tracking the number of packages in the version cache
pub static VERSION_CACHE_ENTRIES: Lazy<Gauge<i64, AtomicI64>> = Lazy::new(Gauge::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "addonmgr_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "addonmgr_reconcile_errors",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "addonmgr_workflow_submissions",
        "Total number of lifecycle workflows submitted",
        WORKFLOW_SUBMISSIONS_TOTAL.clone(),
    );
    registry.register(
        "addonmgr_dependency_waits",
        "Total number of reconciles waiting on a dependency",
        DEPENDENCY_WAITS_TOTAL.clone(),
    );
    registry.register(
        "addonmgr_version_cache_entries",
        "Number of packages tracked in the version cache",
        VERSION_CACHE_ENTRIES.clone(),
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

pub fn inc_workflow_submitted(step: &str) {
    let labels = StepLabels {
        step: step.to_string(),
    };
    WORKFLOW_SUBMISSIONS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_dependency_wait(state: &str) {
    let labels = DependencyLabels {
        state: state.to_string(),
    };
    DEPENDENCY_WAITS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_version_cache_entries(entries: usize) {
    VERSION_CACHE_ENTRIES.set(i64::try_from(entries).unwrap_or(i64::MAX));
}
