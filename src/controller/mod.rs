//! Controller module for Addon reconciliation
//! This module contains the main controller loop, the addon lifecycle state
//! machine, and the workflow and workload plumbing it drives.

mod checksum;
pub mod cluster;
mod finalizers;
mod lifecycle;
#[cfg(test)]
mod lifecycle_test;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod observer;
mod reconciler;
pub mod validation;
pub mod version_cache;
pub mod workflow;

pub use checksum::{check_checksum, ChecksumOutcome};
pub use cluster::{AddonCluster, EventType, KubeCluster};
pub use finalizers::{ADDON_FINALIZER, FIELD_MANAGER};
pub use lifecycle::Lifecycle;
pub use observer::{observe_resources, ResourceLister, WorkloadKind, OBSERVED_KINDS};
pub use reconciler::{addon_for_labels, calculate_backoff, run_controller, ControllerState};
pub use validation::{validate, ValidationError};
pub use version_cache::{DependencyState, Version, VersionCache};
pub use workflow::{
    build_workflow, workflow_api_resource, ArgoWorkflowEngine, WorkflowEngine,
    WorkflowLifecycle, WorkflowPhase,
};
