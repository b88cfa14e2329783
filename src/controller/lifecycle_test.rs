//! Lifecycle state machine tests against an in-memory cluster and workflow engine

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{DynamicObject, ObjectMeta},
    runtime::controller::Action,
    ResourceExt,
};
use serde_json::json;

use super::cluster::{AddonCluster, EventType};
use super::finalizers::{has_finalizer, ADDON_FINALIZER};
use super::lifecycle::Lifecycle;
use super::observer::{ResourceLister, WorkloadKind};
use super::reconciler::reconcile_addon;
use super::version_cache::{DependencyState, Version, VersionCache};
use super::workflow::{WorkflowEngine, WorkflowLifecycle, WorkflowPhase};
use crate::config::OperatorConfig;
use crate::crd::{
    Addon, AddonSpec, AddonStatus, ApplicationAssemblyPhase, LifecycleStep, ObjectStatus,
    SecretRef, SelectorRequirement, WorkflowType,
};
use crate::error::{Error, Result};

const NAMESPACE: &str = "addon-manager-system";
const NOW: i64 = 1_700_000_000_000;
const TEMPLATE: &str = "apiVersion: argoproj.io/v1alpha1\nkind: Workflow\nspec:\n  entrypoint: main\n";

#[derive(Default)]
struct ClusterState {
    statuses: Vec<AddonStatus>,
    finalizers_added: usize,
    finalizers_removed: usize,
    secrets: BTreeSet<String>,
    events: Vec<(EventType, String, String)>,
    /// Addon returned by `get_addon`
    stored: Option<Addon>,
    /// Finalizer removals that fail before one succeeds
    failing_finalizer_removals: usize,
}

#[derive(Default)]
struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    fn last_status(&self) -> Option<AddonStatus> {
        self.state.lock().unwrap().statuses.last().cloned()
    }

    fn has_event(&self, type_: EventType, reason: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .any(|(t, r, _)| *t == type_ && r == reason)
    }

    fn event_count(&self, reason: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|(_, r, _)| r == reason)
            .count()
    }
}

#[async_trait]
impl AddonCluster for FakeCluster {
    async fn get_addon(&self, _namespace: &str, _name: &str) -> Result<Option<Addon>> {
        Ok(self.state.lock().unwrap().stored.clone())
    }

    async fn update_status(&self, addon: &Addon) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .statuses
            .push(addon.status.clone().unwrap_or_default());
        Ok(())
    }

    async fn add_finalizer(&self, addon: &mut Addon) -> Result<()> {
        if has_finalizer(addon) || addon.is_being_deleted() {
            return Ok(());
        }
        addon
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(ADDON_FINALIZER.to_string());
        self.state.lock().unwrap().finalizers_added += 1;
        Ok(())
    }

    async fn remove_finalizer(&self, addon: &mut Addon) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.failing_finalizer_removals > 0 {
                state.failing_finalizer_removals -= 1;
                return Err(Error::ConfigError("finalizer patch conflict".to_string()));
            }
        }
        if let Some(finalizers) = addon.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != ADDON_FINALIZER);
        }
        self.state.lock().unwrap().finalizers_removed += 1;
        Ok(())
    }

    async fn secret_names(&self, _namespace: &str) -> Result<BTreeSet<String>> {
        Ok(self.state.lock().unwrap().secrets.clone())
    }

    async fn publish_event(&self, _addon: &Addon, type_: EventType, reason: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .events
            .push((type_, reason.to_string(), message.to_string()));
    }
}

#[derive(Default)]
struct EngineState {
    phases: HashMap<String, WorkflowPhase>,
    /// Workflows known to the API server, whether or not the view has them
    created: BTreeSet<String>,
    submitted: Vec<String>,
    deleted: Vec<String>,
    fail_submit: bool,
}

/// Workflow engine whose synchronized view is a plain map of name -> phase
#[derive(Default)]
struct FakeEngine {
    state: Mutex<EngineState>,
}

impl FakeEngine {
    fn set_phase(&self, name: &str, phase: WorkflowPhase) {
        self.state
            .lock()
            .unwrap()
            .phases
            .insert(name.to_string(), phase);
    }

    /// Drop a workflow from the synchronized view only
    fn forget(&self, name: &str) {
        self.state.lock().unwrap().phases.remove(name);
    }

    fn submitted(&self) -> Vec<String> {
        self.state.lock().unwrap().submitted.clone()
    }

    fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }
}

#[async_trait]
impl WorkflowEngine for FakeEngine {
    async fn submit(&self, workflow: &DynamicObject) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_submit {
            return Err(Error::WorkflowError("engine unavailable".to_string()));
        }
        let name = workflow.name_any();
        state.submitted.push(name.clone());
        state.created.insert(name.clone());
        state.phases.entry(name).or_insert(WorkflowPhase::Pending);
        Ok(())
    }

    fn phase(&self, _namespace: &str, name: &str) -> Option<WorkflowPhase> {
        self.state.lock().unwrap().phases.get(name).copied()
    }

    async fn fetch_phase(&self, _namespace: &str, name: &str) -> Result<Option<WorkflowPhase>> {
        let state = self.state.lock().unwrap();
        let phase = state.phases.get(name).copied();
        Ok(phase.or_else(|| state.created.contains(name).then_some(WorkflowPhase::Pending)))
    }

    async fn list_owned(&self, _namespace: &str, addon_name: &str) -> Result<Vec<String>> {
        let prefix = format!("{}-", addon_name);
        Ok(self
            .state
            .lock()
            .unwrap()
            .phases
            .keys()
            .filter(|name| name.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.phases.remove(name);
        state.created.remove(name);
        state.deleted.push(name.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct FakeLister {
    failing: Vec<WorkloadKind>,
    panics: bool,
}

#[async_trait]
impl ResourceLister for FakeLister {
    async fn list(
        &self,
        kind: WorkloadKind,
        _namespace: &str,
        _selector: &str,
    ) -> Result<Vec<ObjectStatus>> {
        if self.panics {
            panic!("lister exploded on {}", kind.as_str());
        }
        if self.failing.contains(&kind) {
            return Err(Error::ObservationError(format!("cannot list {}", kind.as_str())));
        }
        match kind {
            WorkloadKind::Service | WorkloadKind::Deployment => Ok(vec![ObjectStatus {
                kind: kind.as_str().to_string(),
                group: String::new(),
                name: "event-router".to_string(),
                status: "Ready 1/1".to_string(),
            }]),
            _ => Ok(vec![]),
        }
    }
}

struct Harness {
    cluster: FakeCluster,
    engine: FakeEngine,
    lister: FakeLister,
    versions: VersionCache,
    config: OperatorConfig,
}

impl Harness {
    fn new() -> Self {
        Self {
            cluster: FakeCluster::default(),
            engine: FakeEngine::default(),
            lister: FakeLister::default(),
            versions: VersionCache::new(),
            config: OperatorConfig::new(None, 600, 5),
        }
    }

    fn lifecycle(&self) -> Lifecycle<'_> {
        Lifecycle::new(
            &self.cluster,
            &self.engine,
            &self.lister,
            &self.versions,
            &self.config,
        )
    }

    fn provide(&self, pkg: &str, owner: &str, phase: ApplicationAssemblyPhase) {
        self.versions.add_version(Version {
            namespace: NAMESPACE.to_string(),
            name: owner.to_string(),
            pkg_name: pkg.to_string(),
            pkg_version: "1.0.0".to_string(),
            phase: Some(phase),
        });
    }

    /// First pass on a new spec: the checksum gate resets the status
    async fn reset(&self, addon: &mut Addon) {
        let action = self.lifecycle().process(addon, NOW).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::ZERO));
    }
}

fn addon(install_template: &str) -> Addon {
    let spec: AddonSpec = serde_json::from_value(json!({
        "pkgName": "event-router",
        "pkgVersion": "v0.2",
        "lifecycle": {
            "prereqs": { "template": "" },
            "install": { "template": install_template }
        }
    }))
    .unwrap();

    Addon {
        metadata: ObjectMeta {
            name: Some("event-router".to_string()),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some("0f1e2d3c".to_string()),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

fn mark_deleted(addon: &mut Addon) {
    addon.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    addon.metadata.finalizers = Some(vec![ADDON_FINALIZER.to_string()]);
}

#[tokio::test]
async fn test_checksum_change_clears_status_before_any_submission() {
    let h = Harness::new();
    let mut addon = addon(TEMPLATE);
    addon.status = Some(AddonStatus {
        checksum: "deadbeef".to_string(),
        starttime: NOW - 1_000,
        reason: Some("old failure".to_string()),
        resources: vec![ObjectStatus {
            kind: "Deployment".to_string(),
            name: "old".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    });
    addon.set_prereq_and_install_statuses(ApplicationAssemblyPhase::Failed);
    h.engine
        .set_phase("event-router-install-deadbeef-wf", WorkflowPhase::Failed);

    h.reset(&mut addon).await;

    let status = addon.status.clone().unwrap();
    assert_eq!(status.checksum, addon.spec.checksum());
    assert_eq!(status.starttime, NOW);
    assert_eq!(status.reason, None);
    assert!(status.resources.is_empty());
    assert_eq!(status.lifecycle.prereqs, Some(ApplicationAssemblyPhase::Pending));
    assert_eq!(status.lifecycle.installed, Some(ApplicationAssemblyPhase::Pending));
    assert!(h.engine.submitted().is_empty());
    assert_eq!(h.engine.deleted(), vec!["event-router-install-deadbeef-wf"]);

    // Unchanged spec continues normally on the next pass
    h.lifecycle().process(&mut addon, NOW).await.unwrap();
    assert_eq!(h.engine.submitted().len(), 1);
}

#[tokio::test]
async fn test_install_is_submitted_once_and_tracked_to_success() {
    let h = Harness::new();
    let mut addon = addon(TEMPLATE);
    h.reset(&mut addon).await;

    let action = h.lifecycle().process(&mut addon, NOW).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    assert_eq!(addon.prereqs_phase(), Some(ApplicationAssemblyPhase::Succeeded));
    assert_eq!(addon.install_phase(), Some(ApplicationAssemblyPhase::Running));
    assert!(has_finalizer(&addon));
    assert!(h.cluster.has_event(EventType::Normal, "Submitted"));

    let name = addon.workflow_name(LifecycleStep::Install);
    assert_eq!(h.engine.submitted(), vec![name.clone()]);

    // Still running: re-invoking never submits again
    h.engine.set_phase(&name, WorkflowPhase::Running);
    h.lifecycle().process(&mut addon, NOW).await.unwrap();
    h.lifecycle().process(&mut addon, NOW).await.unwrap();
    assert_eq!(h.engine.submitted().len(), 1);

    h.engine.set_phase(&name, WorkflowPhase::Succeeded);
    let action = h.lifecycle().process(&mut addon, NOW).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(addon.install_phase(), Some(ApplicationAssemblyPhase::Succeeded));

    h.lifecycle().process(&mut addon, NOW).await.unwrap();
    assert_eq!(h.engine.submitted().len(), 1);
    assert_eq!(h.cluster.state.lock().unwrap().finalizers_added, 1);
}

#[tokio::test]
async fn test_restart_reattaches_to_existing_workflow() {
    let h = Harness::new();
    let mut addon = addon(TEMPLATE);
    h.reset(&mut addon).await;

    // A previous process submitted the workflow but never recorded it
    let name = addon.workflow_name(LifecycleStep::Install);
    h.engine.set_phase(&name, WorkflowPhase::Running);

    h.lifecycle().process(&mut addon, NOW).await.unwrap();
    assert!(h.engine.submitted().is_empty());
    assert_eq!(addon.install_phase(), Some(ApplicationAssemblyPhase::Running));
}

#[tokio::test]
async fn test_failed_install_workflow_is_not_resubmitted() {
    let h = Harness::new();
    let mut addon = addon(TEMPLATE);
    h.reset(&mut addon).await;
    h.lifecycle().process(&mut addon, NOW).await.unwrap();

    let name = addon.workflow_name(LifecycleStep::Install);
    h.engine.set_phase(&name, WorkflowPhase::Failed);
    let action = h.lifecycle().process(&mut addon, NOW).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(addon.install_phase(), Some(ApplicationAssemblyPhase::Failed));

    h.lifecycle().process(&mut addon, NOW).await.unwrap();
    assert_eq!(h.engine.submitted().len(), 1);
}

#[tokio::test]
async fn test_submission_failure_marks_step_failed() {
    let h = Harness::new();
    let mut addon = addon(TEMPLATE);
    h.reset(&mut addon).await;
    h.engine.state.lock().unwrap().fail_submit = true;

    let result = h.lifecycle().process(&mut addon, NOW).await;
    assert!(matches!(result, Err(Error::WorkflowError(_))));
    assert_eq!(addon.install_phase(), Some(ApplicationAssemblyPhase::Failed));
    assert!(h.cluster.has_event(EventType::Warning, "Failed"));
}

#[tokio::test]
async fn test_pending_dependency_requeues_without_failing() {
    let h = Harness::new();
    h.provide("core-dns", "dns", ApplicationAssemblyPhase::Running);
    let mut addon = addon(TEMPLATE);
    addon.spec.pkg_deps.insert("core-dns".to_string(), "*".to_string());
    h.reset(&mut addon).await;

    for _ in 0..3 {
        let action = h.lifecycle().process(&mut addon, NOW).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        assert_eq!(addon.install_phase(), Some(ApplicationAssemblyPhase::Pending));
    }
    assert!(addon.status.as_ref().unwrap().reason.is_some());
    assert!(h.engine.submitted().is_empty());
    assert!(!has_finalizer(&addon));
    assert!(h.cluster.has_event(EventType::Normal, "Pending"));

    // Dependency finishes; the dependent moves on
    h.provide("core-dns", "dns", ApplicationAssemblyPhase::Succeeded);
    h.lifecycle().process(&mut addon, NOW).await.unwrap();
    assert_eq!(addon.install_phase(), Some(ApplicationAssemblyPhase::Running));
}

#[tokio::test]
async fn test_missing_dependency_sets_validation_failed() {
    let h = Harness::new();
    let mut addon = addon(TEMPLATE);
    addon
        .spec
        .pkg_deps
        .insert("core-dns".to_string(), "1.0.0".to_string());
    h.reset(&mut addon).await;

    let action = h.lifecycle().process(&mut addon, NOW).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    assert_eq!(
        addon.install_phase(),
        Some(ApplicationAssemblyPhase::ValidationFailed)
    );
    assert!(h.cluster.has_event(EventType::Warning, "Failed"));
    assert!(h.engine.submitted().is_empty());
}

#[tokio::test]
async fn test_invalid_addon_is_reported_and_not_cached() {
    let h = Harness::new();
    let mut addon = addon(TEMPLATE);
    addon.spec.selector.match_expressions.push(SelectorRequirement {
        key: "app".to_string(),
        operator: "Near".to_string(),
        values: vec![],
    });
    h.reset(&mut addon).await;

    let result = h.lifecycle().reconcile(addon, NOW).await;
    assert!(matches!(result, Err(Error::ValidationError(_))));

    let status = h.cluster.last_status().unwrap();
    assert_eq!(
        status.lifecycle.installed,
        Some(ApplicationAssemblyPhase::ValidationFailed)
    );
    assert!(h.versions.has_version("event-router").is_none());
}

#[tokio::test]
async fn test_ttl_expiry_fails_running_install() {
    let h = Harness::new();
    let mut addon = addon(TEMPLATE);
    h.reset(&mut addon).await;
    h.lifecycle().process(&mut addon, NOW).await.unwrap();
    h.engine.set_phase(
        &addon.workflow_name(LifecycleStep::Install),
        WorkflowPhase::Running,
    );

    let eleven_minutes = 11 * 60 * 1000;
    let result = h.lifecycle().process(&mut addon, NOW + eleven_minutes).await;
    assert!(matches!(result, Err(Error::TtlExpired(_))));
    assert_eq!(addon.install_phase(), Some(ApplicationAssemblyPhase::Failed));

    // Terminal now; later passes no longer report the expiry
    let action = h
        .lifecycle()
        .process(&mut addon, NOW + eleven_minutes)
        .await
        .unwrap();
    assert_eq!(action, Action::await_change());
}

#[tokio::test]
async fn test_missing_secret_blocks_install() {
    let h = Harness::new();
    let mut addon = addon(TEMPLATE);
    addon.spec.secrets = vec![SecretRef {
        name: "registry-credentials".to_string(),
    }];
    h.reset(&mut addon).await;

    let result = h.lifecycle().process(&mut addon, NOW).await;
    assert!(matches!(result, Err(Error::MissingSecret(_))));
    assert_eq!(addon.install_phase(), Some(ApplicationAssemblyPhase::Failed));
    assert!(h.engine.submitted().is_empty());

    // With the secret present a fresh spec installs
    h.cluster
        .state
        .lock()
        .unwrap()
        .secrets
        .insert("registry-credentials".to_string());
    addon.spec.pkg_version = "v0.3".to_string();
    h.reset(&mut addon).await;
    h.lifecycle().process(&mut addon, NOW).await.unwrap();
    assert_eq!(h.engine.submitted().len(), 1);
}

#[tokio::test]
async fn test_failed_prereqs_fail_install() {
    let h = Harness::new();
    let mut addon = addon(TEMPLATE);
    addon.spec.lifecycle.prereqs = WorkflowType {
        template: TEMPLATE.to_string(),
        ..Default::default()
    };
    h.reset(&mut addon).await;

    h.lifecycle().process(&mut addon, NOW).await.unwrap();
    let prereqs = addon.workflow_name(LifecycleStep::Prereqs);
    assert_eq!(h.engine.submitted(), vec![prereqs.clone()]);
    assert_eq!(addon.install_phase(), Some(ApplicationAssemblyPhase::Pending));

    h.engine.set_phase(&prereqs, WorkflowPhase::Failed);
    h.lifecycle().process(&mut addon, NOW).await.unwrap();
    assert_eq!(addon.prereqs_phase(), Some(ApplicationAssemblyPhase::Failed));
    assert_eq!(addon.install_phase(), Some(ApplicationAssemblyPhase::Failed));
    assert_eq!(h.engine.submitted().len(), 1);
}

#[tokio::test]
async fn test_observation_keeps_partial_results() {
    let mut h = Harness::new();
    h.lister = FakeLister {
        failing: vec![WorkloadKind::Job],
        ..Default::default()
    };
    let mut addon = addon("");
    h.reset(&mut addon).await;

    let result = h.lifecycle().reconcile(addon, NOW).await;
    match result {
        Err(Error::ObservationError(message)) => assert!(message.contains("Job")),
        other => panic!("expected one observation error, got {:?}", other),
    }

    let status = h.cluster.last_status().unwrap();
    assert_eq!(status.lifecycle.installed, Some(ApplicationAssemblyPhase::Succeeded));
    let kinds: Vec<_> = status.resources.iter().map(|r| r.kind.as_str()).collect();
    assert_eq!(kinds, vec!["Service", "Deployment"]);
}

#[tokio::test]
async fn test_reconcile_persists_status_and_records_version() {
    let h = Harness::new();
    let mut addon = addon("");
    h.reset(&mut addon).await;

    let action = h.lifecycle().reconcile(addon, NOW).await.unwrap();
    assert_eq!(action, Action::await_change());

    let status = h.cluster.last_status().unwrap();
    assert_eq!(status.lifecycle.installed, Some(ApplicationAssemblyPhase::Succeeded));
    assert_eq!(status.resources.len(), 2);
    assert_eq!(
        h.versions.classify("event-router", "v0.2"),
        DependencyState::Satisfied
    );
}

#[tokio::test]
async fn test_deletion_sets_deleting_before_finalizing() {
    let h = Harness::new();
    let mut addon = addon(TEMPLATE);
    addon.status = Some(AddonStatus::default());
    addon.set_install_status(ApplicationAssemblyPhase::Succeeded, None);
    mark_deleted(&mut addon);

    let action = h.lifecycle().reconcile(addon, NOW).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::ZERO));
    assert_eq!(
        h.cluster.last_status().unwrap().lifecycle.installed,
        Some(ApplicationAssemblyPhase::Deleting)
    );
    assert_eq!(h.cluster.state.lock().unwrap().finalizers_removed, 0);
}

#[tokio::test]
async fn test_deletion_without_delete_workflow_releases_immediately() {
    let h = Harness::new();
    let mut addon = addon(TEMPLATE);
    addon.status = Some(AddonStatus::default());
    addon.set_install_status(ApplicationAssemblyPhase::Deleting, None);
    h.versions.record(&addon);
    mark_deleted(&mut addon);

    let action = h.lifecycle().reconcile(addon, NOW).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(h.cluster.state.lock().unwrap().finalizers_removed, 1);
    assert!(h.versions.has_version("event-router").is_none());
    assert!(h.engine.submitted().is_empty());
}

#[tokio::test]
async fn test_deletion_waits_for_delete_workflow() {
    let h = Harness::new();
    let mut addon = addon(TEMPLATE);
    addon.spec.lifecycle.delete = Some(WorkflowType {
        template: TEMPLATE.to_string(),
        ..Default::default()
    });
    addon.status = Some(AddonStatus {
        checksum: addon.spec.checksum(),
        ..Default::default()
    });
    addon.set_install_status(ApplicationAssemblyPhase::Deleting, None);
    h.versions.record(&addon);
    mark_deleted(&mut addon);

    let action = h.lifecycle().reconcile(addon.clone(), NOW).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    let delete = addon.workflow_name(LifecycleStep::Delete);
    assert_eq!(h.engine.submitted(), vec![delete.clone()]);
    assert_eq!(h.cluster.state.lock().unwrap().finalizers_removed, 0);
    assert!(h.versions.has_version("event-router").is_none());

    h.engine.set_phase(&delete, WorkflowPhase::Running);
    h.lifecycle().reconcile(addon.clone(), NOW).await.unwrap();
    assert_eq!(h.cluster.state.lock().unwrap().finalizers_removed, 0);

    h.engine.set_phase(&delete, WorkflowPhase::Succeeded);
    let action = h.lifecycle().reconcile(addon, NOW).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(h.cluster.state.lock().unwrap().finalizers_removed, 1);
    assert_eq!(h.engine.submitted().len(), 1);
}

#[tokio::test]
async fn test_failed_delete_workflow_keeps_finalizer() {
    let h = Harness::new();
    let mut addon = addon(TEMPLATE);
    addon.spec.lifecycle.delete = Some(WorkflowType {
        template: TEMPLATE.to_string(),
        ..Default::default()
    });
    addon.status = Some(AddonStatus {
        checksum: addon.spec.checksum(),
        ..Default::default()
    });
    addon.set_install_status(ApplicationAssemblyPhase::Deleting, None);
    mark_deleted(&mut addon);
    h.engine.set_phase(
        &addon.workflow_name(LifecycleStep::Delete),
        WorkflowPhase::Failed,
    );

    let action = h.lifecycle().reconcile(addon, NOW).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(
        h.cluster.last_status().unwrap().lifecycle.installed,
        Some(ApplicationAssemblyPhase::DeleteFailed)
    );
    assert_eq!(h.cluster.state.lock().unwrap().finalizers_removed, 0);
    assert!(h.cluster.has_event(EventType::Warning, "Failed"));
}

fn with_delete_workflow(addon: &mut Addon) {
    addon.spec.lifecycle.delete = Some(WorkflowType {
        template: TEMPLATE.to_string(),
        ..Default::default()
    });
    addon.status = Some(AddonStatus {
        checksum: addon.spec.checksum(),
        ..Default::default()
    });
}

#[tokio::test]
async fn test_finalizer_removal_failure_is_retried() {
    let h = Harness::new();
    let mut addon = addon(TEMPLATE);
    with_delete_workflow(&mut addon);
    addon.set_install_status(ApplicationAssemblyPhase::Deleting, None);
    mark_deleted(&mut addon);
    h.engine.set_phase(
        &addon.workflow_name(LifecycleStep::Delete),
        WorkflowPhase::Succeeded,
    );
    h.cluster.state.lock().unwrap().failing_finalizer_removals = 1;

    let result = h.lifecycle().reconcile(addon.clone(), NOW).await;
    assert!(matches!(result, Err(Error::ConfigError(_))));
    let status = h.cluster.last_status().unwrap();
    assert_eq!(
        status.lifecycle.installed,
        Some(ApplicationAssemblyPhase::DeleteSucceeded)
    );
    assert!(status.reason.unwrap().contains("could not be deleted"));
    assert_eq!(h.cluster.state.lock().unwrap().finalizers_removed, 0);

    // The next pass starts from the persisted status and releases the addon
    addon.status = h.cluster.last_status();
    let action = h.lifecycle().reconcile(addon, NOW).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(h.cluster.state.lock().unwrap().finalizers_removed, 1);
    assert_eq!(h.engine.submitted().len(), 0);
}

#[tokio::test]
async fn test_delete_workflow_not_resubmitted_while_view_lags() {
    let h = Harness::new();
    let mut addon = addon(TEMPLATE);
    with_delete_workflow(&mut addon);
    addon.set_install_status(ApplicationAssemblyPhase::Deleting, None);
    mark_deleted(&mut addon);

    let action = h.lifecycle().reconcile(addon.clone(), NOW).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    let delete = addon.workflow_name(LifecycleStep::Delete);
    assert_eq!(h.engine.submitted(), vec![delete.clone()]);

    // The watch has not delivered the new workflow yet
    h.engine.forget(&delete);
    let action = h.lifecycle().reconcile(addon.clone(), NOW).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    assert_eq!(h.engine.submitted().len(), 1);
    assert_eq!(h.cluster.event_count("Submitted"), 1);
    assert_eq!(h.cluster.state.lock().unwrap().finalizers_removed, 0);
}

#[tokio::test]
async fn test_ttl_expiry_after_running_prereqs_stops_requeueing() {
    let h = Harness::new();
    let mut addon = addon(TEMPLATE);
    addon.spec.lifecycle.prereqs = WorkflowType {
        template: TEMPLATE.to_string(),
        ..Default::default()
    };
    h.reset(&mut addon).await;

    let action = h.lifecycle().process(&mut addon, NOW).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    let prereqs = addon.workflow_name(LifecycleStep::Prereqs);
    h.engine.set_phase(&prereqs, WorkflowPhase::Running);

    let eleven_minutes = 11 * 60 * 1000;
    let result = h.lifecycle().process(&mut addon, NOW + eleven_minutes).await;
    assert!(matches!(result, Err(Error::TtlExpired(_))));
    assert_eq!(addon.prereqs_phase(), Some(ApplicationAssemblyPhase::Running));
    assert_eq!(addon.install_phase(), Some(ApplicationAssemblyPhase::Failed));

    for _ in 0..2 {
        let action = h
            .lifecycle()
            .process(&mut addon, NOW + eleven_minutes)
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }
}

#[tokio::test]
async fn test_reconcile_of_deleted_addon_drops_cache_entry() {
    let h = Harness::new();
    let mut addon = addon("");
    addon.status = Some(AddonStatus::default());
    addon.set_install_status(ApplicationAssemblyPhase::Succeeded, None);
    h.versions.record(&addon);
    assert!(h.versions.has_version_name(NAMESPACE, "event-router").is_some());

    let action = reconcile_addon(
        &h.cluster,
        &h.engine,
        &h.lister,
        &h.versions,
        &h.config,
        NAMESPACE,
        "event-router",
        NOW,
    )
    .await
    .unwrap();
    assert_eq!(action, Action::await_change());
    assert!(h.versions.has_version_name(NAMESPACE, "event-router").is_none());
    assert!(h.cluster.last_status().is_none());
}

#[tokio::test]
async fn test_reconcile_runs_fetched_addon() {
    let h = Harness::new();
    let mut addon = addon("");
    h.reset(&mut addon).await;
    h.cluster.state.lock().unwrap().stored = Some(addon);

    let action = reconcile_addon(
        &h.cluster,
        &h.engine,
        &h.lister,
        &h.versions,
        &h.config,
        NAMESPACE,
        "event-router",
        NOW,
    )
    .await
    .unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(
        h.cluster.last_status().unwrap().lifecycle.installed,
        Some(ApplicationAssemblyPhase::Succeeded)
    );
}

#[tokio::test]
async fn test_panic_during_reconcile_is_reported_as_error() {
    let mut h = Harness::new();
    h.lister = FakeLister {
        panics: true,
        ..Default::default()
    };
    let mut addon = addon("");
    h.reset(&mut addon).await;
    h.cluster.state.lock().unwrap().stored = Some(addon);

    let result = reconcile_addon(
        &h.cluster,
        &h.engine,
        &h.lister,
        &h.versions,
        &h.config,
        NAMESPACE,
        "event-router",
        NOW,
    )
    .await;
    match result {
        Err(Error::Panicked(message)) => assert!(message.contains("lister exploded")),
        other => panic!("expected a captured panic, got {:?}", other),
    }
}

#[tokio::test]
async fn test_undefined_delete_step_fails() {
    let h = Harness::new();
    let mut addon = addon(TEMPLATE);
    addon.status = Some(AddonStatus {
        checksum: addon.spec.checksum(),
        ..Default::default()
    });
    addon.set_install_status(ApplicationAssemblyPhase::Deleting, None);

    let result = WorkflowLifecycle::new(&h.engine, &h.cluster)
        .run_step(LifecycleStep::Delete, &mut addon)
        .await;
    assert!(matches!(result, Err(Error::WorkflowError(_))));
    assert_eq!(
        addon.install_phase(),
        Some(ApplicationAssemblyPhase::DeleteFailed)
    );
    assert!(h.engine.submitted().is_empty());
}
