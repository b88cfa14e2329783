//! Lifecycle workflow management
//!
//! Each lifecycle step of an addon is executed as an Argo `Workflow`. Argo
//! types are not in `k8s-openapi`, so workflows are handled as
//! `DynamicObject`s. Their status is read from a reflector store that a
//! background watcher keeps in sync, rather than fetched on every reconcile.
//!
//! # Idempotency
//! Workflow names derive from the addon name, the step and the spec checksum.
//! A step is submitted at most once per checksum: the store is consulted
//! before submitting, and an `AlreadyExists` answer from the API server is
//! treated as attaching to the existing execution.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, PostParams},
    client::Client,
    runtime::{
        reflector::{self, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    Resource, ResourceExt,
};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::cluster::{AddonCluster, EventType};
use crate::crd::{Addon, LifecycleStep, OWNER_LABEL};
use crate::error::{Error, Result};

const WORKFLOW_GROUP: &str = "argoproj.io";
const WORKFLOW_VERSION: &str = "v1alpha1";
const WORKFLOW_KIND: &str = "Workflow";

/// `ApiResource` for Argo workflows
pub fn workflow_api_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind {
        group: WORKFLOW_GROUP.to_string(),
        version: WORKFLOW_VERSION.to_string(),
        kind: WORKFLOW_KIND.to_string(),
    })
}

/// Phase of an Argo workflow execution
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkflowPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl WorkflowPhase {
    /// Map Argo's `status.phase`; an empty or unknown phase means not started yet
    pub fn from_argo(phase: Option<&str>) -> Self {
        match phase {
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") | Some("Error") => Self::Failed,
            _ => Self::Pending,
        }
    }

    pub fn of(workflow: &DynamicObject) -> Self {
        Self::from_argo(
            workflow
                .data
                .get("status")
                .and_then(|s| s.get("phase"))
                .and_then(Value::as_str),
        )
    }
}

/// Contract required of the workflow engine
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Create the workflow. Succeeds if one with the same name already exists.
    async fn submit(&self, workflow: &DynamicObject) -> Result<()>;

    /// Phase of a workflow from the synchronized view, `None` if unknown
    fn phase(&self, namespace: &str, name: &str) -> Option<WorkflowPhase>;

    /// Phase read directly from the API server, `None` if the workflow does not exist
    async fn fetch_phase(&self, namespace: &str, name: &str) -> Result<Option<WorkflowPhase>>;

    /// Names of all workflows labeled as owned by the addon
    async fn list_owned(&self, namespace: &str, addon_name: &str) -> Result<Vec<String>>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`WorkflowEngine`] talking to Argo through the Kubernetes API
#[derive(Clone)]
pub struct ArgoWorkflowEngine {
    client: Client,
    resource: ApiResource,
    store: Store<DynamicObject>,
}

impl ArgoWorkflowEngine {
    /// Create the engine and the watcher that keeps its store in sync.
    ///
    /// The returned future must be driven (usually spawned) for the store to fill.
    pub fn new(
        client: Client,
        namespace: Option<&str>,
    ) -> (Self, impl std::future::Future<Output = ()> + Send + 'static) {
        let resource = workflow_api_resource();
        let writer = reflector::store::Writer::new(resource.clone());
        let store = writer.as_reader();

        let api = workflows_api(&client, namespace, &resource);
        let watch = reflector::reflector(writer, watcher(api, watcher::Config::default()))
            .default_backoff()
            .touched_objects()
            .for_each(|res| async move {
                match res {
                    Ok(wf) => debug!(
                        "Workflow {}/{} observed in phase {:?}",
                        wf.namespace().unwrap_or_default(),
                        wf.name_any(),
                        WorkflowPhase::of(&wf)
                    ),
                    Err(e) => warn!("Workflow watch error: {:?}", e),
                }
            });

        (
            Self {
                client,
                resource,
                store,
            },
            watch,
        )
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }
}

fn workflows_api(
    client: &Client,
    namespace: Option<&str>,
    resource: &ApiResource,
) -> Api<DynamicObject> {
    match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, resource),
        None => Api::all_with(client.clone(), resource),
    }
}

#[async_trait]
impl WorkflowEngine for ArgoWorkflowEngine {
    async fn submit(&self, workflow: &DynamicObject) -> Result<()> {
        let namespace = workflow.namespace().unwrap_or_else(|| "default".to_string());
        match self
            .api(&namespace)
            .create(&PostParams::default(), workflow)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(
                    "Workflow {}/{} already exists, attaching",
                    namespace,
                    workflow.name_any()
                );
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(Error::WorkflowError(format!(
                "Argo Workflow CRD not installed ({})",
                ae.message
            ))),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    fn phase(&self, namespace: &str, name: &str) -> Option<WorkflowPhase> {
        let key = ObjectRef::new_with(name, self.resource.clone()).within(namespace);
        self.store.get(&key).map(|wf| WorkflowPhase::of(&wf))
    }

    async fn fetch_phase(&self, namespace: &str, name: &str) -> Result<Option<WorkflowPhase>> {
        let workflow = self.api(namespace).get_opt(name).await?;
        Ok(workflow.map(|wf| WorkflowPhase::of(&wf)))
    }

    async fn list_owned(&self, namespace: &str, addon_name: &str) -> Result<Vec<String>> {
        let params = ListParams::default().labels(&format!("{}={}", OWNER_LABEL, addon_name));
        let list = self.api(namespace).list_metadata(&params).await?;
        Ok(list.items.into_iter().map(|wf| wf.name_any()).collect())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}

/// Build the workflow object for a step from the addon's template.
///
/// The template's own name is replaced with the deterministic name; labels,
/// owner reference, service account and parameters are layered on top.
pub fn build_workflow(addon: &Addon, step: LifecycleStep, template: &str) -> Result<DynamicObject> {
    let mut data: Value = serde_yaml::from_str(template)?;
    if !data.is_object() {
        return Err(Error::WorkflowError(format!(
            "{} workflow template is not a mapping",
            step
        )));
    }

    let namespace = addon.namespace().unwrap_or_else(|| "default".to_string());
    let name = addon.workflow_name(step);
    let resource = workflow_api_resource();

    let mut labels: BTreeMap<String, String> = data
        .pointer("/metadata/labels")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    labels.extend(addon.workflow_labels(step));

    let mut workflow = DynamicObject::new(&name, &resource).within(&namespace);
    workflow.metadata.labels = Some(labels);
    workflow.metadata.owner_references = addon.controller_owner_ref(&()).map(|r| vec![r]);

    if let Some(obj) = data.as_object_mut() {
        obj.remove("apiVersion");
        obj.remove("kind");
        obj.remove("metadata");
        obj.remove("status");
        let spec = obj.entry("spec").or_insert_with(|| json!({}));
        apply_spec_overrides(spec, addon, step)?;
    }
    workflow.data = data;

    Ok(workflow)
}

fn apply_spec_overrides(spec: &mut Value, addon: &Addon, step: LifecycleStep) -> Result<()> {
    let spec = spec.as_object_mut().ok_or_else(|| {
        Error::WorkflowError(format!("{} workflow spec is not a mapping", step))
    })?;

    if let Some(role) = addon
        .spec
        .lifecycle
        .workflow_for(step)
        .and_then(|wt| wt.role.as_ref())
        .filter(|r| !r.is_empty())
    {
        spec.insert("serviceAccountName".to_string(), json!(role));
    }

    let data = &addon.spec.params.data;
    if data.is_empty() {
        return Ok(());
    }

    let arguments = spec
        .entry("arguments")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| Error::WorkflowError("spec.arguments is not a mapping".to_string()))?;
    let parameters = arguments
        .entry("parameters")
        .or_insert_with(|| json!([]))
        .as_array_mut()
        .ok_or_else(|| {
            Error::WorkflowError("spec.arguments.parameters is not a list".to_string())
        })?;

    for (key, value) in data {
        let existing = parameters
            .iter_mut()
            .find(|p| p.get("name").and_then(Value::as_str) == Some(key.as_str()));
        match existing {
            Some(param) => param["value"] = json!(value),
            None => parameters.push(json!({ "name": key, "value": value })),
        }
    }
    Ok(())
}

/// Submits and tracks the lifecycle workflows of one addon
pub struct WorkflowLifecycle<'a> {
    engine: &'a dyn WorkflowEngine,
    cluster: &'a dyn AddonCluster,
}

impl<'a> WorkflowLifecycle<'a> {
    pub fn new(engine: &'a dyn WorkflowEngine, cluster: &'a dyn AddonCluster) -> Self {
        Self { engine, cluster }
    }

    /// Drive one lifecycle step and record its phase on the addon.
    ///
    /// - terminal step: nothing to do
    /// - undefined step: `Failed` and an error
    /// - empty template: `Succeeded` without a workflow
    /// - otherwise: submit once, then mirror the workflow's phase
    pub async fn run_step(&self, step: LifecycleStep, addon: &mut Addon) -> Result<()> {
        let current = addon.step_status(step);
        if current.map(|p| step.is_terminal(p)).unwrap_or(false) {
            debug!(
                "Lifecycle {} completed for Addon {}, skipping workflow execution",
                step,
                addon.key()
            );
            return Ok(());
        }

        let Some(wt) = addon.spec.lifecycle.workflow_for(step).cloned() else {
            addon.set_step_status(step, step.failed_phase());
            return Err(Error::WorkflowError(format!(
                "lifecycle step {} is not defined for addon {}",
                step,
                addon.key()
            )));
        };

        if wt.template.trim().is_empty() {
            debug!(
                "Workflow template for {} is empty, marking Addon {} step as succeeded",
                step,
                addon.key()
            );
            addon.set_step_status(step, step.succeeded_phase());
            return Ok(());
        }

        if addon.stored_checksum().is_empty() {
            addon.set_step_status(step, step.failed_phase());
            return Err(Error::WorkflowError(format!(
                "could not generate {} workflow name for addon {}: no checksum",
                step,
                addon.key()
            )));
        }

        let namespace = addon.namespace().unwrap_or_else(|| "default".to_string());
        let name = addon.workflow_name(step);

        let in_flight = current == Some(step.running_phase()) && step != LifecycleStep::Delete;
        let mut phase = self.engine.phase(&namespace, &name);
        if phase.is_none() && current == Some(step.running_phase()) {
            // The view may lag behind a submission from an earlier pass
            phase = self.engine.fetch_phase(&namespace, &name).await?;
        }

        if phase.is_none() && !in_flight {
            let workflow = match build_workflow(addon, step, &wt.template) {
                Ok(wf) => wf,
                Err(e) => {
                    addon.set_step_status(step, step.failed_phase());
                    return Err(e);
                }
            };

            if let Err(e) = self.engine.submit(&workflow).await {
                error!("Failed to submit {} workflow {}/{}: {:?}", step, namespace, name, e);
                addon.set_step_status(step, step.failed_phase());
                return Err(e);
            }

            info!("Submitted {} workflow {}/{}", step, namespace, name);
            #[cfg(feature = "metrics")]
            super::metrics::inc_workflow_submitted(step.as_str());
            self.cluster
                .publish_event(
                    addon,
                    EventType::Normal,
                    "Submitted",
                    &format!("Submitted {} workflow {}/{}.", step, namespace, name),
                )
                .await;
            phase = Some(WorkflowPhase::Pending);
        }

        let next = match phase {
            Some(WorkflowPhase::Succeeded) => step.succeeded_phase(),
            Some(WorkflowPhase::Failed) => step.failed_phase(),
            Some(WorkflowPhase::Pending) | Some(WorkflowPhase::Running) | None => {
                step.running_phase()
            }
        };
        if Some(next) != current {
            debug!("Addon {} {} step -> {}", addon.key(), step, next);
        }
        addon.set_step_status(step, next);
        Ok(())
    }

    /// Delete every workflow still labeled as owned by the addon.
    ///
    /// Individual delete failures are logged; only a failed listing is an error.
    pub async fn delete_owned(&self, addon: &Addon) -> Result<()> {
        let namespace = addon.namespace().unwrap_or_else(|| "default".to_string());
        let names = self.engine.list_owned(&namespace, &addon.name_any()).await?;
        info!(
            "Found {} workflows owned by Addon {} to delete",
            names.len(),
            addon.key()
        );

        for name in names {
            match self.engine.delete(&namespace, &name).await {
                Ok(()) => info!("Deleted old workflow {}/{}", namespace, name),
                Err(e) => warn!("Unable to delete old workflow {}/{}: {:?}", namespace, name, e),
            }
        }
        Ok(())
    }
}
