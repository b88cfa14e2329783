//! Child workload observation
//!
//! Rolls up the state of the workloads an addon's workflows created. Every
//! kind in [`OBSERVED_KINDS`] is listed with the same selector; a failure for
//! one kind never stops the others.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, ListParams},
    client::Client,
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::cluster::KubeCluster;
use crate::crd::{Addon, ObjectStatus, ADDON_GROUP, MANAGED_BY_LABEL, OWNER_LABEL};
use crate::error::{Error, Result};

/// Workload kinds rolled up into `status.resources`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Service,
    Job,
    CronJob,
    StatefulSet,
    Deployment,
    DaemonSet,
    ReplicaSet,
}

/// Observation order
pub const OBSERVED_KINDS: [WorkloadKind; 7] = [
    WorkloadKind::Service,
    WorkloadKind::Job,
    WorkloadKind::CronJob,
    WorkloadKind::StatefulSet,
    WorkloadKind::Deployment,
    WorkloadKind::DaemonSet,
    WorkloadKind::ReplicaSet,
];

impl WorkloadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::Service => "Service",
            WorkloadKind::Job => "Job",
            WorkloadKind::CronJob => "CronJob",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::ReplicaSet => "ReplicaSet",
        }
    }
}

/// Lists workloads of one kind as status records
#[async_trait]
pub trait ResourceLister: Send + Sync {
    async fn list(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<ObjectStatus>>;
}

/// Selector used for observation: the addon's own selector plus the
/// managed-by and owner labels every child must carry.
pub fn observation_selector(addon: &Addon) -> Result<String> {
    let mut selector = addon.spec.selector.clone();
    selector
        .match_labels
        .insert(MANAGED_BY_LABEL.to_string(), ADDON_GROUP.to_string());
    selector
        .match_labels
        .insert(OWNER_LABEL.to_string(), addon.name_any());
    selector
        .to_selector_string()
        .map_err(|e| Error::ValidationError(format!("label selector is invalid: {}", e)))
}

/// Observe every kind and return what was found.
///
/// Records of the kinds that could be listed are always returned; the error,
/// if any, aggregates every kind that failed.
pub async fn observe_resources(
    lister: &dyn ResourceLister,
    addon: &Addon,
) -> (Vec<ObjectStatus>, Option<Error>) {
    let selector = match observation_selector(addon) {
        Ok(s) => s,
        Err(e) => return (Vec::new(), Some(e)),
    };
    let namespace = addon.namespace().unwrap_or_else(|| "default".to_string());

    let mut observed = Vec::new();
    let mut failures = Vec::new();

    for kind in OBSERVED_KINDS {
        match lister.list(kind, &namespace, &selector).await {
            Ok(records) => observed.extend(records),
            Err(e) => {
                warn!(
                    "Failed to observe {} for Addon {}: {}",
                    kind.as_str(),
                    addon.key(),
                    e
                );
                failures.push(format!("{}: {}", kind.as_str(), e));
            }
        }
    }

    debug!(
        "Observed {} resources for Addon {} with selector {}",
        observed.len(),
        addon.key(),
        selector
    );

    let error = (!failures.is_empty()).then(|| {
        Error::ObservationError(format!(
            "failed to observe resources for addon {}: [{}]",
            addon.key(),
            failures.join("; ")
        ))
    });
    (observed, error)
}

#[async_trait]
impl ResourceLister for KubeCluster {
    async fn list(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<ObjectStatus>> {
        let client = self.client();
        match kind {
            WorkloadKind::Service => list_kind(client, namespace, selector, service_status).await,
            WorkloadKind::Job => list_kind(client, namespace, selector, job_status).await,
            WorkloadKind::CronJob => list_kind(client, namespace, selector, cronjob_status).await,
            WorkloadKind::StatefulSet => {
                list_kind(client, namespace, selector, statefulset_status).await
            }
            WorkloadKind::Deployment => {
                list_kind(client, namespace, selector, deployment_status).await
            }
            WorkloadKind::DaemonSet => {
                list_kind(client, namespace, selector, daemonset_status).await
            }
            WorkloadKind::ReplicaSet => {
                list_kind(client, namespace, selector, replicaset_status).await
            }
        }
    }
}

async fn list_kind<K>(
    client: &Client,
    namespace: &str,
    selector: &str,
    summarize: fn(&K) -> String,
) -> Result<Vec<ObjectStatus>>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let list = api.list(&ListParams::default().labels(selector)).await?;
    Ok(list
        .items
        .iter()
        .map(|obj| ObjectStatus {
            kind: K::kind(&()).to_string(),
            group: K::group(&()).to_string(),
            name: obj.name_any(),
            status: summarize(obj),
        })
        .collect())
}

fn ready_summary(ready: i32, desired: i32) -> String {
    if desired > 0 && ready >= desired {
        format!("Ready {}/{}", ready, desired)
    } else {
        format!("Progressing {}/{}", ready, desired)
    }
}

fn service_status(svc: &Service) -> String {
    svc.spec
        .as_ref()
        .and_then(|s| s.type_.clone())
        .unwrap_or_else(|| "ClusterIP".to_string())
}

fn job_status(job: &Job) -> String {
    let Some(status) = job.status.as_ref() else {
        return "Pending".to_string();
    };
    if status.succeeded.unwrap_or(0) > 0 {
        "Succeeded".to_string()
    } else if status.failed.unwrap_or(0) > 0 {
        "Failed".to_string()
    } else if status.active.unwrap_or(0) > 0 {
        "Running".to_string()
    } else {
        "Pending".to_string()
    }
}

fn cronjob_status(cj: &CronJob) -> String {
    if cj.spec.as_ref().and_then(|s| s.suspend).unwrap_or(false) {
        return "Suspended".to_string();
    }
    let active = cj
        .status
        .as_ref()
        .and_then(|s| s.active.as_ref())
        .map(Vec::len)
        .unwrap_or(0);
    if active > 0 {
        format!("Active {}", active)
    } else {
        "Scheduled".to_string()
    }
}

fn statefulset_status(sts: &StatefulSet) -> String {
    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = sts
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    ready_summary(ready, desired)
}

fn deployment_status(deploy: &Deployment) -> String {
    let desired = deploy.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = deploy
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    ready_summary(ready, desired)
}

fn daemonset_status(ds: &DaemonSet) -> String {
    let (ready, desired) = ds
        .status
        .as_ref()
        .map(|s| (s.number_ready, s.desired_number_scheduled))
        .unwrap_or((0, 0));
    ready_summary(ready, desired)
}

fn replicaset_status(rs: &ReplicaSet) -> String {
    let desired = rs.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = rs
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    ready_summary(ready, desired)
}
