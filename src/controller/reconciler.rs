//! Main reconciler for Addon resources
//!
//! Implements the controller pattern using kube-rs runtime. The runtime
//! guarantees a single in-flight reconcile per addon; different addons are
//! reconciled in parallel up to the configured concurrency.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Service;
use kube::{
    api::{Api, DynamicObject, ListParams},
    client::Client,
    runtime::{
        controller::{self, Action, Controller},
        reflector::ObjectRef,
        watcher,
    },
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, instrument, warn};

use super::cluster::{AddonCluster, KubeCluster};
use super::lifecycle::Lifecycle;
use super::observer::ResourceLister;
use super::version_cache::VersionCache;
use super::workflow::{workflow_api_resource, ArgoWorkflowEngine, WorkflowEngine};
use crate::config::{OperatorConfig, ERROR_BACKOFF_BASE_SECS, ERROR_BACKOFF_MAX_SECS};
use crate::crd::{Addon, OWNER_LABEL};
use crate::error::{Error, Result};

#[cfg(feature = "metrics")]
const CONTROLLER_NAME: &str = "addon";

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub config: OperatorConfig,
    pub versions: VersionCache,
}

impl ControllerState {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            client,
            config,
            versions: VersionCache::new(),
        }
    }
}

/// Everything a single reconcile needs
struct Context {
    cluster: KubeCluster,
    engine: ArgoWorkflowEngine,
    versions: VersionCache,
    config: OperatorConfig,
    /// Consecutive failures per addon key, reset on success
    failures: Mutex<HashMap<String, u32>>,
}

impl Context {
    fn next_attempt(&self, key: &str) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let attempt = failures.entry(key.to_string()).or_insert(0);
        let current = *attempt;
        *attempt = attempt.saturating_add(1);
        current
    }

    fn reset_attempts(&self, key: &str) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.remove(key);
    }
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let namespace = state.config.namespace.as_deref();
    let addons: Api<Addon> = scoped_api(&client, namespace);

    info!(
        "Starting Addon controller (namespace: {})",
        namespace.unwrap_or("all")
    );

    // Verify CRD exists
    match addons.list(&ListParams::default().limit(1)).await {
        Ok(_) => info!("Addon CRD is available"),
        Err(e) => {
            error!("Addon CRD not found. Please install the CRD first: {:?}", e);
            return Err(Error::ConfigError("Addon CRD not installed".to_string()));
        }
    }

    let (engine, workflow_watch) = ArgoWorkflowEngine::new(client.clone(), namespace);
    tokio::spawn(workflow_watch);

    let ctx = Arc::new(Context {
        cluster: KubeCluster::new(client.clone()),
        engine,
        versions: state.versions.clone(),
        config: state.config.clone(),
        failures: Mutex::new(HashMap::new()),
    });

    let resource = workflow_api_resource();
    let workflows: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &resource),
        None => Api::all_with(client.clone(), &resource),
    };
    let versions = state.versions.clone();

    Controller::new(addons, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(state.config.concurrency))
        // Child workloads carry the owner label; map them back to their addon
        .watches(
            scoped_api::<Deployment>(&client, namespace),
            watcher::Config::default(),
            map_to_addon(versions.clone()),
        )
        .watches(
            scoped_api::<Service>(&client, namespace),
            watcher::Config::default(),
            map_to_addon(versions.clone()),
        )
        .watches(
            scoped_api::<DaemonSet>(&client, namespace),
            watcher::Config::default(),
            map_to_addon(versions.clone()),
        )
        .watches(
            scoped_api::<ReplicaSet>(&client, namespace),
            watcher::Config::default(),
            map_to_addon(versions.clone()),
        )
        .watches(
            scoped_api::<StatefulSet>(&client, namespace),
            watcher::Config::default(),
            map_to_addon(versions.clone()),
        )
        .watches(
            scoped_api::<Job>(&client, namespace),
            watcher::Config::default(),
            map_to_addon(versions.clone()),
        )
        .watches(
            scoped_api::<CronJob>(&client, namespace),
            watcher::Config::default(),
            map_to_addon(versions.clone()),
        )
        .watches_with(
            workflows,
            resource,
            watcher::Config::default(),
            move |wf: DynamicObject| {
                addon_for_labels(wf.labels(), &wf.namespace().unwrap_or_default(), &versions)
            },
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled: {}/{}", obj.namespace.unwrap_or_default(), obj.name),
                Err(e) => warn!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Mapper from a labeled child object to the addon that owns it
fn map_to_addon<K>(
    versions: VersionCache,
) -> impl Fn(K) -> Option<ObjectRef<Addon>> + Send + Sync + 'static
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    move |obj: K| addon_for_labels(obj.labels(), &obj.namespace().unwrap_or_default(), &versions)
}

/// Resolve the owning addon from the owner label through the version cache.
///
/// Children live in their addon's namespace. Objects of addons the cache has
/// not seen yet are ignored; the addon's own watch brings it in.
pub fn addon_for_labels(
    labels: &BTreeMap<String, String>,
    namespace: &str,
    versions: &VersionCache,
) -> Option<ObjectRef<Addon>> {
    let name = labels.get(OWNER_LABEL).map(|n| n.trim())?;
    if name.is_empty() {
        return None;
    }
    versions
        .has_version_name(namespace, name)
        .map(|v| ObjectRef::new(&v.name).within(&v.namespace))
}

/// Reconcile function called by the controller
#[instrument(skip(addon, ctx), fields(name = %addon.name_any(), namespace = %addon.namespace().unwrap_or_default()))]
async fn reconcile(addon: Arc<Addon>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let namespace = addon.namespace().unwrap_or_else(|| "default".to_string());
    let name = addon.name_any();
    let key = format!("{}/{}", namespace, name);

    debug!("Starting addon-manager reconcile for {}", key);

    let result = reconcile_addon(
        &ctx.cluster,
        &ctx.engine,
        &ctx.cluster,
        &ctx.versions,
        &ctx.config,
        &namespace,
        &name,
        chrono::Utc::now().timestamp_millis(),
    )
    .await;

    #[cfg(feature = "metrics")]
    {
        super::metrics::observe_reconcile_duration_seconds(
            CONTROLLER_NAME,
            started.elapsed().as_secs_f64(),
        );
        super::metrics::set_version_cache_entries(ctx.versions.len());
    }
    debug!("Reconcile of {} took {:?}", key, started.elapsed());

    if result.is_ok() {
        ctx.reset_attempts(&key);
    }
    result
}

/// One reconcile of the addon `namespace/name` against the given collaborators.
///
/// The watch copy may be stale, so the latest object is fetched first. A panic
/// while processing is returned as [`Error::Panicked`].
#[allow(clippy::too_many_arguments)]
pub(crate) async fn reconcile_addon(
    cluster: &dyn AddonCluster,
    engine: &dyn WorkflowEngine,
    lister: &dyn ResourceLister,
    versions: &VersionCache,
    config: &OperatorConfig,
    namespace: &str,
    name: &str,
    now_millis: i64,
) -> Result<Action> {
    let Some(latest) = cluster.get_addon(namespace, name).await? else {
        info!(
            "Addon {}/{} not found, removing it from the version cache",
            namespace, name
        );
        versions.remove_addon(namespace, name);
        return Ok(Action::await_change());
    };

    let lifecycle = Lifecycle::new(cluster, engine, lister, versions, config);
    match AssertUnwindSafe(lifecycle.reconcile(latest, now_millis))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(
                "Panic occurred while reconciling Addon {}/{}: {}",
                namespace, name, message
            );
            Err(Error::Panicked(message))
        }
    }
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(addon: Arc<Addon>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = addon.key();
    error!("Reconciliation error for {}: {:?}", key, error);

    #[cfg(feature = "metrics")]
    super::metrics::inc_reconcile_error(CONTROLLER_NAME, error.kind());

    let action = retry_action(error, || ctx.next_attempt(&key));
    debug!("Next action for {}: {:?}", key, action);
    action
}

/// Backoff requeue for retriable errors; fatal ones wait for the next change.
///
/// `next_attempt` is only consulted for retriable errors.
fn retry_action(error: &Error, next_attempt: impl FnOnce() -> u32) -> Action {
    if !error.is_retriable() {
        return Action::await_change();
    }
    Action::requeue(calculate_backoff(next_attempt()))
}

/// Exponential backoff: base * 2^attempt, capped at the maximum
pub fn calculate_backoff(attempt: u32) -> Duration {
    let delay_secs =
        ERROR_BACKOFF_BASE_SECS.saturating_mul(2_u64.saturating_pow(attempt.min(10)));
    Duration::from_secs(delay_secs.min(ERROR_BACKOFF_MAX_SECS))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
