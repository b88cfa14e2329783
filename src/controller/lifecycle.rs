//! Addon lifecycle state machine
//!
//! One pass of [`Lifecycle::reconcile`] looks at the current addon and moves
//! it at most one step forward:
//!
//! 1. a spec change resets the status and requeues
//! 2. an addon whose install succeeded is left alone
//! 3. validation, including dependencies, gates everything else
//! 4. the finalizer is added and the install TTL is enforced
//! 5. prereqs then install workflows are driven to a terminal phase
//! 6. child workloads are observed and rolled up into the status
//!
//! Waiting is expressed as a requeue, never as an error, so only real
//! failures go through the error backoff.

use std::time::Duration;

use kube::{runtime::controller::Action, ResourceExt};
use tracing::{debug, error, info, warn};

use super::checksum::{check_checksum, ChecksumOutcome};
use super::cluster::{AddonCluster, EventType};
use super::finalizers::has_finalizer;
use super::observer::{observe_resources, ResourceLister};
use super::validation::{validate, ValidationError};
use super::version_cache::VersionCache;
use super::workflow::{WorkflowEngine, WorkflowLifecycle};
use crate::config::{
    OperatorConfig, DEPENDENCY_MISSING_REQUEUE, DEPENDENCY_PENDING_REQUEUE,
    WORKFLOW_RUNNING_REQUEUE,
};
use crate::crd::{Addon, ApplicationAssemblyPhase, LifecycleStep};
use crate::error::{Error, Result};

/// Collaborators needed to move one addon through its lifecycle
pub struct Lifecycle<'a> {
    cluster: &'a dyn AddonCluster,
    engine: &'a dyn WorkflowEngine,
    lister: &'a dyn ResourceLister,
    versions: &'a VersionCache,
    config: &'a OperatorConfig,
}

impl<'a> Lifecycle<'a> {
    pub fn new(
        cluster: &'a dyn AddonCluster,
        engine: &'a dyn WorkflowEngine,
        lister: &'a dyn ResourceLister,
        versions: &'a VersionCache,
        config: &'a OperatorConfig,
    ) -> Self {
        Self {
            cluster,
            engine,
            lister,
            versions,
            config,
        }
    }

    fn workflows(&self) -> WorkflowLifecycle<'a> {
        WorkflowLifecycle::new(self.engine, self.cluster)
    }

    /// Run one pass for a freshly fetched addon and persist the result.
    ///
    /// `now_millis` is the wall clock in Unix milliseconds.
    pub async fn reconcile(&self, mut addon: Addon, now_millis: i64) -> Result<Action> {
        if addon.is_being_deleted() {
            let deleting = addon
                .install_phase()
                .map(ApplicationAssemblyPhase::deleting)
                .unwrap_or(false);
            if !deleting {
                info!("Addon {} is being deleted, setting Deleting status", addon.key());
                addon.set_install_status(ApplicationAssemblyPhase::Deleting, None);
                self.cluster.update_status(&addon).await?;
                return Ok(Action::requeue(Duration::ZERO));
            }

            return match self.finalize(&mut addon).await {
                Ok(action) => Ok(action),
                Err(e) => {
                    let reason = format!(
                        "Addon {} could not be finalized. {}",
                        addon.key(),
                        e
                    );
                    error!("{}", reason);
                    self.cluster
                        .publish_event(&addon, EventType::Warning, "Failed", &reason)
                        .await;
                    Err(e)
                }
            };
        }

        let result = self.process(&mut addon, now_millis).await;

        self.cluster.update_status(&addon).await?;
        if addon.install_phase() != Some(ApplicationAssemblyPhase::ValidationFailed) {
            self.versions.record(&addon);
        }

        result
    }

    /// Lifecycle rules for an addon that is not being deleted
    pub async fn process(&self, addon: &mut Addon, now_millis: i64) -> Result<Action> {
        let workflows = self.workflows();

        if check_checksum(addon, &workflows, now_millis).await? == ChecksumOutcome::Reset {
            return Ok(Action::requeue(Duration::ZERO));
        }

        if addon.install_succeeded() {
            debug!("Addon {} is installed, nothing to do", addon.key());
            return Ok(Action::await_change());
        }

        if let Err(e) = validate(addon, self.versions) {
            return self.validation_failed(addon, e).await;
        }

        let newly_valid = !has_finalizer(addon);
        if let Err(e) = self.cluster.add_finalizer(addon).await {
            let reason = format!("Addon {} could not add finalizer. {}", addon.key(), e);
            self.cluster
                .publish_event(addon, EventType::Warning, "Failed", &reason)
                .await;
            return Err(e);
        }
        if newly_valid {
            self.cluster
                .publish_event(
                    addon,
                    EventType::Normal,
                    "Completed",
                    &format!("Addon {} is valid.", addon.key()),
                )
                .await;
        }

        let install_completed = addon
            .install_phase()
            .map(|p| LifecycleStep::Install.is_terminal(p))
            .unwrap_or(false);
        if !install_completed {
            let starttime = addon.status.as_ref().map(|s| s.starttime).unwrap_or(0);
            if now_millis - starttime > self.config.install_ttl_millis() {
                let reason = format!(
                    "Addon {} ttl expired, starttime exceeded {}s",
                    addon.key(),
                    self.config.install_ttl.as_secs()
                );
                warn!("{}", reason);
                self.cluster
                    .publish_event(addon, EventType::Warning, "Failed", &reason)
                    .await;
                addon.set_install_status(ApplicationAssemblyPhase::Failed, Some(reason.clone()));
                return Err(Error::TtlExpired(reason));
            }

            self.execute_prereq_and_install(addon).await?;
        }

        let (observed, observe_error) = observe_resources(self.lister, addon).await;
        if !observed.is_empty() || observe_error.is_none() {
            addon.status_mut().resources = observed;
        }
        if let Some(e) = observe_error {
            let reason = format!(
                "Addon {} failed to find deployed resources. {}",
                addon.key(),
                e
            );
            self.cluster
                .publish_event(addon, EventType::Warning, "Failed", &reason)
                .await;
            return Err(e);
        }

        // A prereqs phase left behind by a terminal install is stale
        let install_phase = addon.install_phase();
        let install_terminal = install_phase
            .map(|p| LifecycleStep::Install.is_terminal(p))
            .unwrap_or(false);
        let running = install_phase.map(ApplicationAssemblyPhase::running).unwrap_or(false)
            || (!install_terminal
                && addon
                    .prereqs_phase()
                    .map(ApplicationAssemblyPhase::running)
                    .unwrap_or(false));
        if running {
            return Ok(Action::requeue(WORKFLOW_RUNNING_REQUEUE));
        }
        Ok(Action::await_change())
    }

    async fn validation_failed(&self, addon: &mut Addon, err: ValidationError) -> Result<Action> {
        match err {
            ValidationError::DependencyPending { .. } => {
                let reason = format!(
                    "Addon {} is waiting on dependencies to be out of Pending state.",
                    addon.key()
                );
                info!("{} ({})", reason, err);
                self.cluster
                    .publish_event(addon, EventType::Normal, "Pending", &reason)
                    .await;
                #[cfg(feature = "metrics")]
                super::metrics::inc_dependency_wait("pending");
                addon.set_install_status(ApplicationAssemblyPhase::Pending, Some(reason));
                Ok(Action::requeue(DEPENDENCY_PENDING_REQUEUE))
            }
            ValidationError::DependencyMissing { .. } => {
                let reason = format!(
                    "Addon {} is waiting on dependencies to be installed. {}",
                    addon.key(),
                    err
                );
                warn!("{}", reason);
                self.cluster
                    .publish_event(addon, EventType::Warning, "Failed", &reason)
                    .await;
                #[cfg(feature = "metrics")]
                super::metrics::inc_dependency_wait("missing");
                addon.set_install_status(ApplicationAssemblyPhase::ValidationFailed, Some(reason));
                Ok(Action::requeue(DEPENDENCY_MISSING_REQUEUE))
            }
            ValidationError::Invalid(_) => {
                let reason = format!("Addon {} is not valid. {}", addon.key(), err);
                error!("{}", reason);
                self.cluster
                    .publish_event(addon, EventType::Warning, "Failed", &reason)
                    .await;
                addon.set_install_status(
                    ApplicationAssemblyPhase::ValidationFailed,
                    Some(reason.clone()),
                );
                Err(Error::ValidationError(reason))
            }
        }
    }

    /// Drive prereqs, then install once prereqs succeeded.
    ///
    /// Required secrets are checked before the install workflow is submitted.
    pub async fn execute_prereq_and_install(&self, addon: &mut Addon) -> Result<()> {
        let workflows = self.workflows();

        if let Err(e) = workflows.run_step(LifecycleStep::Prereqs, addon).await {
            let reason = format!("Addon {} prereqs failed. {}", addon.key(), e);
            error!("{}", reason);
            self.cluster
                .publish_event(addon, EventType::Warning, "Failed", &reason)
                .await;
            return Err(e);
        }

        match addon.prereqs_phase() {
            Some(ApplicationAssemblyPhase::Succeeded) => {
                if let Err(e) = self.validate_secrets(addon).await {
                    let reason = format!(
                        "Addon {} could not validate secrets. {}",
                        addon.key(),
                        e
                    );
                    error!("{}", reason);
                    self.cluster
                        .publish_event(addon, EventType::Warning, "Failed", &reason)
                        .await;
                    addon.set_install_status(ApplicationAssemblyPhase::Failed, Some(reason));
                    return Err(e);
                }

                if let Err(e) = workflows.run_step(LifecycleStep::Install, addon).await {
                    let reason = format!(
                        "Addon {} could not be installed due to error. {}",
                        addon.key(),
                        e
                    );
                    error!("{}", reason);
                    self.cluster
                        .publish_event(addon, EventType::Warning, "Failed", &reason)
                        .await;
                    return Err(e);
                }
            }
            Some(ApplicationAssemblyPhase::Failed) => {
                addon.set_install_status(
                    ApplicationAssemblyPhase::Failed,
                    Some(format!("Addon {} prereqs failed.", addon.key())),
                );
            }
            _ => {}
        }
        Ok(())
    }

    async fn validate_secrets(&self, addon: &Addon) -> Result<()> {
        if addon.spec.secrets.is_empty() {
            return Ok(());
        }

        let addon_namespace = addon.namespace().unwrap_or_else(|| "default".to_string());
        let namespace = addon.spec.target_namespace(&addon_namespace);
        let found = self.cluster.secret_names(namespace).await?;

        match addon.spec.secrets.iter().find(|s| !found.contains(&s.name)) {
            Some(missing) => Err(Error::MissingSecret(format!(
                "addon {} needs secret \"{}\" that was not found in namespace {}",
                addon.name_any(),
                missing.name,
                namespace
            ))),
            None => Ok(()),
        }
    }

    /// Cleanup for an addon whose deletion has been requested.
    ///
    /// The package leaves the version cache first so dependents stop relying on
    /// it. The finalizer goes once the delete workflow succeeded, or at once
    /// when none is configured.
    pub async fn finalize(&self, addon: &mut Addon) -> Result<Action> {
        self.versions
            .remove_version(&addon.spec.pkg_name, &addon.spec.pkg_version);

        if addon.spec.lifecycle.has_delete_workflow() {
            let step_result = self
                .workflows()
                .run_step(LifecycleStep::Delete, addon)
                .await;
            if let Err(e) = step_result {
                self.cluster.update_status(addon).await?;
                return Err(e);
            }

            match addon.install_phase() {
                Some(ApplicationAssemblyPhase::DeleteSucceeded) => {}
                Some(ApplicationAssemblyPhase::DeleteFailed) => {
                    let reason = format!(
                        "Addon {} delete workflow failed, finalizer kept.",
                        addon.key()
                    );
                    warn!("{}", reason);
                    self.cluster
                        .publish_event(addon, EventType::Warning, "Failed", &reason)
                        .await;
                    self.cluster.update_status(addon).await?;
                    return Ok(Action::await_change());
                }
                _ => {
                    debug!("Delete workflow for Addon {} still running", addon.key());
                    self.cluster.update_status(addon).await?;
                    return Ok(Action::requeue(WORKFLOW_RUNNING_REQUEUE));
                }
            }
        }

        // The phase stays as is so the next pass retries the removal
        if let Err(e) = self.cluster.remove_finalizer(addon).await {
            let reason = format!("Addon {} could not be deleted, {}", addon.key(), e);
            warn!("{}", reason);
            addon.status_mut().reason = Some(reason);
            self.cluster.update_status(addon).await?;
            return Err(e);
        }

        info!("Addon {} finalized", addon.key());
        Ok(Action::await_change())
    }
}
