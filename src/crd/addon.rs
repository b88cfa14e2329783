//! Addon Custom Resource Definition
//!
//! An Addon is a named, versioned cluster capability whose prereqs, install
//! and delete actions are each expressed as an Argo workflow.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::types::{
    AddonParams, AddonSelector, AddonStatusLifecycle, ApplicationAssemblyPhase,
    LifecycleStep, LifecycleWorkflowSpec, ObjectStatus, SecretRef,
};

/// API group of the Addon resource, also used as the managed-by label value
pub const ADDON_GROUP: &str = "addonmgr.keikoproj.io";

/// Label that ties child workloads and workflows to the addon that owns them
pub const OWNER_LABEL: &str = "app.kubernetes.io/name";

/// Label identifying the operator as manager of an object
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Label recording which lifecycle step a workflow belongs to
pub const LIFECYCLE_LABEL: &str = "addonmgr.keikoproj.io/lifecycle";

/// Longest name Kubernetes accepts for a label value / DNS label
const MAX_NAME_LEN: usize = 63;

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "addonmgr.keikoproj.io",
    version = "v1alpha1",
    kind = "Addon",
    namespaced,
    status = "AddonStatus",
    shortname = "addon",
    printcolumn = r#"{"name":"Package","type":"string","jsonPath":".spec.pkgName"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.pkgVersion"}"#,
    printcolumn = r#"{"name":"Prereqs","type":"string","jsonPath":".status.lifecycle.prereqs"}"#,
    printcolumn = r#"{"name":"Install","type":"string","jsonPath":".status.lifecycle.installed"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AddonSpec {
    pub pkg_name: String,
    pub pkg_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkg_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkg_description: Option<String>,

    /// Packages this addon depends on, name -> version (`*` for any)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pkg_deps: BTreeMap<String, String>,

    #[serde(default)]
    pub params: AddonParams,

    #[serde(default)]
    pub selector: AddonSelector,

    #[serde(default)]
    pub lifecycle: LifecycleWorkflowSpec,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretRef>,
}

/// Status of an Addon
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddonStatus {
    #[serde(default)]
    pub lifecycle: AddonStatusLifecycle,

    #[serde(default)]
    pub resources: Vec<ObjectStatus>,

    #[serde(default)]
    pub checksum: String,

    pub reason: Option<String>,

    /// Unix milliseconds at which the current spec was first seen
    #[serde(default)]
    pub starttime: i64,
}

impl AddonSpec {
    /// Stable hash of the spec body.
    ///
    /// All maps in the spec are ordered, so the canonical JSON of equal specs is
    /// byte-identical.
    pub fn checksum(&self) -> String {
        let body = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&body);
        hex::encode(digest)[..8].to_string()
    }

    /// Namespace in which required secrets must exist
    pub fn target_namespace<'a>(&'a self, addon_namespace: &'a str) -> &'a str {
        self.params
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(addon_namespace)
    }
}

impl Addon {
    /// `namespace/name` key used in logs and the backoff table
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn status_mut(&mut self) -> &mut AddonStatus {
        self.status.get_or_insert_with(AddonStatus::default)
    }

    pub fn install_phase(&self) -> Option<ApplicationAssemblyPhase> {
        self.status.as_ref().and_then(|s| s.lifecycle.installed)
    }

    pub fn prereqs_phase(&self) -> Option<ApplicationAssemblyPhase> {
        self.status.as_ref().and_then(|s| s.lifecycle.prereqs)
    }

    pub fn stored_checksum(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.checksum.as_str())
            .unwrap_or_default()
    }

    /// Overall completion: install reached `Succeeded`
    pub fn install_succeeded(&self) -> bool {
        self.install_phase()
            .map(ApplicationAssemblyPhase::succeeded)
            .unwrap_or(false)
    }

    pub fn set_install_status(&mut self, phase: ApplicationAssemblyPhase, reason: Option<String>) {
        let status = self.status_mut();
        status.lifecycle.installed = Some(phase);
        if reason.is_some() {
            status.reason = reason;
        }
    }

    pub fn set_prereq_and_install_statuses(&mut self, phase: ApplicationAssemblyPhase) {
        let status = self.status_mut();
        status.lifecycle.prereqs = Some(phase);
        status.lifecycle.installed = Some(phase);
    }

    /// Record the phase of a lifecycle step. The delete step reports through
    /// the install field, as an addon being deleted no longer has an install.
    pub fn set_step_status(&mut self, step: LifecycleStep, phase: ApplicationAssemblyPhase) {
        let status = self.status_mut();
        match step {
            LifecycleStep::Prereqs => status.lifecycle.prereqs = Some(phase),
            LifecycleStep::Install | LifecycleStep::Delete => {
                status.lifecycle.installed = Some(phase)
            }
        }
    }

    pub fn step_status(&self, step: LifecycleStep) -> Option<ApplicationAssemblyPhase> {
        match step {
            LifecycleStep::Prereqs => self.prereqs_phase(),
            LifecycleStep::Install | LifecycleStep::Delete => self.install_phase(),
        }
    }

    /// Reset everything but the checksum and start time
    pub fn clear_status(&mut self) {
        let status = self.status_mut();
        status.lifecycle = AddonStatusLifecycle::default();
        status.resources.clear();
        status.reason = None;
    }

    /// Deterministic workflow name for a step: `<addon>-<step>-<checksum>-wf`.
    ///
    /// Stable for a given checksum, so a restarted operator reattaches to an
    /// execution it already submitted.
    pub fn workflow_name(&self, step: LifecycleStep) -> String {
        let suffix = format!("-{}-{}-wf", step.as_str(), self.stored_checksum());
        let name = self.name_any();
        let room = MAX_NAME_LEN.saturating_sub(suffix.len());
        let prefix: String = name.chars().take(room).collect();
        format!("{}{}", prefix.trim_end_matches('-'), suffix)
    }

    /// Labels every workflow submitted for this addon carries
    pub fn workflow_labels(&self, step: LifecycleStep) -> BTreeMap<String, String> {
        [
            (OWNER_LABEL.to_string(), self.name_any()),
            (MANAGED_BY_LABEL.to_string(), ADDON_GROUP.to_string()),
            (LIFECYCLE_LABEL.to_string(), step.as_str().to_string()),
        ]
        .into_iter()
        .collect()
    }
}
