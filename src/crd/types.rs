//! Shared types for the Addon Custom Resource Definition

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Phase of a single lifecycle step, as reported in `status.lifecycle`
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ApplicationAssemblyPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    ValidationFailed,
    Deleting,
    DeleteSucceeded,
    DeleteFailed,
}

impl ApplicationAssemblyPhase {
    pub fn succeeded(self) -> bool {
        self == Self::Succeeded
    }

    pub fn failed(self) -> bool {
        self == Self::Failed
    }

    pub fn running(self) -> bool {
        self == Self::Running
    }

    /// Terminal state for the prereqs and install steps
    pub fn completed(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Terminal state for the delete step
    pub fn delete_completed(self) -> bool {
        matches!(self, Self::DeleteSucceeded | Self::DeleteFailed)
    }

    /// Any of the phases entered once deletion has been requested
    pub fn deleting(self) -> bool {
        matches!(
            self,
            Self::Deleting | Self::DeleteSucceeded | Self::DeleteFailed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::ValidationFailed => "ValidationFailed",
            Self::Deleting => "Deleting",
            Self::DeleteSucceeded => "DeleteSucceeded",
            Self::DeleteFailed => "DeleteFailed",
        }
    }
}

impl fmt::Display for ApplicationAssemblyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the workflow-driven steps of an addon's life
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleStep {
    Prereqs,
    Install,
    Delete,
}

impl LifecycleStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prereqs => "prereqs",
            Self::Install => "install",
            Self::Delete => "delete",
        }
    }

    /// Phase reported while a workflow for this step is in flight
    pub fn running_phase(self) -> ApplicationAssemblyPhase {
        match self {
            Self::Delete => ApplicationAssemblyPhase::Deleting,
            _ => ApplicationAssemblyPhase::Running,
        }
    }

    pub fn succeeded_phase(self) -> ApplicationAssemblyPhase {
        match self {
            Self::Delete => ApplicationAssemblyPhase::DeleteSucceeded,
            _ => ApplicationAssemblyPhase::Succeeded,
        }
    }

    pub fn failed_phase(self) -> ApplicationAssemblyPhase {
        match self {
            Self::Delete => ApplicationAssemblyPhase::DeleteFailed,
            _ => ApplicationAssemblyPhase::Failed,
        }
    }

    /// Whether `phase` is the terminal state appropriate to this step
    pub fn is_terminal(self, phase: ApplicationAssemblyPhase) -> bool {
        match self {
            Self::Delete => phase.delete_completed(),
            _ => phase.completed(),
        }
    }
}

impl fmt::Display for LifecycleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow definition for one lifecycle step
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowType {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,

    /// Service account the workflow pods run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Argo `Workflow` manifest in YAML. Empty means nothing to run.
    #[serde(default)]
    pub template: String,
}

/// Workflows for each lifecycle step
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleWorkflowSpec {
    #[serde(default)]
    pub prereqs: WorkflowType,

    #[serde(default)]
    pub install: WorkflowType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<WorkflowType>,
}

impl LifecycleWorkflowSpec {
    /// Look up the step definition. `None` means the step is not defined at all,
    /// which is different from a defined step with an empty template.
    pub fn workflow_for(&self, step: LifecycleStep) -> Option<&WorkflowType> {
        match step {
            LifecycleStep::Prereqs => Some(&self.prereqs),
            LifecycleStep::Install => Some(&self.install),
            LifecycleStep::Delete => self.delete.as_ref(),
        }
    }

    /// True when a delete workflow with a non-empty template is configured
    pub fn has_delete_workflow(&self) -> bool {
        self.delete
            .as_ref()
            .map(|wt| !wt.template.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Cluster context made available to workflows
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_region: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_config: BTreeMap<String, String>,
}

/// Parameters passed to the lifecycle workflows
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddonParams {
    /// Namespace the addon installs into; required secrets are looked up here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default)]
    pub context: ClusterContext,

    /// Values merged into the workflow's `spec.arguments.parameters`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
}

/// A single label selector requirement
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SelectorRequirement {
    pub key: String,
    /// One of `In`, `NotIn`, `Exists`, `DoesNotExist`
    pub operator: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Label selector for the addon's child workloads
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddonSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<SelectorRequirement>,
}

impl AddonSelector {
    /// Render as a Kubernetes label selector query string.
    ///
    /// Fails on unknown operators or on operators whose `values` arity is wrong.
    pub fn to_selector_string(&self) -> Result<String, String> {
        let mut parts: Vec<String> = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        for req in &self.match_expressions {
            if req.key.trim().is_empty() {
                return Err("selector requirement key must not be empty".to_string());
            }
            let part = match req.operator.as_str() {
                "In" | "NotIn" => {
                    if req.values.is_empty() {
                        return Err(format!(
                            "operator {} on key {} requires at least one value",
                            req.operator, req.key
                        ));
                    }
                    let op = if req.operator == "In" { "in" } else { "notin" };
                    format!("{} {} ({})", req.key, op, req.values.join(","))
                }
                "Exists" | "DoesNotExist" => {
                    if !req.values.is_empty() {
                        return Err(format!(
                            "operator {} on key {} must not have values",
                            req.operator, req.key
                        ));
                    }
                    if req.operator == "Exists" {
                        req.key.clone()
                    } else {
                        format!("!{}", req.key)
                    }
                }
                other => {
                    return Err(format!(
                        "unknown selector operator {:?} on key {}",
                        other, req.key
                    ))
                }
            };
            parts.push(part);
        }

        Ok(parts.join(","))
    }
}

/// Reference to a secret the install workflow needs
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SecretRef {
    pub name: String,
}

/// Observed state of one child workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStatus {
    pub kind: String,
    #[serde(default)]
    pub group: String,
    pub name: String,
    /// Coarse summary, e.g. `Ready 2/3` or `Succeeded`
    #[serde(default)]
    pub status: String,
}

/// Per-step lifecycle phases
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddonStatusLifecycle {
    pub prereqs: Option<ApplicationAssemblyPhase>,
    pub installed: Option<ApplicationAssemblyPhase>,
}
