//! Addon validation
//!
//! Dependency problems are reported as their own variants so the lifecycle can
//! treat them as expected waiting rather than failures.

use kube::ResourceExt;
use thiserror::Error;

use super::version_cache::{DependencyState, VersionCache};
use crate::crd::{Addon, LifecycleStep};

/// Kind an Argo workflow manifest must declare
const WORKFLOW_KIND: &str = "Workflow";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A dependency exists but its owner has not finished installing
    #[error("dependency {pkg_name}:{pkg_version} is pending")]
    DependencyPending {
        pkg_name: String,
        pkg_version: String,
    },

    /// A dependency is absent, at another version, or failed
    #[error("dependency {pkg_name}:{pkg_version} is not installed")]
    DependencyMissing {
        pkg_name: String,
        pkg_version: String,
    },

    #[error("{0}")]
    Invalid(String),
}

/// Validate the addon against its own spec and the current version cache.
///
/// Structural problems win over dependency problems; among dependencies a
/// missing one wins over a pending one.
pub fn validate(addon: &Addon, versions: &VersionCache) -> Result<(), ValidationError> {
    let spec = &addon.spec;

    if spec.pkg_name.trim().is_empty() {
        return Err(ValidationError::Invalid(
            "spec.pkgName must not be empty".to_string(),
        ));
    }
    if spec.pkg_version.trim().is_empty() {
        return Err(ValidationError::Invalid(
            "spec.pkgVersion must not be empty".to_string(),
        ));
    }

    spec.selector
        .to_selector_string()
        .map_err(|e| ValidationError::Invalid(format!("spec.selector is invalid: {}", e)))?;

    for step in [
        LifecycleStep::Prereqs,
        LifecycleStep::Install,
        LifecycleStep::Delete,
    ] {
        if let Some(wt) = spec.lifecycle.workflow_for(step) {
            validate_template(step, &wt.template)?;
        }
    }

    if let Some(owner) = versions.has_version(&spec.pkg_name) {
        let namespace = addon.namespace().unwrap_or_default();
        if !owner.is_owned_by(&namespace, &addon.name_any()) {
            return Err(ValidationError::Invalid(format!(
                "package {} is already provided by addon {}/{}",
                spec.pkg_name, owner.namespace, owner.name
            )));
        }
    }

    let mut pending = None;
    for (pkg_name, pkg_version) in &spec.pkg_deps {
        match versions.classify(pkg_name, pkg_version) {
            DependencyState::Satisfied => {}
            DependencyState::Missing => {
                return Err(ValidationError::DependencyMissing {
                    pkg_name: pkg_name.clone(),
                    pkg_version: pkg_version.clone(),
                })
            }
            DependencyState::Pending => {
                pending.get_or_insert_with(|| ValidationError::DependencyPending {
                    pkg_name: pkg_name.clone(),
                    pkg_version: pkg_version.clone(),
                });
            }
        }
    }

    match pending {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn validate_template(step: LifecycleStep, template: &str) -> Result<(), ValidationError> {
    if template.trim().is_empty() {
        return Ok(());
    }

    let value: serde_json::Value = serde_yaml::from_str(template).map_err(|e| {
        ValidationError::Invalid(format!("{} workflow template is not valid YAML: {}", step, e))
    })?;

    match value.get("kind").and_then(|k| k.as_str()) {
        Some(WORKFLOW_KIND) => Ok(()),
        other => Err(ValidationError::Invalid(format!(
            "{} workflow template must be of kind {}, found {:?}",
            step, WORKFLOW_KIND, other
        ))),
    }
}
