//! Finalizer handling for Addon cleanup
//!
//! The finalizer is added only once an addon has passed validation, and is
//! removed once its delete workflow (if any) has succeeded. While present it
//! keeps the Addon object around so the delete workflow can run.

use kube::{
    api::{Api, Patch, PatchParams},
    ResourceExt,
};
use serde_json::json;
use tracing::info;

use crate::crd::Addon;
use crate::error::Result;

/// Finalizer name used to protect Addon resources
pub const ADDON_FINALIZER: &str = "delete.addonmgr.keikoproj.io";

/// Field manager recorded on patches made by the operator
pub const FIELD_MANAGER: &str = "addon-manager";

/// Add the finalizer if it is not present yet
pub async fn add_finalizer(api: &Api<Addon>, addon: &mut Addon) -> Result<()> {
    if has_finalizer(addon) || addon.is_being_deleted() {
        return Ok(());
    }

    let mut finalizers = addon.finalizers().to_vec();
    finalizers.push(ADDON_FINALIZER.to_string());
    patch_finalizers(api, addon, &finalizers).await?;
    addon.metadata.finalizers = Some(finalizers);

    info!("Added finalizer to Addon: {}", addon.key());
    Ok(())
}

/// Remove the finalizer so Kubernetes can complete deletion
pub async fn remove_finalizer(api: &Api<Addon>, addon: &mut Addon) -> Result<()> {
    if !has_finalizer(addon) {
        return Ok(());
    }

    let finalizers: Vec<String> = addon
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != ADDON_FINALIZER)
        .cloned()
        .collect();
    patch_finalizers(api, addon, &finalizers).await?;
    addon.metadata.finalizers = Some(finalizers);

    info!("Removed finalizer from Addon: {}", addon.key());
    Ok(())
}

/// Check if the addon carries our finalizer
pub fn has_finalizer(addon: &Addon) -> bool {
    addon.finalizers().iter().any(|f| f == ADDON_FINALIZER)
}

async fn patch_finalizers(api: &Api<Addon>, addon: &Addon, finalizers: &[String]) -> Result<()> {
    let patch = json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(
        &addon.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}
