//! Spec change detection
//!
//! The stored checksum ties the status to the spec it was computed for. When
//! the spec changes, everything derived from the old spec is discarded before
//! any step runs again.

use tracing::info;

use super::workflow::WorkflowLifecycle;
use crate::crd::{Addon, ApplicationAssemblyPhase};
use crate::error::Result;

/// What the reconcile should do after the checksum check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumOutcome {
    /// Spec unchanged, keep processing
    Continue,
    /// Status was reset for a new spec; persist it and requeue
    Reset,
}

/// Compare the spec checksum against the stored one and reset on change.
///
/// On change, workflows submitted for the superseded spec are deleted first,
/// so no execution for an old spec is left behind.
pub async fn check_checksum(
    addon: &mut Addon,
    workflows: &WorkflowLifecycle<'_>,
    now_millis: i64,
) -> Result<ChecksumOutcome> {
    let checksum = addon.spec.checksum();
    if addon.stored_checksum() == checksum {
        return Ok(ChecksumOutcome::Continue);
    }

    workflows.delete_owned(addon).await?;

    addon.clear_status();
    let status = addon.status_mut();
    status.checksum = checksum;
    status.starttime = now_millis;
    addon.set_prereq_and_install_statuses(ApplicationAssemblyPhase::Pending);

    info!(
        "Checksum changed for Addon {}, addon will be installed",
        addon.key()
    );
    Ok(ChecksumOutcome::Reset)
}
