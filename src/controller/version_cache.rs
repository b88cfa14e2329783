//! Process-wide registry of installed packages
//!
//! Maps a package name to the addon currently providing it. The cache lives
//! only in memory: after a restart it is empty until reconciles repopulate it.
//! Reconciles for different addons run in parallel, so every access goes
//! through the lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use kube::ResourceExt;

use crate::crd::{Addon, ApplicationAssemblyPhase};

/// Version wildcard accepted in `pkgDeps`
pub const ANY_VERSION: &str = "*";

/// A package version and the addon that owns it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Version {
    pub namespace: String,
    pub name: String,
    pub pkg_name: String,
    pub pkg_version: String,
    /// Install phase of the owning addon; `None` until the first status is set
    pub phase: Option<ApplicationAssemblyPhase>,
}

impl Version {
    pub fn from_addon(addon: &Addon) -> Self {
        Self {
            namespace: addon.namespace().unwrap_or_default(),
            name: addon.name_any(),
            pkg_name: addon.spec.pkg_name.clone(),
            pkg_version: addon.spec.pkg_version.clone(),
            phase: addon.install_phase(),
        }
    }

    pub fn is_owned_by(&self, namespace: &str, name: &str) -> bool {
        self.namespace == namespace && self.name == name
    }
}

/// Whether a requested dependency can be used
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DependencyState {
    /// Present and its owner finished installing
    Satisfied,
    /// Present, owner still working towards a terminal state
    Pending,
    /// Absent, wrong version, or the owner failed
    Missing,
}

#[derive(Clone, Debug, Default)]
pub struct VersionCache {
    inner: Arc<RwLock<HashMap<String, Version>>>,
}

impl VersionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the addon providing `pkg_name`
    pub fn has_version(&self, pkg_name: &str) -> Option<Version> {
        self.read(|map| map.get(pkg_name).cloned())
    }

    /// Look up an entry by owning addon
    pub fn has_version_name(&self, namespace: &str, addon_name: &str) -> Option<Version> {
        self.read(|map| {
            map.values()
                .find(|v| v.is_owned_by(namespace, addon_name))
                .cloned()
        })
    }

    /// Entry for `pkg_name` if its version matches (`*` matches any)
    pub fn get_version(&self, pkg_name: &str, pkg_version: &str) -> Option<Version> {
        self.has_version(pkg_name)
            .filter(|v| pkg_version == ANY_VERSION || v.pkg_version == pkg_version)
    }

    /// Insert or replace the entry for the version's package
    pub fn add_version(&self, version: Version) {
        self.write(|map| {
            map.insert(version.pkg_name.clone(), version);
        });
    }

    /// Remove `pkg_name` if it is still at `pkg_version`
    pub fn remove_version(&self, pkg_name: &str, pkg_version: &str) {
        self.write(|map| {
            if map
                .get(pkg_name)
                .map(|v| v.pkg_version == pkg_version)
                .unwrap_or(false)
            {
                map.remove(pkg_name);
            }
        });
    }

    /// Drop every entry owned by the given addon
    pub fn remove_addon(&self, namespace: &str, name: &str) {
        self.write(|map| map.retain(|_, v| !v.is_owned_by(namespace, name)));
    }

    /// Record the addon's current package and phase.
    ///
    /// If the addon changed package name, the entry for its old package is dropped.
    pub fn record(&self, addon: &Addon) {
        let version = Version::from_addon(addon);
        self.write(|map| {
            map.retain(|pkg, v| {
                !(v.is_owned_by(&version.namespace, &version.name) && *pkg != version.pkg_name)
            });
            map.insert(version.pkg_name.clone(), version);
        });
    }

    pub fn classify(&self, pkg_name: &str, pkg_version: &str) -> DependencyState {
        let Some(version) = self.get_version(pkg_name, pkg_version) else {
            return DependencyState::Missing;
        };
        match version.phase {
            Some(ApplicationAssemblyPhase::Succeeded) => DependencyState::Satisfied,
            None
            | Some(ApplicationAssemblyPhase::Pending)
            | Some(ApplicationAssemblyPhase::Running) => DependencyState::Pending,
            Some(_) => DependencyState::Missing,
        }
    }

    pub fn len(&self) -> usize {
        self.read(|map| map.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A poisoned lock only means another reconcile panicked mid-update; the
    // map itself is still usable.
    fn read<T>(&self, f: impl FnOnce(&HashMap<String, Version>) -> T) -> T {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut HashMap<String, Version>) -> T) -> T {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}
