//! addon-manager: Kubernetes operator for cluster addons
//!
//! An `Addon` bundles a package name and version, its dependencies, and the
//! Argo workflows that run prerequisites, install it and delete it. The
//! operator orders installs by dependency, drives each workflow to a
//! terminal phase, and rolls up the state of the workloads it created.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;

#[cfg(feature = "metrics")]
pub mod rest_api;

pub use crate::error::{Error, Result};
