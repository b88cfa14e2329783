//! Cluster access used by the addon lifecycle
//!
//! The lifecycle talks to the API server only through [`AddonCluster`], so the
//! state machine can be exercised against an in-memory cluster in tests.

use std::collections::BTreeSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    client::Client,
    Resource, ResourceExt,
};
use serde_json::json;
use tracing::{debug, warn};

use super::finalizers::{self, FIELD_MANAGER};
use crate::crd::Addon;
use crate::error::Result;

/// Kubernetes event severity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

#[async_trait]
pub trait AddonCluster: Send + Sync {
    /// Fetch the latest copy of an addon; `None` when it no longer exists
    async fn get_addon(&self, namespace: &str, name: &str) -> Result<Option<Addon>>;

    /// Persist the addon's status subresource
    async fn update_status(&self, addon: &Addon) -> Result<()>;

    /// Add the addon finalizer, updating `addon.metadata` on success
    async fn add_finalizer(&self, addon: &mut Addon) -> Result<()>;

    /// Remove the addon finalizer, updating `addon.metadata` on success
    async fn remove_finalizer(&self, addon: &mut Addon) -> Result<()>;

    /// Names of all secrets in a namespace
    async fn secret_names(&self, namespace: &str) -> Result<BTreeSet<String>>;

    /// Record an event against the addon. Failures are logged, never returned.
    async fn publish_event(&self, addon: &Addon, type_: EventType, reason: &str, message: &str);
}

/// [`AddonCluster`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn addons(&self, addon: &Addon) -> Api<Addon> {
        let namespace = addon.namespace().unwrap_or_else(|| "default".to_string());
        Api::namespaced(self.client.clone(), &namespace)
    }
}

#[async_trait]
impl AddonCluster for KubeCluster {
    async fn get_addon(&self, namespace: &str, name: &str) -> Result<Option<Addon>> {
        let api: Api<Addon> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_status(&self, addon: &Addon) -> Result<()> {
        let patch = json!({ "status": addon.status });
        self.addons(addon)
            .patch_status(
                &addon.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        debug!("Status updated for Addon {}", addon.key());
        Ok(())
    }

    async fn add_finalizer(&self, addon: &mut Addon) -> Result<()> {
        let api = self.addons(addon);
        finalizers::add_finalizer(&api, addon).await
    }

    async fn remove_finalizer(&self, addon: &mut Addon) -> Result<()> {
        let api = self.addons(addon);
        finalizers::remove_finalizer(&api, addon).await
    }

    async fn secret_names(&self, namespace: &str) -> Result<BTreeSet<String>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secrets = api.list_metadata(&ListParams::default()).await?;
        Ok(secrets
            .items
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .collect())
    }

    async fn publish_event(&self, addon: &Addon, type_: EventType, reason: &str, message: &str) {
        let namespace = addon.namespace().unwrap_or_else(|| "default".to_string());
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);

        let time = chrono::Utc::now();
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", addon.name_any())),
                ..Default::default()
            },
            type_: Some(type_.as_str().to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: addon.object_ref(&()),
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            count: Some(1),
            reporting_component: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        if let Err(e) = events.create(&PostParams::default(), &event).await {
            warn!(
                "Failed to record {} event for Addon {}: {:?}",
                reason,
                addon.key(),
                e
            );
        }
    }
}
