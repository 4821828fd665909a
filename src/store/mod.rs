//! Remote object store seam
//!
//! The reconciliation engine only needs four verbs against the cluster:
//! get, list, create and update, keyed by (kind, namespace, name). Objects
//! travel as [`DynamicObject`] so that the field-preserving merge can work on
//! their serialized form regardless of kind.

mod client;
mod memory;

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::storage::v1::CSIDriver;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::crd::{ClusterVersion, Subscription};
use crate::error::Result;

pub use client::KubeStore;
pub use memory::MemoryStore;

/// Every kind of object the engine reads or writes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    ClusterVersion,
    ConfigMap,
    CustomResourceDefinition,
    Deployment,
    DaemonSet,
    Service,
    CsiDriver,
    SecurityContextConstraints,
    ValidatingWebhookConfiguration,
    PrometheusRule,
    ConsolePlugin,
    Subscription,
}

impl ResourceKind {
    /// API coordinates used to build dynamic requests
    pub fn api_resource(&self) -> ApiResource {
        match self {
            ResourceKind::ClusterVersion => ApiResource::erase::<ClusterVersion>(&()),
            ResourceKind::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
            ResourceKind::CustomResourceDefinition => {
                ApiResource::erase::<CustomResourceDefinition>(&())
            }
            ResourceKind::Deployment => ApiResource::erase::<Deployment>(&()),
            ResourceKind::DaemonSet => ApiResource::erase::<DaemonSet>(&()),
            ResourceKind::Service => ApiResource::erase::<Service>(&()),
            ResourceKind::CsiDriver => ApiResource::erase::<CSIDriver>(&()),
            ResourceKind::ValidatingWebhookConfiguration => {
                ApiResource::erase::<ValidatingWebhookConfiguration>(&())
            }
            ResourceKind::Subscription => ApiResource::erase::<Subscription>(&()),
            ResourceKind::SecurityContextConstraints => ApiResource::from_gvk_with_plural(
                &GroupVersionKind::gvk("security.openshift.io", "v1", "SecurityContextConstraints"),
                "securitycontextconstraints",
            ),
            ResourceKind::PrometheusRule => ApiResource::from_gvk_with_plural(
                &GroupVersionKind::gvk("monitoring.coreos.com", "v1", "PrometheusRule"),
                "prometheusrules",
            ),
            ResourceKind::ConsolePlugin => ApiResource::from_gvk_with_plural(
                &GroupVersionKind::gvk("console.openshift.io", "v1", "ConsolePlugin"),
                "consoleplugins",
            ),
        }
    }

    pub fn is_namespaced(&self) -> bool {
        !matches!(
            self,
            ResourceKind::ClusterVersion
                | ResourceKind::CustomResourceDefinition
                | ResourceKind::CsiDriver
                | ResourceKind::SecurityContextConstraints
                | ResourceKind::ValidatingWebhookConfiguration
                | ResourceKind::ConsolePlugin
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.api_resource().kind)
    }
}

/// Identity of a remote object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(kind: ResourceKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    pub fn cluster(kind: ResourceKind, name: &str) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.to_string(),
        }
    }

    /// Key of an object as it would be stored, ignoring a stray namespace on
    /// cluster-scoped kinds
    pub fn of(kind: ResourceKind, obj: &DynamicObject) -> Self {
        Self {
            kind,
            namespace: if kind.is_namespaced() {
                obj.metadata.namespace.clone()
            } else {
                None
            },
            name: obj.metadata.name.clone().unwrap_or_default(),
        }
    }

    /// Empty object carrying only this key's identity
    pub fn shell(&self) -> DynamicObject {
        let obj = DynamicObject::new(&self.name, &self.kind.api_resource());
        match &self.namespace {
            Some(ns) => obj.within(ns),
            None => obj,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Remote, optimistically-concurrent object store
///
/// `update` must reject an object whose resourceVersion is stale with
/// [`crate::Error::Conflict`]; `get` reports absence as
/// [`crate::Error::NotFound`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject>;

    async fn list(&self, kind: ResourceKind, namespace: Option<&str>)
        -> Result<Vec<DynamicObject>>;

    async fn create(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn update(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject>;
}

/// Convert a typed object into its dynamic representation
pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Convert a dynamic object back into a typed one
pub fn from_dynamic<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_scoped_kinds() {
        assert!(!ResourceKind::CsiDriver.is_namespaced());
        assert!(!ResourceKind::SecurityContextConstraints.is_namespaced());
        assert!(!ResourceKind::ValidatingWebhookConfiguration.is_namespaced());
        assert!(ResourceKind::PrometheusRule.is_namespaced());
        assert!(ResourceKind::Subscription.is_namespaced());
    }

    #[test]
    fn test_shell_carries_identity() {
        let key = ObjectKey::namespaced(ResourceKind::DaemonSet, "storage", "csi-rbdplugin");
        let shell = key.shell();
        assert_eq!(shell.metadata.name.as_deref(), Some("csi-rbdplugin"));
        assert_eq!(shell.metadata.namespace.as_deref(), Some("storage"));
        assert_eq!(ObjectKey::of(ResourceKind::DaemonSet, &shell), key);

        let types = shell.types.expect("dynamic objects carry type meta");
        assert_eq!(types.api_version, "apps/v1");
        assert_eq!(types.kind, "DaemonSet");
    }

    #[test]
    fn test_display() {
        let key = ObjectKey::cluster(ResourceKind::ConsolePlugin, "odf-client-console");
        assert_eq!(key.to_string(), "ConsolePlugin odf-client-console");
    }
}
