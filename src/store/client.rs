//! Object store backed by the Kubernetes API server

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams, PostParams};
use kube::Client;
use tracing::debug;

use super::{ObjectKey, ObjectStore, ResourceKind};
use crate::error::{Error, Result};

/// [`ObjectStore`] that talks to the cluster through `kube::Api<DynamicObject>`
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = kind.api_resource();
        match namespace {
            Some(ns) if kind.is_namespaced() => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject> {
        self.api(key.kind, key.namespace.as_deref())
            .get(&key.name)
            .await
            .map_err(|e| Error::from_kube(e, key))
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let list = self
            .api(kind, namespace)
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?;
        Ok(list.items)
    }

    async fn create(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(kind, obj);
        debug!("Creating {}", key);
        self.api(kind, key.namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, &key))
    }

    async fn update(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(kind, obj);
        debug!(
            "Replacing {} at resourceVersion {:?}",
            key, obj.metadata.resource_version
        );
        self.api(kind, key.namespace.as_deref())
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, &key))
    }
}
