//! In-process object store with API-server semantics
//!
//! Assigns uid and resourceVersion on create, rejects stale updates, and
//! garbage-collects dependents through owner references on delete.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::DynamicObject;
use tokio::sync::RwLock;

use super::{ObjectKey, ObjectStore, ResourceKind};
use crate::error::{Error, Result};

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    revision: u64,
    writes: usize,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn insert_new(&mut self, key: ObjectKey, obj: &DynamicObject) -> Result<DynamicObject> {
        if self.objects.contains_key(&key) {
            return Err(Error::AlreadyExists(key));
        }
        let mut stored = obj.clone();
        if !key.kind.is_namespaced() {
            stored.metadata.namespace = None;
        }
        let revision = self.next_revision();
        stored.metadata.uid = Some(format!("uid-{revision}"));
        stored.metadata.resource_version = Some(revision);
        stored.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        self.objects.insert(key, stored.clone());
        Ok(stored)
    }
}

/// [`ObjectStore`] held entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object written by some other actor; not counted as a write
    pub async fn seed(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(kind, obj);
        self.state.write().await.insert_new(key, obj)
    }

    /// Number of successful create and update calls made through the store
    pub async fn writes(&self) -> usize {
        self.state.read().await.writes
    }

    pub async fn contains(&self, key: &ObjectKey) -> bool {
        self.state.read().await.objects.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Delete an object and everything that transitively names it as owner
    pub async fn delete(&self, key: &ObjectKey) -> Result<Vec<ObjectKey>> {
        let mut state = self.state.write().await;
        let root = state
            .objects
            .remove(key)
            .ok_or_else(|| Error::NotFound(key.clone()))?;

        let mut removed = vec![key.clone()];
        let mut doomed: BTreeSet<String> = root.metadata.uid.into_iter().collect();
        loop {
            let dependents: Vec<ObjectKey> = state
                .objects
                .iter()
                .filter(|(_, obj)| {
                    obj.metadata
                        .owner_references
                        .iter()
                        .flatten()
                        .any(|owner| doomed.contains(&owner.uid))
                })
                .map(|(key, _)| key.clone())
                .collect();
            if dependents.is_empty() {
                break;
            }
            for dependent in dependents {
                if let Some(obj) = state.objects.remove(&dependent) {
                    doomed.extend(obj.metadata.uid);
                }
                removed.push(dependent);
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject> {
        self.state
            .read()
            .await
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.clone()))
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let state = self.state.read().await;
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .filter(|(key, _)| namespace.is_none() || key.namespace.as_deref() == namespace)
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(kind, obj);
        if obj.metadata.resource_version.is_some() {
            return Err(Error::ConfigError(format!(
                "resourceVersion should not be set on objects to be created: {key}"
            )));
        }
        let mut state = self.state.write().await;
        let stored = state.insert_new(key, obj)?;
        state.writes += 1;
        Ok(stored)
    }

    async fn update(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(kind, obj);
        let mut state = self.state.write().await;
        let current = state
            .objects
            .get(&key)
            .ok_or_else(|| Error::NotFound(key.clone()))?;

        if let Some(token) = &obj.metadata.resource_version {
            if current.metadata.resource_version.as_ref() != Some(token) {
                return Err(Error::Conflict(key));
            }
        }

        let mut stored = obj.clone();
        if !kind.is_namespaced() {
            stored.metadata.namespace = None;
        }
        stored.metadata.uid = current.metadata.uid.clone();
        stored.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        stored.metadata.resource_version = Some(state.next_revision());
        state.objects.insert(key, stored.clone());
        state.writes += 1;
        Ok(stored)
    }
}
