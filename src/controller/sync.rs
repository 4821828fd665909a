//! Create-or-update against the remote object store

use std::fmt;

use kube::api::DynamicObject;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::store::{ObjectKey, ObjectStore};

/// What a synchronization call did to the remote object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    Created,
    Updated,
}

impl Outcome {
    pub fn is_write(&self) -> bool {
        !matches!(self, Outcome::Unchanged)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Unchanged => write!(f, "unchanged"),
            Outcome::Created => write!(f, "created"),
            Outcome::Updated => write!(f, "updated"),
        }
    }
}

/// Fetch `key`, apply `mutate`, and write the result back only if it changed.
///
/// An absent object is created from an empty shell carrying the key's
/// identity. A present object is updated with the resourceVersion observed
/// at fetch time; a stale token surfaces as [`Error::Conflict`] and is not
/// retried here.
#[instrument(skip(store, mutate), fields(object = %key))]
pub async fn create_or_update<S, F>(store: &S, key: &ObjectKey, mutate: F) -> Result<Outcome>
where
    S: ObjectStore + ?Sized,
    F: FnOnce(&mut DynamicObject) -> Result<()>,
{
    let outcome = match store.get(key).await {
        Ok(mut obj) => {
            let original = serde_json::to_value(&obj)?;
            let token = obj.metadata.resource_version.clone();

            mutate(&mut obj)?;
            check_identity(key, &obj)?;

            if serde_json::to_value(&obj)? == original {
                Outcome::Unchanged
            } else {
                obj.metadata.resource_version = token;
                store.update(key.kind, &obj).await?;
                Outcome::Updated
            }
        }
        Err(e) if e.is_not_found() => {
            let mut obj = key.shell();
            mutate(&mut obj)?;
            check_identity(key, &obj)?;
            store.create(key.kind, &obj).await?;
            Outcome::Created
        }
        Err(e) => return Err(e),
    };

    if outcome.is_write() {
        info!("Successfully {} {}", outcome, key);
    } else {
        debug!("{} already up to date", key);
    }
    Ok(outcome)
}

/// Create `desired` if no object with its identity exists; never update it.
#[instrument(skip(store, desired), fields(object = %key))]
pub async fn create_if_absent<S>(
    store: &S,
    key: &ObjectKey,
    desired: &DynamicObject,
) -> Result<Outcome>
where
    S: ObjectStore + ?Sized,
{
    check_identity(key, desired)?;
    match store.get(key).await {
        Ok(_) => {
            debug!("{} exists, leaving it untouched", key);
            return Ok(Outcome::Unchanged);
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    match store.create(key.kind, desired).await {
        Ok(_) => {
            info!("Successfully created {}", key);
            Ok(Outcome::Created)
        }
        Err(e) if e.is_already_exists() => Ok(Outcome::Unchanged),
        Err(e) => Err(e),
    }
}

fn check_identity(key: &ObjectKey, obj: &DynamicObject) -> Result<()> {
    if obj.metadata.name.as_deref() != Some(key.name.as_str()) {
        return Err(Error::InvalidMutation(key.clone()));
    }
    if key.kind.is_namespaced() && obj.metadata.namespace != key.namespace {
        return Err(Error::InvalidMutation(key.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::store::{MemoryStore, ResourceKind};

    /// Store where a competing writer updates the object after every read
    struct RacingStore(MemoryStore);

    #[async_trait]
    impl ObjectStore for RacingStore {
        async fn get(&self, key: &ObjectKey) -> Result<DynamicObject> {
            let observed = self.0.get(key).await?;
            let mut competing = observed.clone();
            competing.data["data"] = json!({ "key": "competitor" });
            self.0.update(key.kind, &competing).await?;
            Ok(observed)
        }

        async fn list(
            &self,
            kind: ResourceKind,
            namespace: Option<&str>,
        ) -> Result<Vec<DynamicObject>> {
            self.0.list(kind, namespace).await
        }

        async fn create(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
            self.0.create(kind, obj).await
        }

        async fn update(&self, kind: ResourceKind, obj: &DynamicObject) -> Result<DynamicObject> {
            self.0.update(kind, obj).await
        }
    }

    fn key() -> ObjectKey {
        ObjectKey::namespaced(ResourceKind::ConfigMap, "storage", "settings")
    }

    fn set_data(value: &'static str) -> impl FnOnce(&mut DynamicObject) -> Result<()> {
        move |obj| {
            obj.data["data"] = json!({ "key": value });
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_absent_object_is_created() {
        let store = MemoryStore::new();
        let outcome = assert_ok!(create_or_update(&store, &key(), set_data("a")).await);

        assert_eq!(outcome, Outcome::Created);
        let stored = assert_ok!(store.get(&key()).await);
        assert_eq!(stored.data["data"]["key"], json!("a"));
    }

    #[tokio::test]
    async fn test_unchanged_object_is_not_written() {
        let store = MemoryStore::new();
        assert_ok!(create_or_update(&store, &key(), set_data("a")).await);

        let outcome = assert_ok!(create_or_update(&store, &key(), set_data("a")).await);
        assert_eq!(outcome, Outcome::Unchanged);
        assert_eq!(store.writes().await, 1);
    }

    #[tokio::test]
    async fn test_changed_object_is_updated() {
        let store = MemoryStore::new();
        assert_ok!(create_or_update(&store, &key(), set_data("a")).await);

        let outcome = assert_ok!(create_or_update(&store, &key(), set_data("b")).await);
        assert_eq!(outcome, Outcome::Updated);
        let stored = assert_ok!(store.get(&key()).await);
        assert_eq!(stored.data["data"]["key"], json!("b"));
    }

    #[tokio::test]
    async fn test_concurrent_write_surfaces_conflict() {
        let inner = MemoryStore::new();
        assert_ok!(create_or_update(&inner, &key(), set_data("a")).await);
        let store = RacingStore(inner);

        let err = assert_err!(create_or_update(&store, &key(), set_data("b")).await);
        assert!(matches!(err, Error::Conflict(_)));
        assert!(err.is_retriable());

        let stored = assert_ok!(store.0.get(&key()).await);
        assert_eq!(stored.data["data"]["key"], json!("competitor"));
    }

    #[tokio::test]
    async fn test_renaming_in_mutate_is_rejected() {
        let store = MemoryStore::new();
        let err = assert_err!(
            create_or_update(&store, &key(), |obj| {
                obj.metadata.name = Some("other".to_string());
                Ok(())
            })
            .await
        );
        assert!(matches!(err, Error::InvalidMutation(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_create_if_absent_never_overwrites() {
        let store = MemoryStore::new();
        let mut external = key().shell();
        external.data["data"] = json!({ "config.json": "[{\"user\":\"edit\"}]" });
        assert_ok!(store.seed(ResourceKind::ConfigMap, &external).await);

        let mut desired = key().shell();
        desired.data["data"] = json!({ "config.json": "[]" });
        let outcome = assert_ok!(create_if_absent(&store, &key(), &desired).await);

        assert_eq!(outcome, Outcome::Unchanged);
        assert_eq!(store.writes().await, 0);
        let stored = assert_ok!(store.get(&key()).await);
        assert_eq!(stored.data["data"]["config.json"], json!("[{\"user\":\"edit\"}]"));
    }
}
