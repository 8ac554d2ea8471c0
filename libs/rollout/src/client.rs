//! The cluster seam: object reads, applies and deletes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::object::{object_key, owner_references, ObjectKey};

/// Errors from cluster object operations. All are transient: the
/// orchestrator is retried with backoff.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("orchestrator unavailable: {0}")]
    Unavailable(String),

    #[error("conflicting write: {0}")]
    Conflict(String),
}

/// Minimal typed access to cluster objects.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Read one object, or `None` when absent.
    async fn get(&self, key: &ObjectKey) -> Result<Option<serde_json::Value>, ClientError>;

    /// Create or update an object to the given desired state.
    async fn apply(&self, value: serde_json::Value) -> Result<serde_json::Value, ClientError>;

    /// Delete one object; absent objects are a no-op.
    async fn delete(&self, key: &ObjectKey) -> Result<(), ClientError>;

    /// All objects carrying an owner reference with the given uid.
    async fn list_owned(&self, owner_uid: &str) -> Result<Vec<serde_json::Value>, ClientError>;
}

/// In-memory cluster for tests and local runs.
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<ObjectKey, serde_json::Value>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly, bypassing apply semantics.
    pub async fn seed(&self, value: serde_json::Value) {
        let key = object_key(&value).expect("seeded object must carry identity");
        self.objects.lock().await.insert(key, value);
    }

    /// Patch an object in place (e.g. to simulate a controller updating
    /// status).
    pub async fn patch<F>(&self, key: &ObjectKey, mutate: F)
    where
        F: FnOnce(&mut serde_json::Value),
    {
        let mut objects = self.objects.lock().await;
        if let Some(value) = objects.get_mut(key) {
            mutate(value);
        }
    }

    pub async fn contains(&self, key: &ObjectKey) -> bool {
        self.objects.lock().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.lock().await.is_empty()
    }
}

#[async_trait]
impl ObjectClient for FakeCluster {
    async fn get(&self, key: &ObjectKey) -> Result<Option<serde_json::Value>, ClientError> {
        Ok(self.objects.lock().await.get(key).cloned())
    }

    async fn apply(&self, value: serde_json::Value) -> Result<serde_json::Value, ClientError> {
        let key = object_key(&value)
            .ok_or_else(|| ClientError::Conflict("object without identity".to_string()))?;
        let mut objects = self.objects.lock().await;
        // Applies preserve status written by other controllers, the way a
        // server-side apply leaves unmanaged fields alone.
        let merged = match objects.get(&key) {
            Some(existing) => {
                let mut merged = value;
                if let (Some(status), Some(new_obj)) =
                    (existing.get("status"), merged.as_object_mut())
                {
                    new_obj.entry("status".to_string()).or_insert(status.clone());
                }
                merged
            }
            None => value,
        };
        objects.insert(key, merged.clone());
        Ok(merged)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClientError> {
        self.objects.lock().await.remove(key);
        Ok(())
    }

    async fn list_owned(&self, owner_uid: &str) -> Result<Vec<serde_json::Value>, ClientError> {
        Ok(self
            .objects
            .lock()
            .await
            .values()
            .filter(|value| {
                owner_references(value)
                    .iter()
                    .any(|r| r.uid == owner_uid)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helion_api::OwnerReference;

    fn configmap(name: &str) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "ns"},
            "data": {},
        })
    }

    #[tokio::test]
    async fn test_apply_get_delete() {
        let cluster = FakeCluster::new();
        let value = configmap("a");
        let key = object_key(&value).unwrap();

        assert!(cluster.get(&key).await.unwrap().is_none());
        cluster.apply(value).await.unwrap();
        assert!(cluster.get(&key).await.unwrap().is_some());
        cluster.delete(&key).await.unwrap();
        assert!(cluster.get(&key).await.unwrap().is_none());
        // Deleting again is a no-op.
        cluster.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_apply_preserves_status() {
        let cluster = FakeCluster::new();
        let mut value = configmap("a");
        value["status"] = serde_json::json!({"observed": 1});
        cluster.seed(value).await;

        let key = object_key(&configmap("a")).unwrap();
        let applied = cluster.apply(configmap("a")).await.unwrap();
        assert_eq!(applied["status"]["observed"], 1);
        assert_eq!(
            cluster.get(&key).await.unwrap().unwrap()["status"]["observed"],
            1
        );
    }

    #[tokio::test]
    async fn test_list_owned() {
        let cluster = FakeCluster::new();
        let mut owned = configmap("owned");
        crate::object::set_owner_references(
            &mut owned,
            &[OwnerReference {
                api_version: "extensions.helion.dev/v1".to_string(),
                kind: "ClusterExtensionRevision".to_string(),
                name: "cat-1".to_string(),
                uid: "uid-1".to_string(),
                controller: true,
            }],
        );
        cluster.seed(owned).await;
        cluster.seed(configmap("free")).await;

        let owned = cluster.list_owned("uid-1").await.unwrap();
        assert_eq!(owned.len(), 1);
        assert!(cluster.list_owned("uid-2").await.unwrap().is_empty());
    }
}
