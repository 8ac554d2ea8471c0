//! Orchestrator read/write surfaces used by the reconciler.
//!
//! Client wiring to the real orchestrator lives outside this repo; the
//! controller programs against these traits. The in-memory implementation
//! backs tests and local development.

use std::collections::BTreeMap;

use async_trait::async_trait;
use helion_api::{ClusterExtension, ClusterExtensionStatus, Revision};
use helion_preflight::CustomResourceDefinition;
use helion_rbac::RbacSnapshot;
use helion_rollout::ClientError;
use tokio::sync::Mutex;

/// Read and write access to the orchestrator's control-plane records.
#[async_trait]
pub trait ClusterState: Send + Sync {
    /// All extensions under management.
    async fn list_extensions(&self) -> Result<Vec<ClusterExtension>, ClientError>;

    /// Persist an extension's status conditions.
    async fn update_extension_status(
        &self,
        name: &str,
        status: &ClusterExtensionStatus,
    ) -> Result<(), ClientError>;

    /// A snapshot of cluster RBAC, from the read-only lister. Eventually
    /// consistent; callers re-evaluate on change events.
    async fn rbac_snapshot(&self) -> Result<RbacSnapshot, ClientError>;

    /// The currently installed CRD with this name, if any.
    async fn current_crd(
        &self,
        name: &str,
    ) -> Result<Option<CustomResourceDefinition>, ClientError>;

    /// All revisions belonging to one extension, ordered by number.
    async fn revisions_of(&self, extension_uid: &str) -> Result<Vec<Revision>, ClientError>;

    /// Create or update a revision record. Immutability rules are enforced
    /// server-side.
    async fn save_revision(&self, extension_uid: &str, revision: &Revision)
        -> Result<(), ClientError>;
}

/// In-memory control-plane state for tests and local runs.
///
/// Enforces the same revision immutability rules the orchestrator does, so
/// engine bugs surface as errors here instead of passing silently.
#[derive(Default)]
pub struct InMemoryClusterState {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    extensions: BTreeMap<String, ClusterExtension>,
    rbac: RbacSnapshot,
    crds: BTreeMap<String, CustomResourceDefinition>,
    /// extension uid -> revisions by number.
    revisions: BTreeMap<String, BTreeMap<i64, Revision>>,
}

impl InMemoryClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_extension(&self, extension: ClusterExtension) {
        self.inner
            .lock()
            .await
            .extensions
            .insert(extension.name.clone(), extension);
    }

    pub async fn extension(&self, name: &str) -> Option<ClusterExtension> {
        self.inner.lock().await.extensions.get(name).cloned()
    }

    pub async fn set_rbac(&self, snapshot: RbacSnapshot) {
        self.inner.lock().await.rbac = snapshot;
    }

    pub async fn put_crd(&self, crd: CustomResourceDefinition) {
        self.inner
            .lock()
            .await
            .crds
            .insert(crd.metadata.name.clone(), crd);
    }
}

#[async_trait]
impl ClusterState for InMemoryClusterState {
    async fn list_extensions(&self) -> Result<Vec<ClusterExtension>, ClientError> {
        Ok(self.inner.lock().await.extensions.values().cloned().collect())
    }

    async fn update_extension_status(
        &self,
        name: &str,
        status: &ClusterExtensionStatus,
    ) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().await;
        match inner.extensions.get_mut(name) {
            Some(extension) => {
                extension.status = status.clone();
                Ok(())
            }
            None => Err(ClientError::Conflict(format!(
                "extension {name} does not exist"
            ))),
        }
    }

    async fn rbac_snapshot(&self) -> Result<RbacSnapshot, ClientError> {
        Ok(self.inner.lock().await.rbac.clone())
    }

    async fn current_crd(
        &self,
        name: &str,
    ) -> Result<Option<CustomResourceDefinition>, ClientError> {
        Ok(self.inner.lock().await.crds.get(name).cloned())
    }

    async fn revisions_of(&self, extension_uid: &str) -> Result<Vec<Revision>, ClientError> {
        Ok(self
            .inner
            .lock()
            .await
            .revisions
            .get(extension_uid)
            .map(|revisions| revisions.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_revision(
        &self,
        extension_uid: &str,
        revision: &Revision,
    ) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().await;
        let revisions = inner.revisions.entry(extension_uid.to_string()).or_default();

        if let Some(existing) = revisions.get(&revision.revision) {
            Revision::validate_update(existing, revision)
                .map_err(|e| ClientError::Conflict(e.to_string()))?;
        } else {
            revision
                .validate()
                .map_err(|e| ClientError::Conflict(e.to_string()))?;
        }
        revisions.insert(revision.revision, revision.clone());
        Ok(())
    }
}
