//! Typed view over one decoded manifest entry.

use helion_api::{GroupVersionKind, NamespacedName};

/// A decoded manifest entry with its derived identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestObject {
    gvk: GroupVersionKind,
    id: NamespacedName,
    /// The resource plural derived from the mapper, e.g. `services`.
    resource: String,
    namespaced: bool,
    value: serde_json::Value,
}

impl ManifestObject {
    pub fn new(
        gvk: GroupVersionKind,
        id: NamespacedName,
        resource: impl Into<String>,
        namespaced: bool,
        value: serde_json::Value,
    ) -> Self {
        Self {
            gvk,
            id,
            resource: resource.into(),
            namespaced,
            value,
        }
    }

    pub fn gvk(&self) -> &GroupVersionKind {
        &self.gvk
    }

    pub fn kind(&self) -> &str {
        &self.gvk.kind
    }

    pub fn id(&self) -> &NamespacedName {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }

    pub fn namespace(&self) -> &str {
        &self.id.namespace
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn is_namespaced(&self) -> bool {
        self.namespaced
    }

    /// The raw decoded content.
    pub fn value(&self) -> &serde_json::Value {
        &self.value
    }

    /// Consume into the raw content, for embedding into a revision.
    pub fn into_value(self) -> serde_json::Value {
        self.value
    }
}

impl std::fmt::Display for ManifestObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.gvk, self.id)
    }
}
