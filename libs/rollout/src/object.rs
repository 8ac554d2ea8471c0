//! Helpers over raw object values: identity and owner references.

use helion_api::OwnerReference;

/// The identity of one cluster object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {}", self.kind, self.name)
        } else {
            write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Derive the identity of a raw object value.
pub fn object_key(value: &serde_json::Value) -> Option<ObjectKey> {
    Some(ObjectKey {
        api_version: value.get("apiVersion")?.as_str()?.to_string(),
        kind: value.get("kind")?.as_str()?.to_string(),
        namespace: value
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        name: value.pointer("/metadata/name")?.as_str()?.to_string(),
    })
}

/// Read `metadata.ownerReferences`.
pub fn owner_references(value: &serde_json::Value) -> Vec<OwnerReference> {
    value
        .pointer("/metadata/ownerReferences")
        .and_then(|refs| serde_json::from_value(refs.clone()).ok())
        .unwrap_or_default()
}

/// Replace `metadata.ownerReferences`.
pub fn set_owner_references(value: &mut serde_json::Value, refs: &[OwnerReference]) {
    if let Some(metadata) = value.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        match serde_json::to_value(refs) {
            Ok(encoded) => {
                metadata.insert("ownerReferences".to_string(), encoded);
            }
            Err(_) => {
                metadata.remove("ownerReferences");
            }
        }
    }
}

/// The owner reference marked as the managing controller, if any.
pub fn controller_of(refs: &[OwnerReference]) -> Option<&OwnerReference> {
    refs.iter().find(|r| r.controller)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key() {
        let value = serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "ns"},
        });
        let key = object_key(&value).unwrap();
        assert_eq!(key.api_version, "apps/v1");
        assert_eq!(key.to_string(), "Deployment ns/web");

        let cluster = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": "ns"},
        });
        assert_eq!(object_key(&cluster).unwrap().to_string(), "Namespace ns");

        assert!(object_key(&serde_json::json!({"kind": "X"})).is_none());
    }

    #[test]
    fn test_owner_reference_round_trip() {
        let mut value = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "ns"},
        });
        assert!(owner_references(&value).is_empty());

        let refs = vec![OwnerReference {
            api_version: "extensions.helion.dev/v1".to_string(),
            kind: "ClusterExtensionRevision".to_string(),
            name: "cat-1".to_string(),
            uid: "uid-1".to_string(),
            controller: true,
        }];
        set_owner_references(&mut value, &refs);

        let read_back = owner_references(&value);
        assert_eq!(read_back, refs);
        assert_eq!(controller_of(&read_back).unwrap().uid, "uid-1");
    }
}
