//! Kind → resource mapping.
//!
//! The orchestrator addresses objects by resource plural, not kind; the
//! mapper derives the plural and scope for each decoded entry. The builtin
//! table covers the groups a bundle can reasonably carry; kinds declared by
//! CustomResourceDefinitions in the same stream are added on top.

use std::collections::BTreeMap;

use helion_api::GroupVersionKind;

/// A group/resource pair, the unit authorization attributes are keyed by.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupResource {
    pub group: String,
    pub resource: String,
}

impl GroupResource {
    pub fn new(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
        }
    }
}

impl std::fmt::Display for GroupResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}

/// Result of mapping a kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMapping {
    /// Lowercase plural, e.g. `deployments`.
    pub resource: String,
    pub namespaced: bool,
}

/// Derives resource plurals and scope for decoded kinds.
pub trait ResourceMapper {
    /// Map a group/version/kind, or `None` when the kind is unknown.
    fn map(&self, gvk: &GroupVersionKind) -> Option<ResourceMapping>;
}

/// Static mapping table for the builtin API groups.
#[derive(Debug, Clone)]
pub struct BuiltinMapper {
    table: BTreeMap<(String, String), ResourceMapping>,
}

impl BuiltinMapper {
    pub fn new() -> Self {
        let mut mapper = Self {
            table: BTreeMap::new(),
        };
        for (group, kind, resource, namespaced) in BUILTIN_KINDS {
            mapper.insert(group, kind, resource, *namespaced);
        }
        mapper
    }

    /// Register an additional kind, e.g. one declared by a CRD in the same
    /// bundle.
    pub fn insert(&mut self, group: &str, kind: &str, resource: &str, namespaced: bool) {
        self.table.insert(
            (group.to_string(), kind.to_string()),
            ResourceMapping {
                resource: resource.to_string(),
                namespaced,
            },
        );
    }
}

impl Default for BuiltinMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMapper for BuiltinMapper {
    fn map(&self, gvk: &GroupVersionKind) -> Option<ResourceMapping> {
        self.table
            .get(&(gvk.group.clone(), gvk.kind.clone()))
            .cloned()
    }
}

/// (group, kind, resource, namespaced)
const BUILTIN_KINDS: &[(&str, &str, &str, bool)] = &[
    // Core
    ("", "ConfigMap", "configmaps", true),
    ("", "Endpoints", "endpoints", true),
    ("", "Event", "events", true),
    ("", "LimitRange", "limitranges", true),
    ("", "Namespace", "namespaces", false),
    ("", "PersistentVolume", "persistentvolumes", false),
    ("", "PersistentVolumeClaim", "persistentvolumeclaims", true),
    ("", "Pod", "pods", true),
    ("", "ResourceQuota", "resourcequotas", true),
    ("", "Secret", "secrets", true),
    ("", "Service", "services", true),
    ("", "ServiceAccount", "serviceaccounts", true),
    // apps
    ("apps", "DaemonSet", "daemonsets", true),
    ("apps", "Deployment", "deployments", true),
    ("apps", "ReplicaSet", "replicasets", true),
    ("apps", "StatefulSet", "statefulsets", true),
    // batch
    ("batch", "CronJob", "cronjobs", true),
    ("batch", "Job", "jobs", true),
    // rbac.authorization.k8s.io
    ("rbac.authorization.k8s.io", "ClusterRole", "clusterroles", false),
    (
        "rbac.authorization.k8s.io",
        "ClusterRoleBinding",
        "clusterrolebindings",
        false,
    ),
    ("rbac.authorization.k8s.io", "Role", "roles", true),
    ("rbac.authorization.k8s.io", "RoleBinding", "rolebindings", true),
    // apiextensions.k8s.io
    (
        "apiextensions.k8s.io",
        "CustomResourceDefinition",
        "customresourcedefinitions",
        false,
    ),
    // networking.k8s.io
    ("networking.k8s.io", "Ingress", "ingresses", true),
    ("networking.k8s.io", "NetworkPolicy", "networkpolicies", true),
    // policy
    ("policy", "PodDisruptionBudget", "poddisruptionbudgets", true),
    // storage.k8s.io
    ("storage.k8s.io", "StorageClass", "storageclasses", false),
    // scheduling.k8s.io
    ("scheduling.k8s.io", "PriorityClass", "priorityclasses", false),
    // coordination.k8s.io
    ("coordination.k8s.io", "Lease", "leases", true),
    // autoscaling
    ("autoscaling", "HorizontalPodAutoscaler", "horizontalpodautoscalers", true),
    // admissionregistration.k8s.io
    (
        "admissionregistration.k8s.io",
        "MutatingWebhookConfiguration",
        "mutatingwebhookconfigurations",
        false,
    ),
    (
        "admissionregistration.k8s.io",
        "ValidatingWebhookConfiguration",
        "validatingwebhookconfigurations",
        false,
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let mapper = BuiltinMapper::new();

        let mapping = mapper
            .map(&GroupVersionKind::new("", "v1", "Service"))
            .unwrap();
        assert_eq!(mapping.resource, "services");
        assert!(mapping.namespaced);

        let mapping = mapper
            .map(&GroupVersionKind::new(
                "rbac.authorization.k8s.io",
                "v1",
                "ClusterRole",
            ))
            .unwrap();
        assert!(!mapping.namespaced);
    }

    #[test]
    fn test_unknown_kind() {
        let mapper = BuiltinMapper::new();
        assert!(mapper
            .map(&GroupVersionKind::new("example.io", "v1", "Widget"))
            .is_none());
    }

    #[test]
    fn test_crd_declared_kind() {
        let mut mapper = BuiltinMapper::new();
        mapper.insert("example.io", "Widget", "widgets", true);
        let mapping = mapper
            .map(&GroupVersionKind::new("example.io", "v1", "Widget"))
            .unwrap();
        assert_eq!(mapping.resource, "widgets");
    }

    #[test]
    fn test_group_resource_display() {
        assert_eq!(GroupResource::new("", "services").to_string(), "services");
        assert_eq!(
            GroupResource::new("apps", "deployments").to_string(),
            "deployments.apps"
        );
    }
}
