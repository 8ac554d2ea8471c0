//! Point-in-time snapshot of cluster RBAC state.

use std::collections::BTreeMap;

use helion_api::{ClusterRole, ClusterRoleBinding, NamespacedName, Role, RoleBinding};

/// The cluster-side RBAC objects the evaluator replays against.
///
/// Built from the orchestrator's read-only lister; eventually consistent,
/// so callers re-evaluate on RBAC change events rather than caching
/// decisions.
#[derive(Debug, Clone, Default)]
pub struct RbacSnapshot {
    pub cluster_roles: BTreeMap<String, ClusterRole>,
    pub cluster_role_bindings: Vec<ClusterRoleBinding>,
    pub roles: BTreeMap<NamespacedName, Role>,
    pub role_bindings: Vec<RoleBinding>,
}

impl RbacSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cluster_role(mut self, role: ClusterRole) -> Self {
        self.cluster_roles.insert(role.name.clone(), role);
        self
    }

    pub fn with_cluster_role_binding(mut self, binding: ClusterRoleBinding) -> Self {
        self.cluster_role_bindings.push(binding);
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.insert(
            NamespacedName::new(role.namespace.clone(), role.name.clone()),
            role,
        );
        self
    }

    pub fn with_role_binding(mut self, binding: RoleBinding) -> Self {
        self.role_bindings.push(binding);
        self
    }

    /// Look up a namespaced role.
    pub fn role(&self, namespace: &str, name: &str) -> Option<&Role> {
        self.roles.get(&NamespacedName::new(namespace, name))
    }

    /// Look up a cluster role.
    pub fn cluster_role(&self, name: &str) -> Option<&ClusterRole> {
        self.cluster_roles.get(name)
    }
}
