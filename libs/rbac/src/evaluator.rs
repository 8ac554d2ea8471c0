//! Pure RBAC authorization evaluator.

use helion_api::{PolicyRule, RoleRef, UserInfo};

use crate::rules::{rule_matches, Attributes};
use crate::snapshot::RbacSnapshot;

/// Replays the orchestrator's RBAC decision process over a snapshot.
pub struct Evaluator<'a> {
    snapshot: &'a RbacSnapshot,
}

impl<'a> Evaluator<'a> {
    pub fn new(snapshot: &'a RbacSnapshot) -> Self {
        Self { snapshot }
    }

    /// The rules effective for a user within a namespace.
    ///
    /// Cluster role bindings apply everywhere; role bindings contribute only
    /// within their own namespace. The cluster scope is the empty namespace.
    pub fn effective_rules(&self, user: &UserInfo, namespace: &str) -> Vec<PolicyRule> {
        let mut rules = Vec::new();

        for binding in &self.snapshot.cluster_role_bindings {
            if !binding.subjects.iter().any(|s| user.matches_subject(s)) {
                continue;
            }
            if let Some(role) = self.snapshot.cluster_role(&binding.role_ref.name) {
                rules.extend(role.rules.iter().cloned());
            }
        }

        if !namespace.is_empty() {
            for binding in &self.snapshot.role_bindings {
                if binding.namespace != namespace {
                    continue;
                }
                if !binding.subjects.iter().any(|s| user.matches_subject(s)) {
                    continue;
                }
                rules.extend(self.resolve_role_ref(&binding.role_ref, namespace));
            }
        }

        rules
    }

    /// Resolve a binding's role reference to its rules.
    pub fn resolve_role_ref(&self, role_ref: &RoleRef, namespace: &str) -> Vec<PolicyRule> {
        match role_ref.kind.as_str() {
            "ClusterRole" => self
                .snapshot
                .cluster_role(&role_ref.name)
                .map(|r| r.rules.clone())
                .unwrap_or_default(),
            "Role" => self
                .snapshot
                .role(namespace, &role_ref.name)
                .map(|r| r.rules.clone())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Decide one request: `true` iff some effective rule covers it.
    pub fn authorize(&self, user: &UserInfo, attrs: &Attributes) -> bool {
        self.effective_rules(user, &attrs.namespace)
            .iter()
            .any(|rule| rule_matches(rule, attrs))
    }
}
