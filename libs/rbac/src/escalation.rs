//! Privilege escalation checks over manifest RBAC objects.
//!
//! An installer may only create roles granting rights it already holds, and
//! may only bind roles it could bind or fully cover. Violations are
//! collected, never short-circuited, so one reconcile reports every
//! offending object.

use helion_api::{NamespacedName, PolicyRule, UserInfo};
use helion_manifest::ObjectSet;
use thiserror::Error;

use crate::evaluator::Evaluator;
use crate::message::format_escalation;
use crate::rules::{covers, Attributes};
use crate::snapshot::RbacSnapshot;

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

/// One escalation violation, carrying the wire-format message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind} {id}: {message}")]
pub struct EscalationError {
    /// The offending object's kind.
    pub kind: &'static str,
    pub id: NamespacedName,
    /// Formatted escalation text naming the missing rules.
    pub message: String,
}

/// Check every RBAC object in the manifest for privilege escalation.
pub fn check_escalations(
    snapshot: &RbacSnapshot,
    user: &UserInfo,
    manifest: &ObjectSet,
) -> Vec<EscalationError> {
    let evaluator = Evaluator::new(snapshot);
    let mut errors = Vec::new();

    for (id, role) in &manifest.roles {
        let effective = evaluator.effective_rules(user, &role.namespace);
        let (ok, missing) = covers(&effective, &role.rules);
        if ok || can_escalate(&evaluator, user, &role.namespace, "roles", &role.name) {
            continue;
        }
        errors.push(EscalationError {
            kind: "Role",
            id: id.clone(),
            message: format_escalation(user, &missing),
        });
    }

    for (name, role) in &manifest.cluster_roles {
        let effective = evaluator.effective_rules(user, "");
        // Aggregated roles pull in arbitrary labelled rules, so creating
        // one requires unrestricted authority.
        let wanted: Vec<PolicyRule> = if role.aggregation_rule.is_some() {
            vec![PolicyRule::resource(&["*"], &["*"], &["*"])]
        } else {
            role.rules.clone()
        };
        let (ok, missing) = covers(&effective, &wanted);
        if ok || can_escalate(&evaluator, user, "", "clusterroles", name) {
            continue;
        }
        errors.push(EscalationError {
            kind: "ClusterRole",
            id: NamespacedName::cluster(name.clone()),
            message: format_escalation(user, &missing),
        });
    }

    for (id, binding) in &manifest.role_bindings {
        let bind_resource = match binding.role_ref.kind.as_str() {
            "Role" => "roles",
            _ => "clusterroles",
        };
        if can_bind(
            &evaluator,
            user,
            &binding.namespace,
            bind_resource,
            &binding.role_ref.name,
        ) {
            continue;
        }
        let resolved = resolve_with_manifest(
            snapshot,
            manifest,
            &binding.role_ref.kind,
            &binding.role_ref.name,
            &binding.namespace,
        );
        let effective = evaluator.effective_rules(user, &binding.namespace);
        let (ok, missing) = covers(&effective, &resolved);
        if ok {
            continue;
        }
        errors.push(EscalationError {
            kind: "RoleBinding",
            id: id.clone(),
            message: format_escalation(user, &missing),
        });
    }

    for (name, binding) in &manifest.cluster_role_bindings {
        if can_bind(&evaluator, user, "", "clusterroles", &binding.role_ref.name) {
            continue;
        }
        let resolved = resolve_with_manifest(
            snapshot,
            manifest,
            &binding.role_ref.kind,
            &binding.role_ref.name,
            "",
        );
        let effective = evaluator.effective_rules(user, "");
        let (ok, missing) = covers(&effective, &resolved);
        if ok {
            continue;
        }
        errors.push(EscalationError {
            kind: "ClusterRoleBinding",
            id: NamespacedName::cluster(name.clone()),
            message: format_escalation(user, &missing),
        });
    }

    errors
}

fn can_escalate(
    evaluator: &Evaluator<'_>,
    user: &UserInfo,
    namespace: &str,
    resource: &str,
    name: &str,
) -> bool {
    evaluator.authorize(
        user,
        &Attributes::new(namespace, "escalate", RBAC_GROUP, resource, name),
    )
}

fn can_bind(
    evaluator: &Evaluator<'_>,
    user: &UserInfo,
    namespace: &str,
    resource: &str,
    name: &str,
) -> bool {
    evaluator.authorize(
        user,
        &Attributes::new(namespace, "bind", RBAC_GROUP, resource, name),
    )
}

/// Resolve a role reference against the cluster snapshot, appending rules
/// from a same-manifest definition of the referenced role.
fn resolve_with_manifest(
    snapshot: &RbacSnapshot,
    manifest: &ObjectSet,
    kind: &str,
    name: &str,
    namespace: &str,
) -> Vec<PolicyRule> {
    let mut rules = Vec::new();
    match kind {
        "Role" => {
            if let Some(role) = snapshot.role(namespace, name) {
                rules.extend(role.rules.iter().cloned());
            }
            if let Some(role) = manifest.roles.get(&NamespacedName::new(namespace, name)) {
                rules.extend(role.rules.iter().cloned());
            }
        }
        "ClusterRole" => {
            if let Some(role) = snapshot.cluster_role(name) {
                rules.extend(role.rules.iter().cloned());
            }
            if let Some(role) = manifest.cluster_roles.get(name) {
                rules.extend(role.rules.iter().cloned());
            }
        }
        _ => {}
    }
    rules
}
