//! Revision rendering: fingerprinting and phase planning.
//!
//! Decoded objects are partitioned into a fixed phase order so that
//! prerequisites (namespaces, RBAC, CRDs) are applied and probed before the
//! workloads that need them. The fingerprint over the rendered set decides
//! whether a new revision must be cut.

use chrono::Utc;
use helion_api::{
    CollisionProtection, ManagedObject, Phase, PreviousRevisionRef, Revision,
};
use helion_manifest::ObjectSet;
use helion_reconcile::SpecHash;

/// Phase names, in apply order.
const PHASE_ORDER: &[&str] = &[
    "namespaces",
    "policies",
    "rbac",
    "crds",
    "storage",
    "deploy",
    "publish",
];

fn phase_of(kind: &str) -> &'static str {
    match kind {
        "Namespace" => "namespaces",
        "NetworkPolicy" | "ResourceQuota" | "LimitRange" | "PriorityClass" => "policies",
        "ServiceAccount" | "Role" | "RoleBinding" | "ClusterRole" | "ClusterRoleBinding" => "rbac",
        "CustomResourceDefinition" => "crds",
        "PersistentVolume" | "PersistentVolumeClaim" | "StorageClass" => "storage",
        "Service" | "Ingress" | "MutatingWebhookConfiguration"
        | "ValidatingWebhookConfiguration" => "publish",
        _ => "deploy",
    }
}

/// Fingerprint the rendered install: object set plus install parameters.
pub fn fingerprint(set: &ObjectSet, config: Option<&serde_json::Value>) -> SpecHash {
    let mut values: Vec<serde_json::Value> =
        set.objects.iter().map(|o| o.value().clone()).collect();
    if let Some(config) = config {
        values.push(serde_json::json!({"__config": config}));
    }
    SpecHash::from_values(values.iter())
}

/// Render the next revision for an extension from its decoded object set.
///
/// The revision number is always previous + 1; the previous revision is
/// linked by (name, uid) for lookup-based resolution.
pub fn render_revision(
    extension_name: &str,
    extension_uid: &str,
    set: &ObjectSet,
    spec_hash: &SpecHash,
    previous: Option<&Revision>,
    collision_protection: CollisionProtection,
) -> Revision {
    let number = previous.map(|p| p.revision + 1).unwrap_or(1);

    let mut phases: Vec<Phase> = PHASE_ORDER
        .iter()
        .map(|name| Phase {
            name: (*name).to_string(),
            objects: Vec::new(),
        })
        .collect();

    for object in &set.objects {
        let phase_name = phase_of(object.kind());
        let phase = phases
            .iter_mut()
            .find(|p| p.name == phase_name)
            .expect("phase order covers every class");
        phase.objects.push(ManagedObject {
            object: object.value().clone(),
            collision_protection,
        });
    }
    phases.retain(|p| !p.objects.is_empty());

    Revision {
        name: format!("{extension_name}-{number}"),
        uid: format!("{extension_uid}-{number}"),
        revision: number,
        spec_hash: spec_hash.to_string(),
        phases,
        lifecycle_state: Default::default(),
        previous: previous.map(|p| PreviousRevisionRef {
            name: p.name.clone(),
            uid: p.uid.clone(),
        }),
        created_at: Utc::now(),
        conditions: Vec::new(),
        adoption_log: Vec::new(),
    }
}
