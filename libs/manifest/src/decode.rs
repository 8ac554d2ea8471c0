//! Decoding of concatenated YAML/JSON document streams.

use std::collections::BTreeMap;

use helion_api::{
    ClusterRole, ClusterRoleBinding, GroupVersionKind, NamespacedName, PolicyRule, Role,
    RoleBinding, RoleRef, Subject,
};
use thiserror::Error;

use crate::mapper::{BuiltinMapper, GroupResource, ResourceMapper};
use crate::object::ManifestObject;

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";
const APIEXTENSIONS_GROUP: &str = "apiextensions.k8s.io";

/// One problem found while decoding, tagged with the entry index.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("entry {index}: parse error: {source}")]
    Parse {
        index: usize,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("entry {index}: not a JSON-compatible object: {message}")]
    Convert { index: usize, message: String },

    #[error("entry {index}: missing field {field}")]
    MissingField { index: usize, field: &'static str },

    #[error("entry {index}: no resource mapping for {gvk}")]
    UnmappedKind { index: usize, gvk: GroupVersionKind },

    #[error("entry {index}: malformed {kind}: {source}")]
    Rbac {
        index: usize,
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// All decode problems for one stream, reported together.
#[derive(Debug, Error)]
#[error("{}", join_errors(.0))]
pub struct DecodeErrors(pub Vec<DecodeError>);

fn join_errors(errors: &[DecodeError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Decoding options.
#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    /// Namespace injected into namespaced entries that do not carry one.
    pub default_namespace: String,
}

/// The typed result of decoding a bundle manifest.
#[derive(Debug, Default)]
pub struct ObjectSet {
    /// All decoded objects, in stream order.
    pub objects: Vec<ManifestObject>,
    /// RBAC objects by key, for escalation checks.
    pub cluster_roles: BTreeMap<String, ClusterRole>,
    pub cluster_role_bindings: BTreeMap<String, ClusterRoleBinding>,
    pub roles: BTreeMap<NamespacedName, Role>,
    pub role_bindings: BTreeMap<NamespacedName, RoleBinding>,
    /// Resource → object names, for authorization attribute generation.
    pub resources: BTreeMap<GroupResource, Vec<NamespacedName>>,
}

/// Decode a concatenated YAML/JSON stream into an [`ObjectSet`].
///
/// All problems are accumulated and returned together; a stream either
/// decodes completely or reports every defect at once.
pub fn decode_manifest(stream: &str, options: &DecodeOptions) -> Result<ObjectSet, DecodeErrors> {
    let mut errors = Vec::new();
    let mut entries = Vec::new();

    for (index, document) in serde_yaml::Deserializer::from_str(stream).enumerate() {
        let value: serde_yaml::Value = match serde::Deserialize::deserialize(document) {
            Ok(v) => v,
            Err(source) => {
                errors.push(DecodeError::Parse { index, source });
                continue;
            }
        };
        if matches!(value, serde_yaml::Value::Null) {
            continue;
        }
        match serde_json::to_value(&value) {
            Ok(json) => entries.push((index, json)),
            Err(e) => errors.push(DecodeError::Convert {
                index,
                message: e.to_string(),
            }),
        }
    }

    // CustomResourceDefinitions in the stream may declare kinds used later
    // in the same stream, so the mapper learns them before the main pass.
    let mut mapper = BuiltinMapper::new();
    for (_, json) in &entries {
        register_crd_kind(&mut mapper, json);
    }

    let mut set = ObjectSet::default();
    for (index, json) in entries {
        match decode_entry(index, json, &mapper, options) {
            Ok(object) => {
                set.resources
                    .entry(GroupResource::new(
                        object.gvk().group.clone(),
                        object.resource(),
                    ))
                    .or_default()
                    .push(object.id().clone());
                if let Err(e) = lift_rbac(index, &object, &mut set) {
                    errors.push(e);
                }
                set.objects.push(object);
            }
            Err(e) => errors.push(e),
        }
    }

    for names in set.resources.values_mut() {
        names.sort();
        names.dedup();
    }

    if errors.is_empty() {
        Ok(set)
    } else {
        Err(DecodeErrors(errors))
    }
}

fn decode_entry(
    index: usize,
    mut json: serde_json::Value,
    mapper: &dyn ResourceMapper,
    options: &DecodeOptions,
) -> Result<ManifestObject, DecodeError> {
    let api_version = json
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or(DecodeError::MissingField {
            index,
            field: "apiVersion",
        })?
        .to_string();
    let kind = json
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or(DecodeError::MissingField {
            index,
            field: "kind",
        })?
        .to_string();
    let name = json
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .ok_or(DecodeError::MissingField {
            index,
            field: "metadata.name",
        })?
        .to_string();

    let gvk = GroupVersionKind::from_api_version(&api_version, kind);
    let mapping = mapper
        .map(&gvk)
        .ok_or_else(|| DecodeError::UnmappedKind {
            index,
            gvk: gvk.clone(),
        })?;

    let namespace = if mapping.namespaced {
        let declared = json
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        if declared.is_empty() {
            // Inject the install namespace so downstream apply sees a
            // complete object.
            if !options.default_namespace.is_empty() {
                if let Some(metadata) = json.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                    metadata.insert(
                        "namespace".to_string(),
                        serde_json::Value::String(options.default_namespace.clone()),
                    );
                }
            }
            options.default_namespace.clone()
        } else {
            declared
        }
    } else {
        String::new()
    };

    Ok(ManifestObject::new(
        gvk,
        NamespacedName::new(namespace, name),
        mapping.resource,
        mapping.namespaced,
        json,
    ))
}

/// Lift RBAC-typed entries into their API shapes.
fn lift_rbac(
    index: usize,
    object: &ManifestObject,
    set: &mut ObjectSet,
) -> Result<(), DecodeError> {
    if object.gvk().group != RBAC_GROUP {
        return Ok(());
    }
    let value = object.value();
    let rbac_err = |kind: &str, source: serde_json::Error| DecodeError::Rbac {
        index,
        kind: kind.to_string(),
        source,
    };

    match object.kind() {
        "Role" => {
            let rules: Vec<PolicyRule> = parse_field(value, "rules").map_err(|e| rbac_err("Role", e))?;
            set.roles.insert(
                object.id().clone(),
                Role {
                    namespace: object.namespace().to_string(),
                    name: object.name().to_string(),
                    rules,
                },
            );
        }
        "ClusterRole" => {
            let rules: Vec<PolicyRule> =
                parse_field(value, "rules").map_err(|e| rbac_err("ClusterRole", e))?;
            let aggregation_rule = match value.get("aggregationRule") {
                Some(v) if !v.is_null() => Some(
                    serde_json::from_value(v.clone()).map_err(|e| rbac_err("ClusterRole", e))?,
                ),
                _ => None,
            };
            set.cluster_roles.insert(
                object.name().to_string(),
                ClusterRole {
                    name: object.name().to_string(),
                    rules,
                    aggregation_rule,
                },
            );
        }
        "RoleBinding" => {
            let subjects: Vec<Subject> =
                parse_field(value, "subjects").map_err(|e| rbac_err("RoleBinding", e))?;
            let role_ref: RoleRef = parse_required(value, "roleRef", index)?;
            set.role_bindings.insert(
                object.id().clone(),
                RoleBinding {
                    namespace: object.namespace().to_string(),
                    name: object.name().to_string(),
                    subjects,
                    role_ref,
                },
            );
        }
        "ClusterRoleBinding" => {
            let subjects: Vec<Subject> =
                parse_field(value, "subjects").map_err(|e| rbac_err("ClusterRoleBinding", e))?;
            let role_ref: RoleRef = parse_required(value, "roleRef", index)?;
            set.cluster_role_bindings.insert(
                object.name().to_string(),
                ClusterRoleBinding {
                    name: object.name().to_string(),
                    subjects,
                    role_ref,
                },
            );
        }
        _ => {}
    }
    Ok(())
}

/// Parse an optional array field, treating absence as empty.
fn parse_field<T: serde::de::DeserializeOwned + Default>(
    value: &serde_json::Value,
    field: &str,
) -> Result<T, serde_json::Error> {
    match value.get(field) {
        Some(v) if !v.is_null() => serde_json::from_value(v.clone()),
        _ => Ok(T::default()),
    }
}

fn parse_required<T: serde::de::DeserializeOwned>(
    value: &serde_json::Value,
    field: &'static str,
    index: usize,
) -> Result<T, DecodeError> {
    let v = value.get(field).ok_or(DecodeError::MissingField { index, field })?;
    serde_json::from_value(v.clone()).map_err(|source| DecodeError::Rbac {
        index,
        kind: field.to_string(),
        source,
    })
}

/// Register a kind declared by a CustomResourceDefinition entry.
fn register_crd_kind(mapper: &mut BuiltinMapper, json: &serde_json::Value) {
    let is_crd = json
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .is_some_and(|v| v.starts_with(APIEXTENSIONS_GROUP))
        && json.get("kind").and_then(|v| v.as_str()) == Some("CustomResourceDefinition");
    if !is_crd {
        return;
    }
    let (Some(group), Some(kind), Some(plural)) = (
        json.pointer("/spec/group").and_then(|v| v.as_str()),
        json.pointer("/spec/names/kind").and_then(|v| v.as_str()),
        json.pointer("/spec/names/plural").and_then(|v| v.as_str()),
    ) else {
        return;
    };
    let namespaced = json
        .pointer("/spec/scope")
        .and_then(|v| v.as_str())
        .unwrap_or("Namespaced")
        == "Namespaced";
    mapper.insert(group, kind, plural, namespaced);
}
