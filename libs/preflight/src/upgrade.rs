//! CRD-level upgrade validation.

use thiserror::Error;

use crate::checks::{validate_field_diff, SafetyError};
use crate::crd::{CrdScope, CrdVersion, CustomResourceDefinition};
use crate::diff::{diff_schemas, removed_paths};
use crate::flatten::{flatten_schema, FlatSchema};
use crate::version::compare_kube_versions;

/// One upgrade-safety violation. All are terminal: the spec must change
/// before a retry can succeed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpgradeError {
    #[error("scope changed from {old:?} to {new:?}")]
    ScopeChanged { old: CrdScope, new: CrdScope },

    #[error("stored version {version} is no longer served")]
    StoredVersionRemoved { version: String },

    #[error("version {version}: field {path} in existing not found in new")]
    FieldRemoved { version: String, path: String },

    #[error("version {version}: {source}")]
    UnsafeChange {
        version: String,
        source: SafetyError,
    },

    #[error("served versions {older} and {newer} diverge: {message}")]
    ServedVersionDrift {
        older: String,
        newer: String,
        message: String,
    },
}

/// All violations for one CRD upgrade, reported together.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{}", join_errors(.0))]
pub struct UpgradeErrors(pub Vec<UpgradeError>);

fn join_errors(errors: &[UpgradeError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Validate that replacing `old` with `new` cannot break stored objects.
///
/// Violations are accumulated across every rule and version pair; the
/// caller gets the full picture in one pass.
pub fn validate_upgrade(
    old: &CustomResourceDefinition,
    new: &CustomResourceDefinition,
) -> Result<(), UpgradeErrors> {
    let mut errors = Vec::new();

    if old.spec.scope != new.spec.scope {
        errors.push(UpgradeError::ScopeChanged {
            old: old.spec.scope,
            new: new.spec.scope,
        });
    }

    // Every version holding stored objects must remain served.
    for version in &old.status.stored_versions {
        let still_served = new.version(version).is_some_and(|v| v.served);
        if !still_served {
            errors.push(UpgradeError::StoredVersionRemoved {
                version: version.clone(),
            });
        }
    }

    // Shared versions: no existing field removed, per-field diffs classified.
    for old_version in &old.spec.versions {
        let Some(new_version) = new.version(&old_version.name) else {
            continue;
        };
        let old_flat = flat_of(old_version);
        let new_flat = flat_of(new_version);

        for path in removed_paths(&old_flat, &new_flat) {
            errors.push(UpgradeError::FieldRemoved {
                version: old_version.name.clone(),
                path,
            });
        }
        for diff in diff_schemas(&old_flat, &new_flat) {
            for source in validate_field_diff(&diff) {
                errors.push(UpgradeError::UnsafeChange {
                    version: old_version.name.clone(),
                    source,
                });
            }
        }
    }

    // Without a conversion webhook the apiserver serves every version from
    // the same stored object, so served versions may not drift apart.
    if !new.has_conversion_webhook() {
        let mut served: Vec<&CrdVersion> = new.served_versions().collect();
        served.sort_by(|a, b| compare_kube_versions(&a.name, &b.name));

        for i in 0..served.len() {
            for j in (i + 1)..served.len() {
                let (older, newer) = (served[i], served[j]);
                check_served_pair(older, newer, &mut errors);
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(UpgradeErrors(errors))
    }
}

/// Flatten a version's schema; schema-less versions flatten to nothing, so
/// any counterpart schema registers wholesale as drift or removal.
fn flat_of(version: &CrdVersion) -> FlatSchema {
    match version.schema_root() {
        Some(root) => flatten_schema(root),
        None => FlatSchema::new(),
    }
}

fn check_served_pair(older: &CrdVersion, newer: &CrdVersion, errors: &mut Vec<UpgradeError>) {
    let older_flat = flat_of(older);
    let newer_flat = flat_of(newer);

    for path in removed_paths(&older_flat, &newer_flat) {
        errors.push(UpgradeError::ServedVersionDrift {
            older: older.name.clone(),
            newer: newer.name.clone(),
            message: format!("field {path} only exists in {}", older.name),
        });
    }
    for path in removed_paths(&newer_flat, &older_flat) {
        errors.push(UpgradeError::ServedVersionDrift {
            older: older.name.clone(),
            newer: newer.name.clone(),
            message: format!("field {path} only exists in {}", newer.name),
        });
    }
    for diff in diff_schemas(&older_flat, &newer_flat) {
        for source in validate_field_diff(&diff) {
            errors.push(UpgradeError::ServedVersionDrift {
                older: older.name.clone(),
                newer: newer.name.clone(),
                message: source.to_string(),
            });
        }
    }
}
