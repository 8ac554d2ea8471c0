//! Per-field schema diffing over flattened schemas.

use crate::crd::SchemaNode;
use crate::flatten::FlatSchema;

/// A pair of self-only schema nodes that differ at the same path.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDiff {
    pub path: String,
    pub old: SchemaNode,
    pub new: SchemaNode,
}

/// Paths present in both schemas whose self-only nodes differ.
pub fn diff_schemas(old: &FlatSchema, new: &FlatSchema) -> Vec<FieldDiff> {
    let mut diffs = Vec::new();
    for (path, old_node) in old {
        let Some(new_node) = new.get(path) else {
            continue;
        };
        if old_node != new_node {
            diffs.push(FieldDiff {
                path: path.clone(),
                old: old_node.clone(),
                new: new_node.clone(),
            });
        }
    }
    diffs
}

/// Paths present in the old schema but absent from the new one.
pub fn removed_paths(old: &FlatSchema, new: &FlatSchema) -> Vec<String> {
    old.keys()
        .filter(|path| !new.contains_key(*path))
        .cloned()
        .collect()
}
