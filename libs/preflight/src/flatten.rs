//! Schema flattening to dotted paths.

use std::collections::BTreeMap;

use crate::crd::SchemaNode;

/// A schema flattened to `dotted path → self-only node`.
///
/// Paths are rooted at `^`; properties append `.name` and array item
/// schemas append `[*]`.
pub type FlatSchema = BTreeMap<String, SchemaNode>;

/// Flatten a schema tree.
///
/// Every node is stored as a self-only copy: child changes are separate
/// entries, so diff application stays per-field and local.
pub fn flatten_schema(root: &SchemaNode) -> FlatSchema {
    let mut flat = FlatSchema::new();
    walk("^", root, &mut flat);
    flat
}

fn walk(path: &str, node: &SchemaNode, flat: &mut FlatSchema) {
    flat.insert(path.to_string(), node.self_only());
    for (name, child) in &node.properties {
        walk(&format!("{path}.{name}"), child, flat);
    }
    if let Some(items) = &node.items {
        walk(&format!("{path}[*]"), items, flat);
    }
}
