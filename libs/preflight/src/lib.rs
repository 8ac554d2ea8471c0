//! CRD upgrade-safety preflight.
//!
//! Before a bundle's CustomResourceDefinitions are applied over existing
//! ones, this crate decides whether the schema change could break stored
//! objects. Two cooperating pieces do the work:
//!
//! - a **flattener** that keys every schema node by a dotted path rooted at
//!   `^` (e.g. `^.spec.foo`), retaining a self-only copy of each node so
//!   child changes surface as separate entries;
//! - a chain of **per-field validators**, each consuming exactly one
//!   validation keyword of a diff and classifying its direction of change.
//!
//! Any residual difference no validator consumes is refused outright: the
//! engine never guesses that an unknown change is safe.

mod checks;
mod crd;
mod diff;
mod flatten;
mod upgrade;
mod version;

pub use checks::{validate_field_diff, SafetyError};
pub use crd::{
    CrdConversion, CrdMetadata, CrdNames, CrdScope, CrdSpec, CrdStatus, CrdValidation, CrdVersion,
    CustomResourceDefinition, SchemaNode,
};
pub use diff::{diff_schemas, removed_paths, FieldDiff};
pub use flatten::{flatten_schema, FlatSchema};
pub use upgrade::{validate_upgrade, UpgradeError, UpgradeErrors};
pub use version::compare_kube_versions;
