//! Bundle manifest decoding.
//!
//! Parses a concatenated YAML/JSON document stream into a typed
//! [`ObjectSet`]: every entry gains a group/version/kind, a namespaced name
//! and a computed resource plural; RBAC-typed entries are additionally
//! lifted into their API shapes for the pre-authorizer.
//!
//! Decoding never stops at the first problem: every malformed entry is
//! accumulated with its index and the whole batch is reported at once.

mod decode;
mod mapper;
mod object;

pub use decode::{decode_manifest, DecodeError, DecodeErrors, DecodeOptions, ObjectSet};
pub use mapper::{BuiltinMapper, GroupResource, ResourceMapper, ResourceMapping};
pub use object::ManifestObject;
