//! Core resource model for the helion extension lifecycle controller.
//!
//! This crate defines the typed resources the controller reads and writes:
//!
//! - **ClusterExtension**: the desired-state record naming an image source,
//!   an installer service account and an install namespace.
//! - **Revision**: an immutable, numbered snapshot of the objects to apply
//!   for one extension, split into probe-gated phases.
//! - **RBAC types**: the policy rule and role/binding shapes consumed by the
//!   pre-authorizer.
//!
//! The wire format is camelCase JSON, matching what the orchestrator serves.
//! Validation lives next to the types so admission and controller code share
//! one implementation.

mod error;
mod extension;
mod meta;
mod rbac;
mod revision;

pub use error::{ValidationError, ValidationErrors};
pub use extension::{
    AvailabilityMode, ClusterExtension, ClusterExtensionSpec, ClusterExtensionStatus, ExtensionUrls,
    ImageSource, ServiceAccountRef, SourceConfig, SourceType,
};
pub use meta::{
    condition_reasons, condition_types, find_condition, set_condition, Condition, ConditionStatus,
    GroupVersionKind, NamespacedName, OwnerReference,
};
pub use rbac::{
    subject_kinds, AggregationRule, ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding,
    RoleRef, Subject, UserInfo,
};
pub use revision::{
    AdoptionRecord, CollisionProtection, LifecycleState, ManagedObject, Phase,
    PreviousRevisionRef, Revision,
};

/// Validate that a string is a DNS label: lowercase alphanumerics and `-`,
/// starting and ending alphanumeric, at most 63 characters.
pub fn is_dns_label(s: &str) -> bool {
    if s.is_empty() || s.len() > 63 {
        return false;
    }
    let bytes = s.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes.iter().all(|&b| alnum(b) || b == b'-')
}
