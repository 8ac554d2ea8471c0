//! Immutable revision snapshots of an extension's object set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationErrors};
use crate::is_dns_label;
use crate::meta::Condition;

/// A numbered snapshot of the desired object set for one extension.
///
/// Revisions are created by the controller when the desired-state
/// fingerprint changes and are immutable once cut: the number never moves,
/// phases may be set exactly once, and `Active → Archived` is one-way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub name: String,
    pub uid: String,
    /// Monotone revision number, starting at 1.
    pub revision: i64,
    /// Fingerprint of the rendered object set this revision was cut from.
    #[serde(default)]
    pub spec_hash: String,
    #[serde(default)]
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub lifecycle_state: LifecycleState,
    /// Link to the revision this one supersedes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<PreviousRevisionRef>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Objects taken over from an earlier revision during rollout.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adoption_log: Vec<AdoptionRecord>,
}

/// Reference to the superseded revision, resolved by lookup rather than
/// ownership so archived revisions can be deleted independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviousRevisionRef {
    pub name: String,
    pub uid: String,
}

/// An ordered bag of objects applied together and probe-gated as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    /// DNS label, at most 63 characters.
    pub name: String,
    #[serde(default)]
    pub objects: Vec<ManagedObject>,
}

/// One object within a phase, with its collision policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedObject {
    /// The embedded resource, as decoded from the bundle.
    pub object: serde_json::Value,
    #[serde(default)]
    pub collision_protection: CollisionProtection,
}

/// Policy governing whether the engine may touch objects it did not create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CollisionProtection {
    /// Never modify an object this engine did not create.
    #[default]
    Prevent,
    /// Adopt objects that have no other controlling owner.
    IfNoController,
    /// Adopt unconditionally. Hazardous.
    None,
}

/// Revision lifecycle. `Archived` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LifecycleState {
    #[default]
    Active,
    Archived,
}

/// A record of ownership taken over from an earlier revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdoptionRecord {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    /// Name of the revision that owned the object before.
    pub previous_revision: String,
}

impl Revision {
    /// Creation-time validation.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = Vec::new();

        if self.revision < 1 {
            errors.push(ValidationError::invalid(
                "revision",
                "must be at least 1",
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for (i, phase) in self.phases.iter().enumerate() {
            if !is_dns_label(&phase.name) {
                errors.push(ValidationError::invalid(
                    format!("phases[{i}].name"),
                    "must be a DNS label of at most 63 characters",
                ));
            }
            if !seen.insert(phase.name.as_str()) {
                errors.push(ValidationError::invalid(
                    format!("phases[{i}].name"),
                    "duplicate phase name",
                ));
            }
        }

        ValidationErrors::into_result(errors)
    }

    /// Update-time validation against the stored copy.
    ///
    /// The revision number is immutable; phases may transition empty →
    /// non-empty exactly once and are frozen afterwards; archival is
    /// one-way.
    pub fn validate_update(old: &Revision, new: &Revision) -> Result<(), ValidationErrors> {
        let mut errors = Vec::new();

        if new.revision != old.revision {
            errors.push(ValidationError::immutable("revision"));
        }
        if !old.phases.is_empty() && new.phases != old.phases {
            errors.push(ValidationError::immutable("phases"));
        }
        if old.lifecycle_state == LifecycleState::Archived
            && new.lifecycle_state == LifecycleState::Active
        {
            errors.push(ValidationError::invalid(
                "lifecycleState",
                "archived revisions cannot be un-archived",
            ));
        }

        match new.validate() {
            Ok(()) => {}
            Err(more) => errors.extend(more.0),
        }
        ValidationErrors::into_result(errors)
    }

    pub fn is_archived(&self) -> bool {
        self.lifecycle_state == LifecycleState::Archived
    }
}
