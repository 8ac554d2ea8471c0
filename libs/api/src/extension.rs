//! The ClusterExtension desired-state resource.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationErrors};
use crate::is_dns_label;
use crate::meta::Condition;

/// Desired state for one installed cluster extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterExtension {
    pub name: String,
    pub uid: String,
    /// Spec generation, bumped by the orchestrator on every spec change.
    #[serde(default)]
    pub generation: i64,
    pub spec: ClusterExtensionSpec,
    #[serde(default)]
    pub status: ClusterExtensionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterExtensionSpec {
    pub source: SourceConfig,
    #[serde(default)]
    pub availability_mode: AvailabilityMode,
    /// Higher priority wins ties when multiple extensions provide the same
    /// content.
    #[serde(default)]
    pub priority: i32,
    /// Install namespace for namespaced objects in the bundle.
    pub namespace: String,
    pub service_account: ServiceAccountRef,
    /// Optional inline configuration, validated against the bundle-declared
    /// JSON schema before any rollout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    /// Rollout deadline in minutes, clamped to [10, 720].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_deadline_minutes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    #[serde(rename = "sourceType", default)]
    pub source_type: SourceType,
    pub image: ImageSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SourceType {
    #[default]
    Image,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    /// Image reference: `domain[:port]/name[@algo:hex | :tag]`.
    #[serde(rename = "ref")]
    pub reference: String,
    /// Minutes between re-resolving a tagged reference. Forbidden for
    /// digest-pinned references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_minutes: Option<u32>,
}

impl ImageSource {
    /// Whether the reference pins a digest (`name@algo:hex`).
    pub fn is_digest_pinned(&self) -> bool {
        self.reference.contains('@')
    }
}

/// Whether the extension's contents are served and rolled out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AvailabilityMode {
    #[default]
    Available,
    /// Behave as if the extension did not exist: contents not served, no
    /// rollout progression.
    Unavailable,
}

/// The installer principal objects are created as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterExtensionStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Digest-pinned form of the spec reference once resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_unpacked: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<ExtensionUrls>,
}

/// Cluster-internal URLs where the extension's contents are served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionUrls {
    /// Base URL serving `/api/v1/all`.
    pub base: String,
}

impl ClusterExtensionSpec {
    /// Admission-time validation. All problems are reported together.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = Vec::new();

        if self.source.image.reference.is_empty() {
            errors.push(ValidationError::required("spec.source.image.ref"));
        }
        if let Some(interval) = self.source.image.poll_interval_minutes {
            if interval < 1 {
                errors.push(ValidationError::invalid(
                    "spec.source.image.pollIntervalMinutes",
                    "must be at least 1",
                ));
            }
            if self.source.image.is_digest_pinned() {
                errors.push(ValidationError::forbidden(
                    "spec.source.image.pollIntervalMinutes",
                    "cannot poll a digest-pinned reference",
                ));
            }
        }
        if self.namespace.is_empty() {
            errors.push(ValidationError::required("spec.namespace"));
        } else if !is_dns_label(&self.namespace) {
            errors.push(ValidationError::invalid(
                "spec.namespace",
                "must be a DNS label",
            ));
        }
        if self.service_account.name.is_empty() {
            errors.push(ValidationError::required("spec.serviceAccount.name"));
        }
        if let Some(deadline) = self.progress_deadline_minutes {
            if !(10..=720).contains(&deadline) {
                errors.push(ValidationError::invalid(
                    "spec.progressDeadlineMinutes",
                    "must be between 10 and 720",
                ));
            }
        }

        ValidationErrors::into_result(errors)
    }
}

impl ClusterExtension {
    /// The installer principal's username on the orchestrator.
    pub fn installer_username(&self) -> String {
        format!(
            "system:serviceaccount:{}:{}",
            self.spec.namespace, self.spec.service_account.name
        )
    }
}
