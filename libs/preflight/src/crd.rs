//! CustomResourceDefinition model.
//!
//! Only the parts the preflight consumes are modeled; unknown schema
//! keywords are preserved in a flattened map so changes to them are still
//! visible to the diff engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A CustomResourceDefinition as decoded from a bundle or the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomResourceDefinition {
    pub metadata: CrdMetadata,
    pub spec: CrdSpec,
    #[serde(default)]
    pub status: CrdStatus,
}

impl CustomResourceDefinition {
    /// Decode from a raw manifest value.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    /// The served version entries, in declaration order.
    pub fn served_versions(&self) -> impl Iterator<Item = &CrdVersion> {
        self.spec.versions.iter().filter(|v| v.served)
    }

    /// Look up a version entry by name.
    pub fn version(&self, name: &str) -> Option<&CrdVersion> {
        self.spec.versions.iter().find(|v| v.name == name)
    }

    /// Whether a conversion webhook is declared.
    pub fn has_conversion_webhook(&self) -> bool {
        self.spec
            .conversion
            .as_ref()
            .is_some_and(|c| c.strategy == "Webhook")
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CrdMetadata {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdSpec {
    pub group: String,
    pub names: CrdNames,
    pub scope: CrdScope,
    #[serde(default)]
    pub versions: Vec<CrdVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion: Option<CrdConversion>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdNames {
    pub kind: String,
    pub plural: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub singular: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_kind: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrdScope {
    Namespaced,
    Cluster,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdVersion {
    pub name: String,
    #[serde(default)]
    pub served: bool,
    #[serde(default)]
    pub storage: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<CrdValidation>,
}

impl CrdVersion {
    /// The openAPIV3Schema root for this version, if declared.
    pub fn schema_root(&self) -> Option<&SchemaNode> {
        self.schema.as_ref().and_then(|s| s.open_api_v3_schema.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CrdValidation {
    #[serde(
        rename = "openAPIV3Schema",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub open_api_v3_schema: Option<SchemaNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdConversion {
    pub strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdStatus {
    #[serde(default)]
    pub stored_versions: Vec<String>,
}

/// A recursive JSON schema node carrying the validation keywords the
/// preflight classifies.
///
/// Keywords outside this set land in `extra` and surface as unclassifiable
/// diffs, which the engine refuses rather than assumes safe.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaNode {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,

    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_items: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_properties: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_properties: Option<i64>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, SchemaNode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<SchemaNode>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Keywords the preflight has no classifier for.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SchemaNode {
    /// A copy of this node with its children removed.
    ///
    /// Child changes are rediscovered through the flat map as separate diff
    /// entries, so per-field comparison stays local.
    pub fn self_only(&self) -> SchemaNode {
        let mut copy = self.clone();
        copy.properties = BTreeMap::new();
        copy.items = None;
        copy
    }
}
