//! RBAC API types consumed by the pre-authorizer.

use serde::{Deserialize, Serialize};

/// A single RBAC policy rule.
///
/// `*` is a wildcard in verbs, apiGroups, resources and resourceNames; an
/// empty `resourceNames` list means all names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    #[serde(default)]
    pub verbs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_names: Vec<String>,
    #[serde(
        rename = "nonResourceURLs",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub non_resource_urls: Vec<String>,
}

impl PolicyRule {
    /// A resource rule with all names.
    pub fn resource(
        verbs: &[&str],
        api_groups: &[&str],
        resources: &[&str],
    ) -> Self {
        Self {
            verbs: to_strings(verbs),
            api_groups: to_strings(api_groups),
            resources: to_strings(resources),
            ..Default::default()
        }
    }

    /// A rule over non-resource URL paths.
    pub fn non_resource(verbs: &[&str], urls: &[&str]) -> Self {
        Self {
            verbs: to_strings(verbs),
            non_resource_urls: to_strings(urls),
            ..Default::default()
        }
    }

    pub fn with_names(mut self, names: &[&str]) -> Self {
        self.resource_names = to_strings(names);
        self
    }

    /// Whether this rule names resources (as opposed to non-resource URLs).
    pub fn is_resource_rule(&self) -> bool {
        !self.resources.is_empty()
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// A namespaced role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// A cluster-scoped role, optionally aggregated from labelled roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRole {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_rule: Option<AggregationRule>,
}

/// Label selectors whose matching ClusterRoles are unioned into this one.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationRule {
    #[serde(default)]
    pub cluster_role_selectors: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// Reference from a binding to the role it grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRef {
    #[serde(default)]
    pub api_group: String,
    pub kind: String,
    pub name: String,
}

/// A subject granted a role by a binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub api_group: String,
}

pub mod subject_kinds {
    pub const USER: &str = "User";
    pub const GROUP: &str = "Group";
    pub const SERVICE_ACCOUNT: &str = "ServiceAccount";
}

/// A namespaced binding of subjects to a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleBinding {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub subjects: Vec<Subject>,
    pub role_ref: RoleRef,
}

/// A cluster-scoped binding of subjects to a ClusterRole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRoleBinding {
    pub name: String,
    #[serde(default)]
    pub subjects: Vec<Subject>,
    pub role_ref: RoleRef,
}

/// The authenticated identity an authorization decision is made for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl UserInfo {
    /// The identity of a service account, with its implied groups.
    pub fn service_account(namespace: &str, name: &str) -> Self {
        Self {
            username: format!("system:serviceaccount:{namespace}:{name}"),
            groups: vec![
                format!("system:serviceaccounts:{namespace}"),
                "system:serviceaccounts".to_string(),
                "system:authenticated".to_string(),
            ],
        }
    }

    /// Whether a binding subject matches this identity.
    pub fn matches_subject(&self, subject: &Subject) -> bool {
        match subject.kind.as_str() {
            subject_kinds::USER => subject.name == self.username,
            subject_kinds::GROUP => self.groups.iter().any(|g| g == &subject.name),
            subject_kinds::SERVICE_ACCOUNT => {
                self.username
                    == format!(
                        "system:serviceaccount:{}:{}",
                        subject.namespace, subject.name
                    )
            }
            _ => false,
        }
    }
}
