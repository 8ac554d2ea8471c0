//! Missing-rule computation for a proposed manifest.

use std::collections::{BTreeMap, BTreeSet};

use helion_api::{PolicyRule, UserInfo};
use helion_manifest::ObjectSet;

use crate::escalation::{check_escalations, EscalationError};
use crate::evaluator::Evaluator;
use crate::message::parse_escalation;
use crate::rules::Attributes;
use crate::snapshot::RbacSnapshot;

/// Verbs checked per named object.
const OBJECT_VERBS: &[&str] = &["get", "patch", "update", "delete"];

/// Verbs checked per resource collection; these attributes carry no name.
const COLLECTION_VERBS: &[&str] = &["list", "watch", "create"];

/// The rules to add within one namespace; cluster scope is the empty
/// namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedPolicyRules {
    pub namespace: String,
    pub rules: Vec<PolicyRule>,
}

/// The full pre-authorization result: the missing-rule report and every
/// escalation violation, always returned together so operators see the
/// complete picture in one reconcile.
#[derive(Debug, Clone, Default)]
pub struct PreAuthOutcome {
    pub missing: Vec<ScopedPolicyRules>,
    pub escalations: Vec<EscalationError>,
}

impl PreAuthOutcome {
    pub fn is_authorized(&self) -> bool {
        self.missing.is_empty() && self.escalations.is_empty()
    }

    /// Scoped rules for one namespace, if any are missing there.
    pub fn missing_in(&self, namespace: &str) -> Option<&ScopedPolicyRules> {
        self.missing.iter().find(|s| s.namespace == namespace)
    }

    /// A single aggregated error string, or `None` when authorized.
    pub fn aggregated_error(&self) -> Option<String> {
        if self.is_authorized() {
            return None;
        }
        let mut parts = Vec::new();
        for scope in &self.missing {
            let scope_name = if scope.namespace.is_empty() {
                "cluster scope".to_string()
            } else {
                format!("namespace {}", scope.namespace)
            };
            parts.push(format!(
                "missing rules in {scope_name}: {}",
                render_rules(&scope.rules)
            ));
        }
        for escalation in &self.escalations {
            parts.push(escalation.to_string());
        }
        Some(parts.join("; "))
    }
}

fn render_rules(rules: &[PolicyRule]) -> String {
    rules
        .iter()
        .map(|r| {
            if r.is_resource_rule() {
                format!(
                    "{{verbs: [{}], apiGroups: [{}], resources: [{}]}}",
                    r.verbs.join(", "),
                    r.api_groups.join(", "),
                    r.resources.join(", ")
                )
            } else {
                format!(
                    "{{verbs: [{}], nonResourceURLs: [{}]}}",
                    r.verbs.join(", "),
                    r.non_resource_urls.join(", ")
                )
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Replay authorization for every object in the manifest and compute the
/// exact rule set the installer lacks.
///
/// For each (resource, name): the object verbs are checked against the
/// object's namespace and name; the collection verbs are checked without a
/// name in the same namespace, and additionally at cluster scope for
/// namespaced resources. Missing attributes become policy rules grouped by
/// namespace, compacted and deterministically sorted.
pub fn pre_authorize(
    snapshot: &RbacSnapshot,
    user: &UserInfo,
    manifest: &ObjectSet,
) -> PreAuthOutcome {
    let evaluator = Evaluator::new(snapshot);

    let mut records: BTreeSet<Attributes> = BTreeSet::new();
    for (group_resource, names) in &manifest.resources {
        for id in names {
            for verb in OBJECT_VERBS {
                records.insert(Attributes::new(
                    &id.namespace,
                    *verb,
                    &group_resource.group,
                    &group_resource.resource,
                    &id.name,
                ));
            }
            for verb in COLLECTION_VERBS {
                records.insert(Attributes::new(
                    &id.namespace,
                    *verb,
                    &group_resource.group,
                    &group_resource.resource,
                    "",
                ));
                if !id.namespace.is_empty() {
                    records.insert(Attributes::new(
                        "",
                        *verb,
                        &group_resource.group,
                        &group_resource.resource,
                        "",
                    ));
                }
            }
        }
    }

    let mut missing_by_scope: BTreeMap<String, Vec<PolicyRule>> = BTreeMap::new();
    for attrs in &records {
        if evaluator.authorize(user, attrs) {
            continue;
        }
        missing_by_scope
            .entry(attrs.namespace.clone())
            .or_default()
            .push(PolicyRule {
                verbs: vec![attrs.verb.clone()],
                api_groups: vec![attrs.group.clone()],
                resources: vec![attrs.resource.clone()],
                ..Default::default()
            });
    }

    // Escalation violations carry their own missing rules in wire format;
    // parsed rules merge into the report under the offending object's
    // scope.
    let escalations = check_escalations(snapshot, user, manifest);
    for escalation in &escalations {
        if let Some(parsed) = parse_escalation(&escalation.message) {
            missing_by_scope
                .entry(escalation.id.namespace.clone())
                .or_default()
                .extend(parsed.rules);
        }
    }

    let missing = missing_by_scope
        .into_iter()
        .filter(|(_, rules)| !rules.is_empty())
        .map(|(namespace, rules)| ScopedPolicyRules {
            namespace,
            rules: compact_rules(rules),
        })
        .collect();

    PreAuthOutcome {
        missing,
        escalations,
    }
}

/// Compact a rule list: verbs merge over identical remaining fields, verbs
/// and rules sort for reproducible output.
pub fn compact_rules(rules: Vec<PolicyRule>) -> Vec<PolicyRule> {
    type Key = (Vec<String>, Vec<String>, Vec<String>, Vec<String>);
    let mut merged: BTreeMap<Key, BTreeSet<String>> = BTreeMap::new();

    for mut rule in rules {
        rule.api_groups.sort();
        rule.resources.sort();
        rule.resource_names.sort();
        rule.non_resource_urls.sort();
        merged
            .entry((
                rule.api_groups,
                rule.resources,
                rule.resource_names,
                rule.non_resource_urls,
            ))
            .or_default()
            .extend(rule.verbs);
    }

    merged
        .into_iter()
        .map(
            |((api_groups, resources, resource_names, non_resource_urls), verbs)| PolicyRule {
                verbs: verbs.into_iter().collect(),
                api_groups,
                resources,
                resource_names,
                non_resource_urls,
            },
        )
        .collect()
}
