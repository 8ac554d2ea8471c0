//! Policy rule matching and coverage.
//!
//! Two related questions are answered here:
//!
//! - does a rule allow one concrete request ([`rule_matches`]), and
//! - does one rule set grant everything another rule set grants
//!   ([`covers`]), the question behind escalation checks.
//!
//! Coverage breaks rules down into atomic grants, a tagged sum over
//! resource and non-resource shapes, so comparison dispatches on the tag
//! instead of a class hierarchy.

use helion_api::PolicyRule;

pub const WILDCARD: &str = "*";

/// One concrete authorization question.
///
/// An empty `name` is a collection request; an empty `namespace` is a
/// cluster-scoped request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attributes {
    pub namespace: String,
    pub verb: String,
    pub group: String,
    pub resource: String,
    pub name: String,
}

impl Attributes {
    pub fn new(
        namespace: impl Into<String>,
        verb: impl Into<String>,
        group: impl Into<String>,
        resource: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            verb: verb.into(),
            group: group.into(),
            resource: resource.into(),
            name: name.into(),
        }
    }
}

fn contains_or_wildcard(haystack: &[String], needle: &str) -> bool {
    haystack.iter().any(|h| h == WILDCARD || h == needle)
}

/// Whether a single rule allows the given request.
///
/// `resourceNames` follows the "empty means all" convention; collection
/// requests (no name) are only allowed by rules without name restrictions.
pub fn rule_matches(rule: &PolicyRule, attrs: &Attributes) -> bool {
    if !rule.is_resource_rule() {
        return false;
    }
    if !contains_or_wildcard(&rule.verbs, &attrs.verb) {
        return false;
    }
    if !contains_or_wildcard(&rule.api_groups, &attrs.group) {
        return false;
    }
    if !contains_or_wildcard(&rule.resources, &attrs.resource) {
        return false;
    }
    if rule.resource_names.is_empty() {
        return true;
    }
    !attrs.name.is_empty() && contains_or_wildcard(&rule.resource_names, &attrs.name)
}

/// An atomic grant: one verb over one resource shape.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AtomicRule<'a> {
    Resource {
        verb: &'a str,
        group: &'a str,
        resource: &'a str,
        /// `None` means all names.
        name: Option<&'a str>,
    },
    NonResource {
        verb: &'a str,
        url: &'a str,
    },
}

/// Break a rule set into its atomic grants.
fn break_down(rules: &[PolicyRule]) -> Vec<AtomicRule<'_>> {
    let mut atoms = Vec::new();
    for rule in rules {
        for verb in &rule.verbs {
            if rule.is_resource_rule() {
                for group in &rule.api_groups {
                    for resource in &rule.resources {
                        if rule.resource_names.is_empty() {
                            atoms.push(AtomicRule::Resource {
                                verb,
                                group,
                                resource,
                                name: None,
                            });
                        } else {
                            for name in &rule.resource_names {
                                atoms.push(AtomicRule::Resource {
                                    verb,
                                    group,
                                    resource,
                                    name: Some(name),
                                });
                            }
                        }
                    }
                }
            }
            for url in &rule.non_resource_urls {
                atoms.push(AtomicRule::NonResource { verb, url });
            }
        }
    }
    atoms
}

fn component_covers(owner: &str, wanted: &str) -> bool {
    owner == WILDCARD || owner == wanted
}

/// Non-resource URLs allow a trailing `*` prefix wildcard.
fn url_covers(owner: &str, wanted: &str) -> bool {
    if owner == WILDCARD || owner == wanted {
        return true;
    }
    owner
        .strip_suffix('*')
        .is_some_and(|prefix| wanted.starts_with(prefix))
}

fn rule_covers_atom(rule: &PolicyRule, atom: &AtomicRule<'_>) -> bool {
    match atom {
        AtomicRule::Resource {
            verb,
            group,
            resource,
            name,
        } => {
            contains_or_wildcard(&rule.verbs, verb)
                && rule.api_groups.iter().any(|g| component_covers(g, group))
                && rule.resources.iter().any(|r| component_covers(r, resource))
                && match name {
                    // All names wanted: only an unrestricted rule covers.
                    None => rule.resource_names.is_empty(),
                    Some(name) => {
                        rule.resource_names.is_empty()
                            || rule.resource_names.iter().any(|n| n == name)
                    }
                }
        }
        AtomicRule::NonResource { verb, url } => {
            contains_or_wildcard(&rule.verbs, verb)
                && rule.non_resource_urls.iter().any(|u| url_covers(u, url))
        }
    }
}

/// Whether `owner` grants everything `wanted` grants.
///
/// Returns the uncovered remainder as single-grant rules, for reporting.
pub fn covers(owner: &[PolicyRule], wanted: &[PolicyRule]) -> (bool, Vec<PolicyRule>) {
    let mut uncovered = Vec::new();
    for atom in break_down(wanted) {
        let covered = owner.iter().any(|rule| rule_covers_atom(rule, &atom));
        if !covered {
            uncovered.push(match atom {
                AtomicRule::Resource {
                    verb,
                    group,
                    resource,
                    name,
                } => PolicyRule {
                    verbs: vec![verb.to_string()],
                    api_groups: vec![group.to_string()],
                    resources: vec![resource.to_string()],
                    resource_names: name.map(|n| vec![n.to_string()]).unwrap_or_default(),
                    non_resource_urls: Vec::new(),
                },
                AtomicRule::NonResource { verb, url } => PolicyRule {
                    verbs: vec![verb.to_string()],
                    non_resource_urls: vec![url.to_string()],
                    ..Default::default()
                },
            });
        }
    }
    (uncovered.is_empty(), uncovered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(ns: &str, verb: &str, group: &str, resource: &str, name: &str) -> Attributes {
        Attributes::new(ns, verb, group, resource, name)
    }

    #[test]
    fn test_exact_match() {
        let rule = PolicyRule::resource(&["get", "list"], &[""], &["services"]);
        assert!(rule_matches(&rule, &attrs("ns", "get", "", "services", "svc")));
        assert!(rule_matches(&rule, &attrs("ns", "list", "", "services", "")));
        assert!(!rule_matches(&rule, &attrs("ns", "delete", "", "services", "svc")));
        assert!(!rule_matches(&rule, &attrs("ns", "get", "apps", "services", "svc")));
        assert!(!rule_matches(&rule, &attrs("ns", "get", "", "configmaps", "svc")));
    }

    #[test]
    fn test_wildcards() {
        let superuser = PolicyRule::resource(&["*"], &["*"], &["*"]);
        assert!(rule_matches(
            &superuser,
            &attrs("", "create", "apps", "deployments", "")
        ));
    }

    #[test]
    fn test_resource_names_empty_means_all() {
        let unrestricted = PolicyRule::resource(&["get"], &[""], &["configmaps"]);
        assert!(rule_matches(
            &unrestricted,
            &attrs("ns", "get", "", "configmaps", "anything")
        ));

        let named =
            PolicyRule::resource(&["get"], &[""], &["configmaps"]).with_names(&["settings"]);
        assert!(rule_matches(
            &named,
            &attrs("ns", "get", "", "configmaps", "settings")
        ));
        assert!(!rule_matches(
            &named,
            &attrs("ns", "get", "", "configmaps", "other")
        ));
        // A named rule never allows collection requests.
        assert!(!rule_matches(&named, &attrs("ns", "get", "", "configmaps", "")));
    }

    #[test]
    fn test_empty_verb_rule_matches_nothing() {
        let trivial = PolicyRule::resource(&[""], &[""], &[""]);
        assert!(!rule_matches(&trivial, &attrs("ns", "get", "", "services", "x")));
    }

    #[test]
    fn test_covers_subset() {
        let owner = vec![PolicyRule::resource(&["*"], &[""], &["services", "configmaps"])];
        let wanted = vec![PolicyRule::resource(&["get", "watch"], &[""], &["services"])];
        let (ok, missing) = covers(&owner, &wanted);
        assert!(ok, "missing: {missing:?}");
    }

    #[test]
    fn test_covers_reports_uncovered_atoms() {
        let owner = vec![PolicyRule::resource(&["get"], &[""], &["services"])];
        let wanted = vec![PolicyRule::resource(&["get", "delete"], &[""], &["services"])];
        let (ok, missing) = covers(&owner, &wanted);
        assert!(!ok);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].verbs, vec!["delete"]);
        assert_eq!(missing[0].resources, vec!["services"]);
    }

    #[test]
    fn test_covers_resource_names() {
        // Owner restricted to one name does not cover an all-names grant.
        let owner = vec![PolicyRule::resource(&["get"], &[""], &["configmaps"])
            .with_names(&["settings"])];
        let wanted = vec![PolicyRule::resource(&["get"], &[""], &["configmaps"])];
        let (ok, _) = covers(&owner, &wanted);
        assert!(!ok);

        // The reverse direction does cover.
        let (ok, _) = covers(&wanted, &owner);
        assert!(ok);
    }

    #[test]
    fn test_covers_non_resource_urls() {
        let owner = vec![PolicyRule::non_resource(&["get"], &["/healthz/*"])];
        let wanted = vec![PolicyRule::non_resource(&["get"], &["/healthz/ready"])];
        let (ok, _) = covers(&owner, &wanted);
        assert!(ok);

        let wanted = vec![PolicyRule::non_resource(&["get"], &["/metrics"])];
        let (ok, missing) = covers(&owner, &wanted);
        assert!(!ok);
        assert_eq!(missing[0].non_resource_urls, vec!["/metrics"]);
    }

    #[test]
    fn test_covers_mixed_shapes_dispatch() {
        let owner = vec![
            PolicyRule::resource(&["*"], &["*"], &["*"]),
            PolicyRule::non_resource(&["*"], &["*"]),
        ];
        let wanted = vec![
            PolicyRule::resource(&["escalate"], &["rbac.authorization.k8s.io"], &["roles"]),
            PolicyRule::non_resource(&["get"], &["/version"]),
        ];
        let (ok, _) = covers(&owner, &wanted);
        assert!(ok);
    }
}
