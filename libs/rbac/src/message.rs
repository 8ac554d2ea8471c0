//! Escalation message wire format.
//!
//! Escalation violations are rendered in the apiserver's textual format
//! ("attempting to grant RBAC permissions not currently held") and parsed
//! back when merging them into the missing-rule report. The parser is
//! deliberately strict: compat tests pin the exact strings for every
//! supported format revision, so a format change fails a test here instead
//! of silently dropping rules in production.

use helion_api::{PolicyRule, UserInfo};

const HELD_MARKER: &str = "is attempting to grant RBAC permissions not currently held:";

/// Render an escalation violation for a user and the rules they lack.
pub fn format_escalation(user: &UserInfo, missing: &[PolicyRule]) -> String {
    let mut out = format!(
        "user \"{}\" (groups={}) {}",
        user.username,
        format_list(&user.groups),
        HELD_MARKER
    );
    for rule in missing {
        out.push('\n');
        out.push_str(&format_rule(rule));
    }
    out
}

fn format_rule(rule: &PolicyRule) -> String {
    let mut segments = Vec::new();
    if !rule.api_groups.is_empty() {
        segments.push(format!("APIGroups:{}", format_list(&rule.api_groups)));
    }
    if !rule.resources.is_empty() {
        segments.push(format!("Resources:{}", format_list(&rule.resources)));
    }
    if !rule.resource_names.is_empty() {
        segments.push(format!("ResourceNames:{}", format_list(&rule.resource_names)));
    }
    if !rule.non_resource_urls.is_empty() {
        segments.push(format!(
            "NonResourceURLs:{}",
            format_list(&rule.non_resource_urls)
        ));
    }
    segments.push(format!("Verbs:{}", format_list(&rule.verbs)));
    format!("{{{}}}", segments.join(", "))
}

fn format_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|i| format!("\"{i}\"")).collect();
    format!("[{}]", quoted.join(", "))
}

/// A successfully parsed escalation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEscalation {
    pub username: String,
    pub rules: Vec<PolicyRule>,
}

/// Parse an escalation message back into the rules it names.
///
/// Returns `None` for anything that is not exactly the known format; the
/// caller then surfaces the raw message instead of guessing.
pub fn parse_escalation(message: &str) -> Option<ParsedEscalation> {
    let mut lines = message.lines();
    let header = lines.next()?;

    let after_user = header.strip_prefix("user \"")?;
    let (username, rest) = after_user.split_once('"')?;
    let rest = rest.strip_prefix(" (groups=")?;
    let (_, rest) = rest.split_once(')')?;
    if rest.trim() != HELD_MARKER {
        return None;
    }

    let mut rules = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        rules.push(parse_rule(line.trim())?);
    }
    Some(ParsedEscalation {
        username: username.to_string(),
        rules,
    })
}

fn parse_rule(line: &str) -> Option<PolicyRule> {
    let inner = line.strip_prefix('{')?.strip_suffix('}')?;
    let mut rule = PolicyRule::default();

    // Segments end at "]"; a trailing ", " separates them.
    let mut rest = inner;
    while !rest.is_empty() {
        let end = rest.find(']')?;
        let segment = &rest[..=end];
        rest = rest[end + 1..].strip_prefix(", ").unwrap_or(&rest[end + 1..]);

        let (key, list) = segment.split_once(":[")?;
        let items = parse_list(list.strip_suffix(']')?)?;
        match key {
            "APIGroups" => rule.api_groups = items,
            "Resources" => rule.resources = items,
            "ResourceNames" => rule.resource_names = items,
            "NonResourceURLs" => rule.non_resource_urls = items,
            "Verbs" => rule.verbs = items,
            _ => return None,
        }
    }

    if rule.verbs.is_empty() {
        return None;
    }
    Some(rule)
}

fn parse_list(list: &str) -> Option<Vec<String>> {
    if list.is_empty() {
        return Some(Vec::new());
    }
    let mut items = Vec::new();
    for item in list.split(", ") {
        items.push(item.strip_prefix('"')?.strip_suffix('"')?.to_string());
    }
    Some(items)
}
