//! Kubernetes-style API version ordering.
//!
//! GA versions outrank beta, beta outranks alpha; within a level the major
//! number decides, then the pre-release minor. Names that do not follow the
//! `v<major>[alpha|beta]<minor>` convention sort below all conforming ones,
//! lexicographically among themselves.

use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Level {
    Alpha,
    Beta,
    Ga,
}

fn parse(version: &str) -> Option<(Level, u64, u64)> {
    let rest = version.strip_prefix('v')?;
    let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    if digits_end == 0 {
        return None;
    }
    let major: u64 = rest[..digits_end].parse().ok()?;
    let suffix = &rest[digits_end..];
    if suffix.is_empty() {
        return Some((Level::Ga, major, 0));
    }
    for (tag, level) in [("alpha", Level::Alpha), ("beta", Level::Beta)] {
        if let Some(minor_str) = suffix.strip_prefix(tag) {
            let minor = if minor_str.is_empty() {
                0
            } else {
                minor_str.parse().ok()?
            };
            return Some((level, major, minor));
        }
    }
    None
}

/// Compare two version names; `Greater` means `a` is the newer version.
pub fn compare_kube_versions(a: &str, b: &str) -> Ordering {
    match (parse(a), parse(b)) {
        (Some(pa), Some(pb)) => pa.cmp(&pb),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}
