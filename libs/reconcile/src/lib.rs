//! Reconciliation loop primitives.
//!
//! This library provides the pieces shared by every reconcile loop in the
//! controller:
//!
//! - **Spec hashing**: a deterministic fingerprint over the rendered object
//!   set, used to decide when a new revision must be cut.
//! - **Backoff**: exponential requeue delays, reset on success.
//! - **Retry budget**: a bounded strike window that stops prompt requeues
//!   for a resource once transient failures pile up, deferring it to the
//!   periodic resync.
//!
//! # Invariants
//!
//! - Fingerprints are deterministic given the same logical input, regardless
//!   of map ordering.
//! - Backoff delays are monotone non-decreasing between resets and never
//!   exceed the configured cap.
//! - A spent retry budget never blocks the resync path, only the prompt
//!   requeue loop.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// A fingerprint over a rendered object set, for revision-cut decisions.
///
/// Two spec hashes are equal iff the canonical JSON encodings are equal, so
/// key ordering and whitespace never produce spurious revisions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Self(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    /// Compute a spec hash over an ordered sequence of values.
    ///
    /// Used for object sets: the declared order is meaningful (phases apply
    /// in order), so it participates in the fingerprint.
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a serde_json::Value>) -> Self {
        let array = serde_json::Value::Array(values.into_iter().cloned().collect());
        Self::from_json(&array)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Exponential requeue backoff with a cap, reset on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            failures: 0,
        }
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.failures.min(16);
        self.failures = self.failures.saturating_add(1);
        let delay = self
            .base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.cap);
        delay.min(self.cap)
    }

    /// Clear accumulated failures after a successful pass.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failure_count(&self) -> u32 {
        self.failures
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP)
    }
}

/// Bounded retries for transiently failing resources.
///
/// Each failure lands a strike inside a per-resource window. While strikes
/// remain under the limit the caller may requeue promptly; once the budget
/// is spent the resource waits for the next periodic resync instead of
/// hammering a broken dependency. A successful pass settles the account.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    limit: u32,
    window: Duration,
    strikes: BTreeMap<String, Strikes>,
}

#[derive(Debug, Clone, Copy)]
struct Strikes {
    count: u32,
    window_opened: Instant,
}

impl RetryBudget {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            strikes: BTreeMap::new(),
        }
    }

    /// Land a strike for a resource.
    ///
    /// Returns whether a prompt retry is still within budget. A window that
    /// has already expired reopens fresh, so an old burst of failures never
    /// counts against a new one.
    pub fn allow_retry(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();
        let strikes = self
            .strikes
            .entry(resource_key.to_string())
            .or_insert(Strikes {
                count: 0,
                window_opened: now,
            });

        if now.duration_since(strikes.window_opened) > self.window {
            *strikes = Strikes {
                count: 0,
                window_opened: now,
            };
        }

        strikes.count += 1;
        strikes.count <= self.limit
    }

    /// Whether the budget for a resource is currently spent.
    pub fn is_spent(&self, resource_key: &str) -> bool {
        let Some(strikes) = self.strikes.get(resource_key) else {
            return false;
        };
        if Instant::now().duration_since(strikes.window_opened) > self.window {
            return false;
        }
        strikes.count > self.limit
    }

    /// Settle a resource's account after a successful pass.
    pub fn settle(&mut self, resource_key: &str) {
        self.strikes.remove(resource_key);
    }

    /// Drop windows that have already expired.
    pub fn compact(&mut self) {
        let now = Instant::now();
        self.strikes
            .retain(|_, s| now.duration_since(s.window_opened) <= self.window);
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW)
    }
}

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Default requeue backoff base.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Default requeue backoff cap.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

/// Default retry limit per resource.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_hash_deterministic() {
        let json1 = serde_json::json!({"b": 2, "a": 1});
        let json2 = serde_json::json!({"a": 1, "b": 2});

        let hash1 = SpecHash::from_json(&json1);
        let hash2 = SpecHash::from_json(&json2);

        assert_eq!(hash1, hash2);
        assert!(hash1.as_str().starts_with("sha256:"));
    }

    #[test]
    fn test_spec_hash_order_sensitive_for_sequences() {
        let a = serde_json::json!({"kind": "Namespace"});
        let b = serde_json::json!({"kind": "Deployment"});

        let forward = SpecHash::from_values([&a, &b]);
        let reverse = SpecHash::from_values([&b, &a]);
        assert_ne!(forward, reverse);
    }

    #[test]
    fn test_canonical_json_escaping() {
        let json = serde_json::json!({"key\n": "va\"lue"});
        let canonical = canonical_json(&json);
        assert_eq!(canonical, r#"{"key\n":"va\"lue"}"#);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_budget_spends_per_resource() {
        let mut budget = RetryBudget::new(2, Duration::from_secs(60));

        assert!(budget.allow_retry("cat"));
        assert!(budget.allow_retry("cat"));
        assert!(!budget.allow_retry("cat"));
        assert!(budget.is_spent("cat"));

        // Other resources keep their own budget.
        assert!(budget.allow_retry("dog"));
        assert!(!budget.is_spent("dog"));
    }

    #[test]
    fn test_retry_budget_settles_on_success() {
        let mut budget = RetryBudget::new(1, Duration::from_secs(60));
        assert!(budget.allow_retry("cat"));
        assert!(!budget.allow_retry("cat"));

        budget.settle("cat");
        assert!(!budget.is_spent("cat"));
        assert!(budget.allow_retry("cat"));
    }

    #[test]
    fn test_retry_budget_window_reopens() {
        let mut budget = RetryBudget::new(1, Duration::from_millis(1));
        assert!(budget.allow_retry("cat"));
        assert!(!budget.allow_retry("cat"));

        std::thread::sleep(Duration::from_millis(5));
        assert!(!budget.is_spent("cat"), "expired window is no longer spent");
        assert!(budget.allow_retry("cat"), "a fresh window opens");

        std::thread::sleep(Duration::from_millis(5));
        budget.compact();
        assert!(budget.allow_retry("cat"));
    }

    #[test]
    fn test_zero_budget_never_allows_prompt_retries() {
        let mut budget = RetryBudget::new(0, Duration::from_secs(60));
        assert!(!budget.allow_retry("cat"));
        assert!(budget.is_spent("cat"));
    }
}
