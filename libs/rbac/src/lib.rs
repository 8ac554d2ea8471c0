//! Client-side replay of the orchestrator's RBAC authorization.
//!
//! Given an installer principal and a decoded manifest, this crate computes
//! the exact set of policy rules that must be granted before the install
//! could succeed, and refuses privilege escalation carried by RBAC objects
//! inside the manifest itself.
//!
//! The pre-authorizer is pure: it is seeded with an [`RbacSnapshot`] of the
//! cluster's bindings and roles and never talks to the network, so it is
//! safe to call from any number of concurrent reconciles.

mod escalation;
mod evaluator;
mod message;
mod preauth;
mod rules;
mod snapshot;

pub use escalation::{check_escalations, EscalationError};
pub use evaluator::Evaluator;
pub use message::{format_escalation, parse_escalation, ParsedEscalation};
pub use preauth::{compact_rules, pre_authorize, PreAuthOutcome, ScopedPolicyRules};
pub use rules::{covers, rule_matches, Attributes};
pub use snapshot::RbacSnapshot;
