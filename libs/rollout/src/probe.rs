//! Readiness probes gating phase progression.

use std::collections::HashMap;

use crate::object::ObjectKey;

/// Outcome of probing one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub ready: bool,
    pub message: String,
}

impl ProbeResult {
    pub fn ready() -> Self {
        Self {
            ready: true,
            message: String::new(),
        }
    }

    pub fn not_ready(message: impl Into<String>) -> Self {
        Self {
            ready: false,
            message: message.into(),
        }
    }
}

/// A non-ready object, as reported on the revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailingProbe {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub message: String,
}

/// Decides whether one applied object is ready.
pub trait ReadinessProbe: Send + Sync {
    fn evaluate(&self, object: &serde_json::Value) -> ProbeResult;
}

/// Ready as soon as the object exists. The fallback for kinds without
/// status conditions.
pub struct ExistsProbe;

impl ReadinessProbe for ExistsProbe {
    fn evaluate(&self, _object: &serde_json::Value) -> ProbeResult {
        ProbeResult::ready()
    }
}

/// Ready when the Deployment reports an `Available=True` condition.
pub struct DeploymentAvailableProbe;

impl ReadinessProbe for DeploymentAvailableProbe {
    fn evaluate(&self, object: &serde_json::Value) -> ProbeResult {
        let conditions = object
            .pointer("/status/conditions")
            .and_then(|c| c.as_array());
        let available = conditions.and_then(|conditions| {
            conditions.iter().find(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some("Available")
            })
        });
        match available {
            Some(condition) if condition.get("status").and_then(|s| s.as_str()) == Some("True") => {
                ProbeResult::ready()
            }
            Some(condition) => ProbeResult::not_ready(
                condition
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("deployment is not available")
                    .to_string(),
            ),
            None => ProbeResult::not_ready("deployment has not reported availability"),
        }
    }
}

/// Ready when every desired StatefulSet replica reports ready.
pub struct StatefulSetReadyProbe;

impl ReadinessProbe for StatefulSetReadyProbe {
    fn evaluate(&self, object: &serde_json::Value) -> ProbeResult {
        let desired = object
            .pointer("/spec/replicas")
            .and_then(|v| v.as_i64())
            .unwrap_or(1);
        let ready = object
            .pointer("/status/readyReplicas")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        if ready >= desired {
            ProbeResult::ready()
        } else {
            ProbeResult::not_ready(format!("{ready}/{desired} replicas ready"))
        }
    }
}

/// Ready when the DaemonSet has a ready pod on every scheduled node.
pub struct DaemonSetReadyProbe;

impl ReadinessProbe for DaemonSetReadyProbe {
    fn evaluate(&self, object: &serde_json::Value) -> ProbeResult {
        let scheduled = object
            .pointer("/status/desiredNumberScheduled")
            .and_then(|v| v.as_i64());
        let ready = object
            .pointer("/status/numberReady")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        match scheduled {
            Some(scheduled) if ready >= scheduled => ProbeResult::ready(),
            Some(scheduled) => {
                ProbeResult::not_ready(format!("{ready}/{scheduled} pods ready"))
            }
            None => ProbeResult::not_ready("daemonset has not reported scheduling"),
        }
    }
}

/// Ready when the CustomResourceDefinition reports `Established=True`;
/// custom resources cannot be served before that.
pub struct CrdEstablishedProbe;

impl ReadinessProbe for CrdEstablishedProbe {
    fn evaluate(&self, object: &serde_json::Value) -> ProbeResult {
        let conditions = object
            .pointer("/status/conditions")
            .and_then(|c| c.as_array());
        let established = conditions.and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.get("type").and_then(|t| t.as_str()) == Some("Established"))
        });
        match established {
            Some(condition)
                if condition.get("status").and_then(|s| s.as_str()) == Some("True") =>
            {
                ProbeResult::ready()
            }
            Some(condition) => ProbeResult::not_ready(
                condition
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("crd is not established")
                    .to_string(),
            ),
            None => ProbeResult::not_ready("crd has not been established"),
        }
    }
}

/// Probe dispatch by object kind.
pub struct ProbeRegistry {
    by_kind: HashMap<String, Box<dyn ReadinessProbe>>,
    fallback: Box<dyn ReadinessProbe>,
}

impl ProbeRegistry {
    /// The builtin registry: workload kinds gate on their own status,
    /// CRDs on establishment, everything else on existence.
    pub fn builtin() -> Self {
        let mut by_kind: HashMap<String, Box<dyn ReadinessProbe>> = HashMap::new();
        by_kind.insert("Deployment".to_string(), Box::new(DeploymentAvailableProbe));
        by_kind.insert("StatefulSet".to_string(), Box::new(StatefulSetReadyProbe));
        by_kind.insert("DaemonSet".to_string(), Box::new(DaemonSetReadyProbe));
        by_kind.insert(
            "CustomResourceDefinition".to_string(),
            Box::new(CrdEstablishedProbe),
        );
        Self {
            by_kind,
            fallback: Box::new(ExistsProbe),
        }
    }

    /// Register a probe for a kind, replacing any existing one.
    pub fn register(&mut self, kind: impl Into<String>, probe: Box<dyn ReadinessProbe>) {
        self.by_kind.insert(kind.into(), probe);
    }

    /// Probe one object, returning the failure record when not ready.
    pub fn evaluate(&self, key: &ObjectKey, object: &serde_json::Value) -> Option<FailingProbe> {
        let probe = self
            .by_kind
            .get(&key.kind)
            .unwrap_or(&self.fallback);
        let result = probe.evaluate(object);
        if result.ready {
            None
        } else {
            Some(FailingProbe {
                kind: key.kind.clone(),
                name: key.name.clone(),
                namespace: key.namespace.clone(),
                message: result.message,
            })
        }
    }
}
