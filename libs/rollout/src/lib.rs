//! Revisioned rollout of managed objects.
//!
//! The engine drives one [`helion_api::Revision`] at a time: phases apply in
//! declared order, every object is probe-gated before the next phase may
//! begin, ownership transitions from the previous active revision through
//! owner-reference swaps, and completed rollouts archive their
//! predecessors. The same managed object is owned by at most one revision
//! at any time.
//!
//! The cluster is reached through the [`ObjectClient`] seam; tests run
//! against the in-memory [`FakeCluster`].

mod client;
mod engine;
mod object;
mod probe;

pub use client::{ClientError, FakeCluster, ObjectClient};
pub use engine::{
    RolloutConfig, RolloutEngine, RolloutError, RolloutStatus, REVISION_API_VERSION, REVISION_KIND,
};
pub use object::{controller_of, object_key, owner_references, set_owner_references, ObjectKey};
pub use probe::{DeploymentAvailableProbe, ExistsProbe, FailingProbe, ProbeRegistry, ProbeResult, ReadinessProbe};
