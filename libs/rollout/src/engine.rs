//! The revision reconcile loop.

use chrono::{Duration as ChronoDuration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use helion_api::{
    condition_reasons, condition_types, set_condition, AdoptionRecord, CollisionProtection,
    ConditionStatus, LifecycleState, OwnerReference, Revision,
};

use crate::client::{ClientError, ObjectClient};
use crate::object::{controller_of, object_key, owner_references, set_owner_references, ObjectKey};
use crate::probe::{FailingProbe, ProbeRegistry};

/// Owner references written by the engine carry the revision API identity.
pub const REVISION_API_VERSION: &str = "extensions.helion.dev/v1";
pub const REVISION_KIND: &str = "ClusterExtensionRevision";

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct RolloutConfig {
    /// Minutes a revision may take to reach readiness. Clamped to
    /// [10, 720].
    pub progress_deadline_minutes: u32,
}

impl RolloutConfig {
    pub fn new(progress_deadline_minutes: u32) -> Self {
        Self {
            progress_deadline_minutes: progress_deadline_minutes.clamp(10, 720),
        }
    }
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            progress_deadline_minutes: 10,
        }
    }
}

/// Errors from one reconcile step. All are transient; terminal outcomes are
/// expressed through [`RolloutStatus`].
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("malformed object in revision {revision}: {message}")]
    MalformedObject { revision: String, message: String },
}

/// Outcome of one reconcile step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutStatus {
    /// Every phase applied and probed ready.
    Ready,
    /// A phase is still applying or waiting on probes.
    Progressing {
        phase: String,
        failing_probes: Vec<FailingProbe>,
    },
    /// An object exists but may not be touched under its collision policy.
    Collision { object: ObjectKey, message: String },
    /// The revision missed its progress deadline.
    DeadlineExceeded,
    /// The revision is archived; leftover objects were released.
    Archived,
}

/// Drives revisions toward readiness against an [`ObjectClient`].
pub struct RolloutEngine<'a> {
    client: &'a dyn ObjectClient,
    probes: &'a ProbeRegistry,
    config: RolloutConfig,
}

impl<'a> RolloutEngine<'a> {
    pub fn new(
        client: &'a dyn ObjectClient,
        probes: &'a ProbeRegistry,
        config: RolloutConfig,
    ) -> Self {
        Self {
            client,
            probes,
            config,
        }
    }

    /// Advance one revision by one step.
    ///
    /// `all_revisions` carries every other revision of the same extension,
    /// so ownership transitions and archival can be resolved by lookup. On
    /// `Ready`, earlier active revisions in the slice are archived in
    /// place.
    pub async fn reconcile(
        &self,
        revision: &mut Revision,
        all_revisions: &mut [Revision],
    ) -> Result<RolloutStatus, RolloutError> {
        if revision.is_archived() {
            return self.reconcile_archived(revision).await;
        }

        let (status, forced_adoptions) = self.rollout(revision, all_revisions).await?;
        self.record_status(revision, &status, &forced_adoptions);

        if status == RolloutStatus::Ready {
            for earlier in all_revisions
                .iter_mut()
                .filter(|r| r.revision < revision.revision)
            {
                if earlier.lifecycle_state == LifecycleState::Active {
                    info!(
                        revision = earlier.revision,
                        name = %earlier.name,
                        "Archiving superseded revision"
                    );
                    earlier.lifecycle_state = LifecycleState::Archived;
                }
            }
        }
        Ok(status)
    }

    /// Delete everything an archived revision still owns and report the
    /// terminal condition. Objects adopted by a newer revision no longer
    /// carry this revision's owner reference and are untouched.
    async fn reconcile_archived(
        &self,
        revision: &mut Revision,
    ) -> Result<RolloutStatus, RolloutError> {
        let leftovers = self.client.list_owned(&revision.uid).await?;
        for value in leftovers {
            let Some(key) = object_key(&value) else {
                continue;
            };
            let refs = owner_references(&value);
            if controller_of(&refs).is_some_and(|r| r.uid == revision.uid) {
                debug!(object = %key, revision = %revision.name, "Deleting object owned by archived revision");
                self.client.delete(&key).await?;
            } else {
                // Only a non-controlling leftover reference: release it.
                let mut value = value;
                let remaining: Vec<OwnerReference> =
                    refs.into_iter().filter(|r| r.uid != revision.uid).collect();
                set_owner_references(&mut value, &remaining);
                self.client.apply(value).await?;
            }
        }

        set_condition(
            &mut revision.conditions,
            condition_types::READY,
            ConditionStatus::False,
            condition_reasons::ARCHIVED,
            "revision is archived",
            revision.revision,
        );
        Ok(RolloutStatus::Archived)
    }

    /// Run the phases, returning the rollout status and every object this
    /// pass adopted away from another controller.
    async fn rollout(
        &self,
        revision: &mut Revision,
        all_revisions: &[Revision],
    ) -> Result<(RolloutStatus, Vec<ObjectKey>), RolloutError> {
        let phases = revision.phases.clone();
        let mut forced_adoptions = Vec::new();
        for phase in &phases {
            let mut failing = Vec::new();
            let mut applied_keys = Vec::new();

            for managed in &phase.objects {
                let key = object_key(&managed.object).ok_or_else(|| {
                    RolloutError::MalformedObject {
                        revision: revision.name.clone(),
                        message: "object lacks apiVersion, kind or metadata.name".to_string(),
                    }
                })?;

                match self
                    .apply_object(
                        revision,
                        all_revisions,
                        &key,
                        managed.object.clone(),
                        managed.collision_protection,
                        &mut forced_adoptions,
                    )
                    .await?
                {
                    ApplyOutcome::Applied => applied_keys.push(key),
                    ApplyOutcome::Collision(message) => {
                        warn!(object = %key, "Object collision");
                        return Ok((
                            RolloutStatus::Collision {
                                object: key,
                                message,
                            },
                            forced_adoptions,
                        ));
                    }
                }
            }

            // Probe everything in the phase against current cluster state.
            for key in &applied_keys {
                let current = self.client.get(key).await?;
                match current {
                    Some(value) => {
                        if let Some(probe) = self.probes.evaluate(key, &value) {
                            failing.push(probe);
                        }
                    }
                    None => failing.push(FailingProbe {
                        kind: key.kind.clone(),
                        name: key.name.clone(),
                        namespace: key.namespace.clone(),
                        message: "object disappeared after apply".to_string(),
                    }),
                }
            }

            if !failing.is_empty() {
                if self.deadline_exceeded(revision) {
                    return Ok((RolloutStatus::DeadlineExceeded, forced_adoptions));
                }
                debug!(
                    phase = %phase.name,
                    failing = failing.len(),
                    "Phase is waiting on probes"
                );
                return Ok((
                    RolloutStatus::Progressing {
                        phase: phase.name.clone(),
                        failing_probes: failing,
                    },
                    forced_adoptions,
                ));
            }
        }

        Ok((RolloutStatus::Ready, forced_adoptions))
    }

    /// Apply one object under its collision policy, transitioning ownership
    /// from earlier revisions as needed.
    async fn apply_object(
        &self,
        revision: &mut Revision,
        all_revisions: &[Revision],
        key: &ObjectKey,
        mut desired: serde_json::Value,
        protection: CollisionProtection,
        forced_adoptions: &mut Vec<ObjectKey>,
    ) -> Result<ApplyOutcome, RolloutError> {
        let existing = self.client.get(key).await?;
        let our_ref = OwnerReference {
            api_version: REVISION_API_VERSION.to_string(),
            kind: REVISION_KIND.to_string(),
            name: revision.name.clone(),
            uid: revision.uid.clone(),
            controller: true,
        };

        let mut kept_refs: Vec<OwnerReference> = Vec::new();
        if let Some(existing) = &existing {
            let refs = owner_references(existing);
            let controller = controller_of(&refs);

            match controller {
                Some(r) if r.uid == revision.uid => {
                    // Already ours; idempotent re-apply.
                }
                Some(r) if is_revision_of(all_revisions, &r.uid) => {
                    // Ownership transition from a previous revision.
                    let previous_name = r.name.clone();
                    record_adoption(revision, key, &previous_name);
                    info!(
                        object = %key,
                        from = %previous_name,
                        to = %revision.name,
                        "Transitioning object ownership"
                    );
                }
                Some(foreign) => match protection {
                    CollisionProtection::Prevent | CollisionProtection::IfNoController => {
                        return Ok(ApplyOutcome::Collision(format!(
                            "object is controlled by {} {}",
                            foreign.kind, foreign.name
                        )));
                    }
                    CollisionProtection::None => {
                        warn!(
                            object = %key,
                            previous_controller = %foreign.name,
                            "Adopting object away from its controller"
                        );
                        forced_adoptions.push(key.clone());
                    }
                },
                None => match protection {
                    CollisionProtection::Prevent => {
                        return Ok(ApplyOutcome::Collision(
                            "object exists but is not managed by this extension".to_string(),
                        ));
                    }
                    CollisionProtection::IfNoController | CollisionProtection::None => {
                        debug!(object = %key, "Adopting unowned object");
                    }
                },
            }

            // Keep foreign non-controlling references; all revision-owned
            // and controlling references are replaced by ours.
            kept_refs = refs
                .into_iter()
                .filter(|r| !r.controller && !is_revision_of(all_revisions, &r.uid) && r.uid != revision.uid)
                .collect();
        }

        kept_refs.push(our_ref);
        set_owner_references(&mut desired, &kept_refs);
        self.client.apply(desired).await?;
        Ok(ApplyOutcome::Applied)
    }

    fn deadline_exceeded(&self, revision: &Revision) -> bool {
        let deadline = ChronoDuration::minutes(i64::from(self.config.progress_deadline_minutes));
        Utc::now() - revision.created_at > deadline
    }

    fn record_status(
        &self,
        revision: &mut Revision,
        status: &RolloutStatus,
        forced_adoptions: &[ObjectKey],
    ) {
        let generation = revision.revision;
        // Forced adoptions are hazardous enough to surface to anyone
        // reading conditions, not just the log.
        let adoption_warning = if forced_adoptions.is_empty() {
            String::new()
        } else {
            format!(
                "adopted objects that had another controller: {}",
                forced_adoptions
                    .iter()
                    .map(|k| k.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        let with_warning = |message: String| {
            if adoption_warning.is_empty() {
                message
            } else if message.is_empty() {
                adoption_warning.clone()
            } else {
                format!("{message}; {adoption_warning}")
            }
        };

        match status {
            RolloutStatus::Ready => set_condition(
                &mut revision.conditions,
                condition_types::READY,
                ConditionStatus::True,
                condition_reasons::READY,
                with_warning(String::new()),
                generation,
            ),
            RolloutStatus::Progressing {
                phase,
                failing_probes,
            } => {
                let (reason, message) = if failing_probes.is_empty() {
                    (
                        condition_reasons::ROLLING_OUT,
                        format!("applying phase {phase}"),
                    )
                } else {
                    (
                        condition_reasons::PROBE_FAILURE,
                        format_failing(phase, failing_probes),
                    )
                };
                set_condition(
                    &mut revision.conditions,
                    condition_types::READY,
                    ConditionStatus::False,
                    reason,
                    with_warning(message),
                    generation,
                );
            }
            RolloutStatus::Collision { object, message } => set_condition(
                &mut revision.conditions,
                condition_types::READY,
                ConditionStatus::False,
                condition_reasons::OBJECT_COLLISION,
                format!("{object}: {message}"),
                generation,
            ),
            RolloutStatus::DeadlineExceeded => set_condition(
                &mut revision.conditions,
                condition_types::READY,
                ConditionStatus::False,
                condition_reasons::PROGRESS_DEADLINE_EXCEEDED,
                "revision did not become ready within its deadline",
                generation,
            ),
            RolloutStatus::Archived => {}
        }
    }
}

enum ApplyOutcome {
    Applied,
    Collision(String),
}

fn is_revision_of(all_revisions: &[Revision], uid: &str) -> bool {
    all_revisions.iter().any(|r| r.uid == uid)
}

fn record_adoption(revision: &mut Revision, key: &ObjectKey, previous_revision: &str) {
    let record = AdoptionRecord {
        api_version: key.api_version.clone(),
        kind: key.kind.clone(),
        namespace: key.namespace.clone(),
        name: key.name.clone(),
        previous_revision: previous_revision.to_string(),
    };
    if !revision.adoption_log.contains(&record) {
        revision.adoption_log.push(record);
    }
}

fn format_failing(phase: &str, failing: &[FailingProbe]) -> String {
    let list = failing
        .iter()
        .map(|f| {
            if f.namespace.is_empty() {
                format!("{} {}: {}", f.kind, f.name, f.message)
            } else {
                format!("{} {}/{}: {}", f.kind, f.namespace, f.name, f.message)
            }
        })
        .collect::<Vec<_>>()
        .join("; ");
    format!("phase {phase} is waiting on probes: {list}")
}
