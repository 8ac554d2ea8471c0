//! The per-extension reconcile pipeline.
//!
//! One pass runs the install flow in order: admission validation,
//! availability gate, reference resolution, unpack, manifest decode, config
//! validation, RBAC pre-authorization, CRD preflight, revision cut, and
//! rollout. Every outcome lands in the extension's status conditions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use helion_api::{
    condition_reasons, condition_types, find_condition, set_condition, AvailabilityMode,
    ClusterExtension, ClusterExtensionStatus, CollisionProtection, ConditionStatus, ExtensionUrls,
    UserInfo,
};
use helion_image::{ImageReference, ImageStore, RegistryConfig, StoreConfig, StoreError};
use helion_manifest::{decode_manifest, DecodeOptions, ObjectSet};
use helion_preflight::{validate_upgrade, CustomResourceDefinition};
use helion_rbac::pre_authorize;
use helion_rollout::{
    ObjectClient, ProbeRegistry, RolloutConfig, RolloutEngine, RolloutError, RolloutStatus,
};

use crate::bundle::load_bundle;
use crate::cluster::ClusterState;
use crate::config::Config;
use crate::render::{fingerprint, render_revision};
use crate::validation::validate_config;

/// What the runtime should do after one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Converged, or failed terminally; look again at the next resync or
    /// spec change.
    Done,
    /// A rollout is advancing; requeue promptly.
    Progressing,
    /// A transient failure; requeue with backoff.
    TransientFailure,
}

/// How a failed pass is reflected in conditions.
enum Failure {
    Terminal { reason: &'static str, message: String },
    Transient { message: String },
}

impl Failure {
    fn terminal(reason: &'static str, message: impl ToString) -> Self {
        Self::Terminal {
            reason,
            message: message.to_string(),
        }
    }

    fn transient(message: impl ToString) -> Self {
        Self::Transient {
            message: message.to_string(),
        }
    }

    fn from_store_error(error: StoreError) -> Self {
        if error.is_terminal() {
            Self::terminal(condition_reasons::INVALID_REFERENCE, &error)
        } else {
            Self::transient(&error)
        }
    }
}

/// Reconciles extensions one pass at a time.
pub struct Reconciler {
    config: Config,
    image_store: ImageStore,
    state: Arc<dyn ClusterState>,
    objects: Arc<dyn ObjectClient>,
    probes: ProbeRegistry,
    /// Last tag resolution per extension: (spec reference, when).
    resolve_times: Mutex<HashMap<String, (String, Instant)>>,
}

impl Reconciler {
    pub fn new(
        config: Config,
        state: Arc<dyn ClusterState>,
        objects: Arc<dyn ObjectClient>,
    ) -> Result<Self, StoreError> {
        let image_store = ImageStore::new(StoreConfig {
            base_path: config.cache_dir.clone(),
            registry: RegistryConfig {
                auth_token: config.registry_token.clone(),
                plain_http_hosts: config.plain_http_hosts.clone(),
                ..Default::default()
            },
        })?;
        Ok(Self {
            config,
            image_store,
            state,
            objects,
            probes: ProbeRegistry::builtin(),
            resolve_times: Mutex::new(HashMap::new()),
        })
    }

    /// Run one reconcile pass for an extension and persist its status.
    pub async fn reconcile(&self, extension: &ClusterExtension) -> ReconcileOutcome {
        let mut status = extension.status.clone();
        let result = self.reconcile_inner(extension, &mut status).await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(Failure::Terminal { reason, message }) => {
                warn!(
                    extension = %extension.name,
                    reason = reason,
                    error = %message,
                    "Reconcile failed terminally"
                );
                set_condition(
                    &mut status.conditions,
                    condition_types::READY,
                    ConditionStatus::False,
                    reason,
                    message,
                    extension.generation,
                );
                set_condition(
                    &mut status.conditions,
                    condition_types::PROGRESSING,
                    ConditionStatus::False,
                    reason,
                    "",
                    extension.generation,
                );
                ReconcileOutcome::Done
            }
            Err(Failure::Transient { message }) => {
                debug!(
                    extension = %extension.name,
                    error = %message,
                    "Reconcile failed transiently, will retry"
                );
                set_condition(
                    &mut status.conditions,
                    condition_types::READY,
                    ConditionStatus::False,
                    condition_reasons::RECONCILING,
                    message,
                    extension.generation,
                );
                ReconcileOutcome::TransientFailure
            }
        };

        if let Err(e) = self
            .state
            .update_extension_status(&extension.name, &status)
            .await
        {
            warn!(extension = %extension.name, error = %e, "Failed to persist status");
            return ReconcileOutcome::TransientFailure;
        }
        outcome
    }

    /// Remove every trace of a deleted extension from the local cache.
    pub fn cleanup(&self, extension_name: &str) -> Result<(), StoreError> {
        self.image_store.cleanup(extension_name)
    }

    async fn reconcile_inner(
        &self,
        extension: &ClusterExtension,
        status: &mut ClusterExtensionStatus,
    ) -> Result<ReconcileOutcome, Failure> {
        extension
            .spec
            .validate()
            .map_err(|e| Failure::terminal(condition_reasons::VALIDATION_FAILED, e))?;

        if extension.spec.availability_mode == AvailabilityMode::Unavailable {
            // Behave as if the extension did not exist: nothing served, no
            // rollout progression.
            for condition_type in [
                condition_types::SERVING,
                condition_types::PROGRESSING,
                condition_types::READY,
            ] {
                set_condition(
                    &mut status.conditions,
                    condition_type,
                    ConditionStatus::False,
                    condition_reasons::UNAVAILABLE,
                    "availabilityMode is Unavailable",
                    extension.generation,
                );
            }
            return Ok(ReconcileOutcome::Done);
        }

        let pinned = self.resolve_source(extension, status).await?;
        let unpack_dir = self
            .image_store
            .unpack(&extension.name, &pinned)
            .await
            .map_err(Failure::from_store_error)?;
        if status.last_unpacked.is_none()
            || extension.status.resolved_source != status.resolved_source
        {
            status.last_unpacked = Some(Utc::now());
        }

        set_condition(
            &mut status.conditions,
            condition_types::SERVING,
            ConditionStatus::True,
            condition_reasons::AVAILABLE,
            "",
            extension.generation,
        );
        status.urls = self.config.serve_base_url.as_ref().map(|base| ExtensionUrls {
            base: format!("{base}/extensions/{}", extension.name),
        });

        let bundle = load_bundle(&unpack_dir)
            .map_err(|e| Failure::terminal(condition_reasons::MALFORMED_MANIFEST, e))?;
        let object_set = decode_manifest(
            &bundle.manifest_stream,
            &DecodeOptions {
                default_namespace: extension.spec.namespace.clone(),
            },
        )
        .map_err(|e| Failure::terminal(condition_reasons::MALFORMED_MANIFEST, e))?;

        match (&extension.spec.config, &bundle.config_schema) {
            (Some(config), Some(schema)) => {
                validate_config(schema, config, &extension.spec.namespace)
                    .map_err(|e| Failure::terminal(condition_reasons::VALIDATION_FAILED, e))?;
            }
            (Some(_), None) => {
                return Err(Failure::terminal(
                    condition_reasons::VALIDATION_FAILED,
                    "spec.config is set but the bundle declares no configuration schema",
                ));
            }
            _ => {}
        }

        self.pre_authorize_install(extension, &object_set).await?;
        self.preflight_crds(&object_set).await?;

        self.rollout(extension, status, &object_set).await
    }

    /// Resolve the spec reference to its digest-pinned form, honoring the
    /// poll interval for tagged references.
    async fn resolve_source(
        &self,
        extension: &ClusterExtension,
        status: &mut ClusterExtensionStatus,
    ) -> Result<ImageReference, Failure> {
        let spec_ref = &extension.spec.source.image.reference;
        let reference = ImageReference::parse(spec_ref)
            .map_err(|e| Failure::terminal(condition_reasons::INVALID_REFERENCE, e))?;

        if reference.is_digest_pinned() {
            status.resolved_source = Some(reference.to_string());
            return Ok(reference);
        }

        let poll_interval = extension
            .spec
            .source
            .image
            .poll_interval_minutes
            .map(|m| Duration::from_secs(u64::from(m) * 60));

        // Reuse the previous resolution while it is fresh.
        if let Some(resolved) = &status.resolved_source {
            let cached = self
                .resolve_times
                .lock()
                .await
                .get(&extension.name)
                .cloned();
            let fresh = match (&cached, poll_interval) {
                (Some((cached_ref, at)), Some(interval)) => {
                    cached_ref == spec_ref && at.elapsed() < interval
                }
                (Some((cached_ref, _)), None) => cached_ref == spec_ref,
                // After a restart there is no resolution timestamp: a
                // polled reference re-resolves, a static one is kept.
                (None, interval) => interval.is_none(),
            };
            if fresh {
                if let Ok(parsed) = ImageReference::parse(resolved) {
                    if parsed.is_digest_pinned() {
                        return Ok(parsed);
                    }
                }
            }
        }

        let pinned = self
            .image_store
            .resolve(&reference)
            .await
            .map_err(Failure::from_store_error)?;
        info!(
            extension = %extension.name,
            reference = %reference,
            resolved = %pinned,
            "Resolved source reference"
        );

        self.resolve_times
            .lock()
            .await
            .insert(extension.name.clone(), (spec_ref.clone(), Instant::now()));

        status.resolved_source = Some(pinned.to_string());
        Ok(pinned)
    }

    async fn pre_authorize_install(
        &self,
        extension: &ClusterExtension,
        object_set: &ObjectSet,
    ) -> Result<(), Failure> {
        let snapshot = self
            .state
            .rbac_snapshot()
            .await
            .map_err(|e| Failure::transient(e))?;
        let user = UserInfo::service_account(
            &extension.spec.namespace,
            &extension.spec.service_account.name,
        );

        let outcome = pre_authorize(&snapshot, &user, object_set);
        if let Some(error) = outcome.aggregated_error() {
            return Err(Failure::terminal(
                condition_reasons::VALIDATION_FAILED,
                format!("installer {} is not authorized: {error}", user.username),
            ));
        }
        Ok(())
    }

    async fn preflight_crds(&self, object_set: &ObjectSet) -> Result<(), Failure> {
        for object in &object_set.objects {
            if object.kind() != "CustomResourceDefinition" {
                continue;
            }
            let incoming = CustomResourceDefinition::from_value(object.value())
                .map_err(|e| Failure::terminal(condition_reasons::MALFORMED_MANIFEST, e))?;
            let current = self
                .state
                .current_crd(&incoming.metadata.name)
                .await
                .map_err(|e| Failure::transient(e))?;
            if let Some(current) = current {
                validate_upgrade(&current, &incoming).map_err(|e| {
                    Failure::terminal(
                        condition_reasons::SCHEMA_UNSAFE,
                        format!("upgrade of {} is unsafe: {e}", incoming.metadata.name),
                    )
                })?;
            }
        }
        Ok(())
    }

    async fn rollout(
        &self,
        extension: &ClusterExtension,
        status: &mut ClusterExtensionStatus,
        object_set: &ObjectSet,
    ) -> Result<ReconcileOutcome, Failure> {
        let hash = fingerprint(object_set, extension.spec.config.as_ref());
        let revisions = self
            .state
            .revisions_of(&extension.uid)
            .await
            .map_err(|e| Failure::transient(e))?;

        let latest = revisions.last();
        let mut current = match latest {
            Some(latest) if latest.spec_hash == hash.to_string() && !latest.is_archived() => {
                latest.clone()
            }
            _ => {
                let next = render_revision(
                    &extension.name,
                    &extension.uid,
                    object_set,
                    &hash,
                    latest,
                    CollisionProtection::default(),
                );
                info!(
                    extension = %extension.name,
                    revision = next.revision,
                    phases = next.phases.len(),
                    "Cutting new revision"
                );
                self.state
                    .save_revision(&extension.uid, &next)
                    .await
                    .map_err(|e| Failure::transient(e))?;
                next
            }
        };

        let mut others: Vec<_> = revisions
            .into_iter()
            .filter(|r| r.uid != current.uid)
            .collect();

        let deadline = extension
            .spec
            .progress_deadline_minutes
            .unwrap_or(self.config.progress_deadline_minutes);
        let engine = RolloutEngine::new(
            self.objects.as_ref(),
            &self.probes,
            RolloutConfig::new(deadline),
        );

        let rollout_status = engine
            .reconcile(&mut current, &mut others)
            .await
            .map_err(|e| match e {
                RolloutError::Client(client) => Failure::transient(client),
                malformed @ RolloutError::MalformedObject { .. } => {
                    Failure::terminal(condition_reasons::VALIDATION_FAILED, malformed)
                }
            })?;

        // Release leftovers of freshly archived revisions right away.
        for archived in others.iter_mut().filter(|r| r.is_archived()) {
            engine
                .reconcile(archived, &mut [])
                .await
                .map_err(|e| Failure::transient(e))?;
        }

        self.state
            .save_revision(&extension.uid, &current)
            .await
            .map_err(|e| Failure::transient(e))?;
        for other in &others {
            self.state
                .save_revision(&extension.uid, other)
                .await
                .map_err(|e| Failure::transient(e))?;
        }

        // The extension mirrors the revision's Ready condition; adoption
        // warnings and probe reports ride along in the message.
        let revision_ready =
            find_condition(&current.conditions, condition_types::READY).cloned();
        if let Some(revision_ready) = &revision_ready {
            set_condition(
                &mut status.conditions,
                condition_types::READY,
                revision_ready.status,
                &revision_ready.reason,
                revision_ready.message.clone(),
                extension.generation,
            );
        }

        let (progressing, outcome) = match &rollout_status {
            RolloutStatus::Ready => (false, ReconcileOutcome::Done),
            RolloutStatus::Progressing { .. } => (true, ReconcileOutcome::Progressing),
            RolloutStatus::Collision { .. } | RolloutStatus::DeadlineExceeded => {
                (false, ReconcileOutcome::Done)
            }
            RolloutStatus::Archived => (false, ReconcileOutcome::Done),
        };
        set_condition(
            &mut status.conditions,
            condition_types::PROGRESSING,
            if progressing {
                ConditionStatus::True
            } else {
                ConditionStatus::False
            },
            if progressing {
                condition_reasons::ROLLING_OUT
            } else {
                condition_reasons::READY
            },
            revision_ready.map(|c| c.message).unwrap_or_default(),
            extension.generation,
        );

        Ok(outcome)
    }
}
