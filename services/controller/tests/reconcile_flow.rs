//! Integration tests for the reconcile pipeline.
//!
//! These drive the [`Reconciler`] directly against the in-memory cluster
//! state, the fake object cluster, and a stubbed OCI registry: spec
//! admission, terminal failure reporting, config validation and the CRD
//! preflight path.

use std::sync::Arc;

use helion_controller::ClusterState;
use sha2::{Digest, Sha256};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use helion_api::{
    condition_reasons, condition_types, find_condition, AvailabilityMode, ClusterExtension,
    ClusterExtensionSpec, ClusterExtensionStatus, ConditionStatus, ImageSource, PolicyRule,
    ServiceAccountRef, SourceConfig, SourceType,
};
use helion_controller::{Config, InMemoryClusterState, ReconcileOutcome, Reconciler};
use helion_preflight::CustomResourceDefinition;
use helion_rbac::RbacSnapshot;
use helion_rollout::FakeCluster;

/// Build a gzipped tar layer from (path, contents) pairs.
fn build_layer(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, contents.as_bytes())
            .unwrap();
    }
    let tar_bytes = builder.into_inner().unwrap();
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    std::io::Write::write_all(&mut encoder, &tar_bytes).unwrap();
    encoder.finish().unwrap()
}

fn sha(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Serve a single-layer bundle image; returns the digest-pinned reference.
async fn serve_bundle(server: &MockServer, repo: &str, files: &[(&str, &str)]) -> String {
    let layer = build_layer(files);
    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": format!("sha256:{}", "00".repeat(32)),
            "size": 2,
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "digest": sha(&layer),
            "size": layer.len(),
        }],
    })
    .to_string();
    let manifest_digest = sha(manifest.as_bytes());

    Mock::given(method("GET"))
        .and(path(format!("/v2/{repo}/manifests/{manifest_digest}")))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            manifest.clone(),
            "application/vnd.oci.image.manifest.v1+json",
        ))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{repo}/blobs/{}", sha(&layer))))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(layer.clone()))
        .mount(server)
        .await;

    format!("{}/{repo}@{manifest_digest}", server.address())
}

fn extension(name: &str, reference: &str) -> ClusterExtension {
    ClusterExtension {
        name: name.to_string(),
        uid: format!("uid-{name}"),
        generation: 1,
        spec: ClusterExtensionSpec {
            source: SourceConfig {
                source_type: SourceType::Image,
                image: ImageSource {
                    reference: reference.to_string(),
                    poll_interval_minutes: None,
                },
            },
            availability_mode: AvailabilityMode::Available,
            priority: 0,
            namespace: "test-namespace".to_string(),
            service_account: ServiceAccountRef {
                name: "installer".to_string(),
            },
            config: None,
            progress_deadline_minutes: None,
        },
        status: ClusterExtensionStatus::default(),
    }
}

fn superuser_rbac() -> RbacSnapshot {
    RbacSnapshot::new()
        .with_cluster_role(helion_api::ClusterRole {
            name: "admin".to_string(),
            rules: vec![PolicyRule::resource(&["*"], &["*"], &["*"])],
            aggregation_rule: None,
        })
        .with_cluster_role_binding(helion_api::ClusterRoleBinding {
            name: "admin-binding".to_string(),
            subjects: vec![helion_api::Subject {
                kind: "ServiceAccount".to_string(),
                name: "installer".to_string(),
                namespace: "test-namespace".to_string(),
                api_group: String::new(),
            }],
            role_ref: helion_api::RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: "admin".to_string(),
            },
        })
}

struct Harness {
    state: Arc<InMemoryClusterState>,
    objects: Arc<FakeCluster>,
    reconciler: Reconciler,
    _cache_dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let cache_dir = tempfile::tempdir().unwrap();
    let config = Config {
        cache_dir: cache_dir.path().to_path_buf(),
        ..Default::default()
    };
    let state = Arc::new(InMemoryClusterState::new());
    let objects = Arc::new(FakeCluster::new());
    let reconciler = Reconciler::new(config, state.clone(), objects.clone()).unwrap();
    Harness {
        state,
        objects,
        reconciler,
        _cache_dir: cache_dir,
    }
}

fn ready_condition(status: &ClusterExtensionStatus) -> &helion_api::Condition {
    find_condition(&status.conditions, condition_types::READY).expect("Ready condition")
}

const SIMPLE_MANIFEST: &str = r#"apiVersion: v1
kind: Namespace
metadata:
  name: workload-ns
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
data:
  key: value
"#;

#[tokio::test]
async fn test_successful_install() {
    let server = MockServer::start().await;
    let reference =
        serve_bundle(&server, "cat", &[("manifests/objects.yaml", SIMPLE_MANIFEST)]).await;

    let h = harness();
    h.state.set_rbac(superuser_rbac()).await;
    let ext = extension("cat", &reference);
    h.state.put_extension(ext.clone()).await;

    let outcome = h.reconciler.reconcile(&ext).await;
    assert_eq!(outcome, ReconcileOutcome::Done);

    let stored = h.state.extension("cat").await.unwrap();
    let ready = ready_condition(&stored.status);
    assert_eq!(ready.status, ConditionStatus::True);
    assert_eq!(ready.reason, condition_reasons::READY);
    assert!(stored.status.last_unpacked.is_some());
    assert_eq!(stored.status.resolved_source.as_deref(), Some(&reference[..]));

    // Both objects landed on the cluster; configmap got the install
    // namespace injected.
    assert_eq!(h.objects.len().await, 2);

    // A single revision exists and is ready.
    let revisions = h.state.revisions_of("uid-cat").await.unwrap();
    assert_eq!(revisions.len(), 1);
    assert_eq!(revisions[0].revision, 1);
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let server = MockServer::start().await;
    let reference =
        serve_bundle(&server, "cat", &[("manifests/objects.yaml", SIMPLE_MANIFEST)]).await;

    let h = harness();
    h.state.set_rbac(superuser_rbac()).await;
    let ext = extension("cat", &reference);
    h.state.put_extension(ext.clone()).await;

    assert_eq!(h.reconciler.reconcile(&ext).await, ReconcileOutcome::Done);
    let first = h.state.extension("cat").await.unwrap();

    let second_pass = h.state.extension("cat").await.unwrap();
    assert_eq!(
        h.reconciler.reconcile(&second_pass).await,
        ReconcileOutcome::Done
    );
    let second = h.state.extension("cat").await.unwrap();

    // Same revision, same object count, stable unpack timestamp.
    assert_eq!(
        h.state.revisions_of("uid-cat").await.unwrap().len(),
        1
    );
    assert_eq!(h.objects.len().await, 2);
    assert_eq!(first.status.last_unpacked, second.status.last_unpacked);
}

#[tokio::test]
async fn test_admission_rejects_poll_interval_on_pinned_ref() {
    let h = harness();
    let mut ext = extension(
        "cat",
        &format!("quay.example/cat@sha256:{}", "ab".repeat(32)),
    );
    ext.spec.source.image.poll_interval_minutes = Some(5);
    h.state.put_extension(ext.clone()).await;

    // Spec validation fails before the unpacker is ever consulted: no
    // registry stub exists, so reaching it would error differently.
    let outcome = h.reconciler.reconcile(&ext).await;
    assert_eq!(outcome, ReconcileOutcome::Done);

    let stored = h.state.extension("cat").await.unwrap();
    let ready = ready_condition(&stored.status);
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, condition_reasons::VALIDATION_FAILED);
    assert!(ready.message.contains("pollIntervalMinutes"));
    assert!(stored.status.resolved_source.is_none());
}

#[tokio::test]
async fn test_unavailable_extension_is_not_rolled_out() {
    let h = harness();
    let mut ext = extension(
        "cat",
        &format!("quay.example/cat@sha256:{}", "ab".repeat(32)),
    );
    ext.spec.availability_mode = AvailabilityMode::Unavailable;
    h.state.put_extension(ext.clone()).await;

    assert_eq!(h.reconciler.reconcile(&ext).await, ReconcileOutcome::Done);

    let stored = h.state.extension("cat").await.unwrap();
    let serving = find_condition(&stored.status.conditions, condition_types::SERVING).unwrap();
    assert_eq!(serving.status, ConditionStatus::False);
    assert_eq!(serving.reason, condition_reasons::UNAVAILABLE);
    assert!(h.objects.is_empty().await);
    assert!(h.state.revisions_of("uid-cat").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_name_only_reference_is_terminal() {
    let h = harness();
    let ext = extension("cat", "quay.example/cat");
    h.state.put_extension(ext.clone()).await;

    assert_eq!(h.reconciler.reconcile(&ext).await, ReconcileOutcome::Done);
    let stored = h.state.extension("cat").await.unwrap();
    let ready = ready_condition(&stored.status);
    assert_eq!(ready.reason, condition_reasons::INVALID_REFERENCE);
}

#[tokio::test]
async fn test_malformed_manifest_is_terminal() {
    let server = MockServer::start().await;
    let reference = serve_bundle(
        &server,
        "cat",
        &[(
            "manifests/objects.yaml",
            "apiVersion: example.io/v1\nkind: UnknownWidget\nmetadata: {name: w}\n",
        )],
    )
    .await;

    let h = harness();
    h.state.set_rbac(superuser_rbac()).await;
    let ext = extension("cat", &reference);
    h.state.put_extension(ext.clone()).await;

    assert_eq!(h.reconciler.reconcile(&ext).await, ReconcileOutcome::Done);
    let stored = h.state.extension("cat").await.unwrap();
    let ready = ready_condition(&stored.status);
    assert_eq!(ready.reason, condition_reasons::MALFORMED_MANIFEST);
    assert!(ready.message.contains("no resource mapping"));
}

const CRD_V1_FOO: &str = r#"apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: widgets.example.io
spec:
  group: example.io
  names: {kind: Widget, plural: widgets}
  scope: Namespaced
  versions:
    - name: v1
      served: true
      storage: true
      schema:
        openAPIV3Schema:
          type: object
          properties:
            spec:
              type: object
              properties:
                foo: {type: string}
"#;

const CRD_V1_EMPTY: &str = r#"apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: widgets.example.io
spec:
  group: example.io
  names: {kind: Widget, plural: widgets}
  scope: Namespaced
  versions:
    - name: v1
      served: true
      storage: true
      schema:
        openAPIV3Schema:
          type: object
          properties:
            spec:
              type: object
"#;

#[tokio::test]
async fn test_unsafe_crd_upgrade_is_refused() {
    let server = MockServer::start().await;
    let reference =
        serve_bundle(&server, "cat", &[("manifests/crd.yaml", CRD_V1_EMPTY)]).await;

    let h = harness();
    h.state.set_rbac(superuser_rbac()).await;
    // The cluster already has the CRD with ^.spec.foo; the bundle drops it.
    let current: CustomResourceDefinition =
        serde_json::from_value(serde_yaml_value(CRD_V1_FOO)).unwrap();
    h.state.put_crd(current).await;

    let ext = extension("cat", &reference);
    h.state.put_extension(ext.clone()).await;

    assert_eq!(h.reconciler.reconcile(&ext).await, ReconcileOutcome::Done);
    let stored = h.state.extension("cat").await.unwrap();
    let ready = ready_condition(&stored.status);
    assert_eq!(ready.reason, condition_reasons::SCHEMA_UNSAFE);
    assert!(ready
        .message
        .contains("field ^.spec.foo in existing not found in new"));
    assert!(h.objects.is_empty().await, "nothing may be applied");
}

#[tokio::test]
async fn test_safe_crd_install_gates_on_establishment() {
    let server = MockServer::start().await;
    let reference =
        serve_bundle(&server, "cat", &[("manifests/crd.yaml", CRD_V1_FOO)]).await;

    let h = harness();
    h.state.set_rbac(superuser_rbac()).await;
    let ext = extension("cat", &reference);
    h.state.put_extension(ext.clone()).await;

    // The CRD applies but is probe-gated until the apiserver establishes
    // it.
    assert_eq!(
        h.reconciler.reconcile(&ext).await,
        ReconcileOutcome::Progressing
    );
    let stored = h.state.extension("cat").await.unwrap();
    let ready = ready_condition(&stored.status);
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, condition_reasons::PROBE_FAILURE);
    assert!(ready.message.contains("established"));

    let crd_key = helion_rollout::object_key(&serde_json::json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": {"name": "widgets.example.io"},
    }))
    .unwrap();
    h.objects
        .patch(&crd_key, |value| {
            value["status"] = serde_json::json!({
                "conditions": [{"type": "Established", "status": "True"}],
            });
        })
        .await;

    let stored = h.state.extension("cat").await.unwrap();
    assert_eq!(h.reconciler.reconcile(&stored).await, ReconcileOutcome::Done);
    let stored = h.state.extension("cat").await.unwrap();
    assert_eq!(ready_condition(&stored.status).status, ConditionStatus::True);
}

#[tokio::test]
async fn test_config_validated_against_bundle_schema() {
    let schema = serde_json::json!({
        "type": "object",
        "properties": {
            "watchNamespace": {"type": "string", "format": "singleNamespaceInstallMode"},
        },
    })
    .to_string();
    let server = MockServer::start().await;
    let reference = serve_bundle(
        &server,
        "cat",
        &[
            ("manifests/objects.yaml", SIMPLE_MANIFEST),
            ("config/schema.json", &schema),
        ],
    )
    .await;

    let h = harness();
    h.state.set_rbac(superuser_rbac()).await;
    let mut ext = extension("cat", &reference);
    // watchNamespace must differ from the install namespace.
    ext.spec.config = Some(serde_json::json!({"watchNamespace": "test-namespace"}));
    h.state.put_extension(ext.clone()).await;

    assert_eq!(h.reconciler.reconcile(&ext).await, ReconcileOutcome::Done);
    let stored = h.state.extension("cat").await.unwrap();
    let ready = ready_condition(&stored.status);
    assert_eq!(ready.reason, condition_reasons::VALIDATION_FAILED);
    assert!(ready.message.contains("watchNamespace"));

    // A compliant value converges.
    let mut ext = stored;
    ext.spec.config = Some(serde_json::json!({"watchNamespace": "workloads"}));
    h.state.put_extension(ext.clone()).await;
    assert_eq!(h.reconciler.reconcile(&ext).await, ReconcileOutcome::Done);
    let stored = h.state.extension("cat").await.unwrap();
    assert_eq!(ready_condition(&stored.status).status, ConditionStatus::True);
}

#[tokio::test]
async fn test_registry_failure_is_transient() {
    let h = harness();
    // Tag resolution against a dead local registry: connection refused.
    let ext = extension("cat", "127.0.0.1:1/cat:v1");
    h.state.put_extension(ext.clone()).await;

    let outcome = h.reconciler.reconcile(&ext).await;
    assert_eq!(outcome, ReconcileOutcome::TransientFailure);

    let stored = h.state.extension("cat").await.unwrap();
    let ready = ready_condition(&stored.status);
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, condition_reasons::RECONCILING);
}

/// Parse YAML into a JSON value for fixtures.
fn serde_yaml_value(yaml: &str) -> serde_json::Value {
    let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
    serde_json::to_value(value).unwrap()
}
