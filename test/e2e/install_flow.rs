//! End-to-end install scenarios.
//!
//! These tests run the full controller flow against a stubbed OCI registry,
//! the in-memory control plane and the fake object cluster:
//!
//! 1. A successful install reaches `Ready=True` with a populated cache.
//! 2. An installer without rights gets the exact missing-rule report.
//! 3. A phased rollout gates on probes and recovers when they pass.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p helion-e2e --test install_flow
//! ```

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
use helion_rbac::{pre_authorize, RbacSnapshot};
use helion_rollout::{object_key, FakeCluster, ObjectClient};

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
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    std::io::Write::write_all(&mut encoder, &tar_bytes).unwrap();
    encoder.finish().unwrap()
}

fn sha(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

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

fn rbac_granting(rules: Vec<PolicyRule>) -> RbacSnapshot {
    RbacSnapshot::new()
        .with_cluster_role(helion_api::ClusterRole {
            name: "installer-role".to_string(),
            rules,
            aggregation_rule: None,
        })
        .with_cluster_role_binding(helion_api::ClusterRoleBinding {
            name: "installer-binding".to_string(),
            subjects: vec![helion_api::Subject {
                kind: "ServiceAccount".to_string(),
                name: "installer".to_string(),
                namespace: "test-namespace".to_string(),
                api_group: String::new(),
            }],
            role_ref: helion_api::RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: "installer-role".to_string(),
            },
        })
}

struct Harness {
    state: Arc<InMemoryClusterState>,
    objects: Arc<FakeCluster>,
    reconciler: Reconciler,
    cache_dir: tempfile::TempDir,
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
        cache_dir,
    }
}

/// S1: a successful install reaches Ready with a populated content-addressed
/// cache and recorded unpack time.
#[tokio::test]
async fn successful_install() {
    let server = MockServer::start().await;
    let manifest = r#"apiVersion: v1
kind: Namespace
metadata:
  name: cat-system
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: cat-operator
"#;
    let reference = serve_bundle(&server, "cat", &[("manifests/all.yaml", manifest)]).await;

    let h = harness();
    h.state
        .set_rbac(rbac_granting(vec![PolicyRule::resource(
            &["*"],
            &["*"],
            &["*"],
        )]))
        .await;
    let ext = extension("cat", &reference);
    h.state.put_extension(ext.clone()).await;

    assert_eq!(h.reconciler.reconcile(&ext).await, ReconcileOutcome::Done);

    let stored = h.state.extension("cat").await.unwrap();
    let ready = find_condition(&stored.status.conditions, condition_types::READY).unwrap();
    assert_eq!(ready.status, ConditionStatus::True);
    assert_eq!(ready.reason, condition_reasons::READY);
    assert!(stored.status.last_unpacked.is_some());

    // The cache directory exists under <base>/<owner>/<digest> with no
    // sibling digests.
    let digest = reference.rsplit_once('@').unwrap().1;
    let owner_dir = h.cache_dir.path().join("cat");
    assert!(owner_dir.join(digest).is_dir());
    assert_eq!(std::fs::read_dir(&owner_dir).unwrap().count(), 1);

    // Both objects exist and are owned by revision 1.
    let ns_key = object_key(&serde_json::json!({
        "apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "cat-system"},
    }))
    .unwrap();
    let stored_ns = h.objects.get(&ns_key).await.unwrap().unwrap();
    let refs = helion_rollout::owner_references(&stored_ns);
    assert_eq!(helion_rollout::controller_of(&refs).unwrap().name, "cat-1");
}

/// S2: an installer with trivially empty rules gets the full missing-rule
/// report, grouped, compacted and sorted.
#[tokio::test]
async fn missing_rbac_report() {
    let manifest = r#"
apiVersion: v1
kind: Service
metadata:
  name: test-service
  namespace: test-namespace
spec:
  ports: [{port: 80}]
---
apiVersion: rbac.authorization.k8s.io/v1
kind: Role
metadata:
  name: cm-reader
  namespace: test-namespace
rules:
  - apiGroups: [""]
    resources: ["configmaps"]
    verbs: ["get", "list"]
---
apiVersion: rbac.authorization.k8s.io/v1
kind: RoleBinding
metadata:
  name: cm-reader-binding
  namespace: test-namespace
subjects:
  - kind: ServiceAccount
    name: app
    namespace: test-namespace
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: Role
  name: cm-reader
"#;
    let decoded =
        helion_manifest::decode_manifest(manifest, &helion_manifest::DecodeOptions::default())
            .unwrap();

    let snapshot = rbac_granting(vec![PolicyRule::resource(&[""], &[""], &[""])]);
    let user = helion_api::UserInfo::service_account("test-namespace", "installer");
    let outcome = pre_authorize(&snapshot, &user, &decoded);
    assert!(!outcome.is_authorized());

    // Namespaced scope: all seven verbs for services.
    let namespaced = outcome.missing_in("test-namespace").unwrap();
    let services = namespaced
        .rules
        .iter()
        .find(|r| r.resources == vec!["services"])
        .unwrap();
    assert_eq!(
        services.verbs,
        vec!["create", "delete", "get", "list", "patch", "update", "watch"]
    );
    assert_eq!(services.api_groups, vec![""]);

    // Cluster scope: the collection verbs.
    let cluster = outcome.missing_in("").unwrap();
    let services = cluster
        .rules
        .iter()
        .find(|r| r.resources == vec!["services"])
        .unwrap();
    assert_eq!(services.verbs, vec!["create", "list", "watch"]);

    // The full controller pass surfaces it as ValidationFailed.
    let server = MockServer::start().await;
    let reference = serve_bundle(&server, "cat", &[("manifests/all.yaml", manifest)]).await;
    let h = harness();
    h.state
        .set_rbac(rbac_granting(vec![PolicyRule::resource(&[""], &[""], &[""])]))
        .await;
    let ext = extension("cat", &reference);
    h.state.put_extension(ext.clone()).await;

    assert_eq!(h.reconciler.reconcile(&ext).await, ReconcileOutcome::Done);
    let stored = h.state.extension("cat").await.unwrap();
    let ready = find_condition(&stored.status.conditions, condition_types::READY).unwrap();
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, condition_reasons::VALIDATION_FAILED);
    assert!(ready.message.contains("services"));
    assert!(ready.message.contains("not authorized"));
    assert!(h.objects.is_empty().await, "nothing may be applied");
}

/// S6: a two-phase rollout holds at the deployment probe, reports the
/// failing probe, and completes once the probe passes.
#[tokio::test]
async fn phased_rollout_probe_gating() {
    let server = MockServer::start().await;
    let manifest = r#"apiVersion: v1
kind: Namespace
metadata:
  name: y
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: x
  namespace: y
spec:
  replicas: 1
"#;
    let reference = serve_bundle(&server, "cat", &[("manifests/all.yaml", manifest)]).await;

    let h = harness();
    h.state
        .set_rbac(rbac_granting(vec![PolicyRule::resource(
            &["*"],
            &["*"],
            &["*"],
        )]))
        .await;
    let ext = extension("cat", &reference);
    h.state.put_extension(ext.clone()).await;

    // First pass: the namespaces phase applies and passes; the deploy
    // phase waits on the deployment's availability probe.
    assert_eq!(
        h.reconciler.reconcile(&ext).await,
        ReconcileOutcome::Progressing
    );
    let stored = h.state.extension("cat").await.unwrap();
    let ready = find_condition(&stored.status.conditions, condition_types::READY).unwrap();
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, condition_reasons::PROBE_FAILURE);
    assert!(ready.message.contains("Deployment y/x"));
    let progressing =
        find_condition(&stored.status.conditions, condition_types::PROGRESSING).unwrap();
    assert_eq!(progressing.status, ConditionStatus::True);

    // The namespace from phase one exists even while phase two waits.
    let ns_key = object_key(&serde_json::json!({
        "apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "y"},
    }))
    .unwrap();
    assert!(h.objects.contains(&ns_key).await);

    // The deployment becomes available.
    let deploy_key = object_key(&serde_json::json!({
        "apiVersion": "apps/v1", "kind": "Deployment",
        "metadata": {"name": "x", "namespace": "y"},
    }))
    .unwrap();
    h.objects
        .patch(&deploy_key, |value| {
            value["status"] = serde_json::json!({
                "conditions": [{"type": "Available", "status": "True"}],
            });
        })
        .await;

    let stored = h.state.extension("cat").await.unwrap();
    assert_eq!(h.reconciler.reconcile(&stored).await, ReconcileOutcome::Done);
    let stored = h.state.extension("cat").await.unwrap();
    let ready = find_condition(&stored.status.conditions, condition_types::READY).unwrap();
    assert_eq!(ready.status, ConditionStatus::True);
    assert_eq!(ready.reason, condition_reasons::READY);
}

/// Upgrading to a new bundle digest cuts revision 2, transitions shared
/// object ownership, archives revision 1 and garbage-collects the old
/// cache directory.
#[tokio::test]
async fn upgrade_cuts_new_revision_and_archives_old() {
    let server = MockServer::start().await;
    let v1_manifest = r#"apiVersion: v1
kind: Namespace
metadata:
  name: cat-system
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: v1-only
  namespace: cat-system
"#;
    let v2_manifest = r#"apiVersion: v1
kind: Namespace
metadata:
  name: cat-system
"#;
    let v1_ref = serve_bundle(&server, "cat", &[("manifests/all.yaml", v1_manifest)]).await;
    let v2_ref = serve_bundle(&server, "cat", &[("manifests/all.yaml", v2_manifest)]).await;

    let h = harness();
    h.state
        .set_rbac(rbac_granting(vec![PolicyRule::resource(
            &["*"],
            &["*"],
            &["*"],
        )]))
        .await;
    let ext = extension("cat", &v1_ref);
    h.state.put_extension(ext.clone()).await;
    assert_eq!(h.reconciler.reconcile(&ext).await, ReconcileOutcome::Done);

    let cm_key = object_key(&serde_json::json!({
        "apiVersion": "v1", "kind": "ConfigMap",
        "metadata": {"name": "v1-only", "namespace": "cat-system"},
    }))
    .unwrap();
    assert!(h.objects.contains(&cm_key).await);

    // Point the spec at the new bundle.
    let mut upgraded = h.state.extension("cat").await.unwrap();
    upgraded.spec.source.image.reference = v2_ref.clone();
    h.state.put_extension(upgraded.clone()).await;
    assert_eq!(h.reconciler.reconcile(&upgraded).await, ReconcileOutcome::Done);

    let revisions = h.state.revisions_of("uid-cat").await.unwrap();
    assert_eq!(revisions.len(), 2);
    assert!(revisions[0].is_archived());
    assert!(!revisions[1].is_archived());

    // The namespace transitioned to revision 2; the v1-only object was
    // deleted with its archived owner.
    let ns_key = object_key(&serde_json::json!({
        "apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "cat-system"},
    }))
    .unwrap();
    let ns = h.objects.get(&ns_key).await.unwrap().unwrap();
    let refs = helion_rollout::owner_references(&ns);
    assert_eq!(helion_rollout::controller_of(&refs).unwrap().name, "cat-2");
    assert!(!h.objects.contains(&cm_key).await);
    assert_eq!(revisions[1].adoption_log.len(), 1);

    // Exactly one digest directory remains for the owner.
    let owner_dir = h.cache_dir.path().join("cat");
    let digests: Vec<_> = std::fs::read_dir(&owner_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(digests, vec![v2_ref.rsplit_once('@').unwrap().1.to_string()]);
}
