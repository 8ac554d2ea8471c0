//! Content-addressed local image cache.
//!
//! Layout: `<base>/<owner>/<algo:hex>/`. The digest-named directory is
//! itself the content address; there is no on-disk metadata file. A target
//! directory either does not exist or contains a fully applied filesystem:
//! failed applies delete the partial directory before returning.

use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::reference::{ImageReference, ReferenceError};
use crate::registry::{RegistryClient, RegistryConfig, RegistryError};

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid reference: {0}")]
    Reference(#[from] ReferenceError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to apply layer {digest}: {source}")]
    LayerApply {
        digest: String,
        #[source]
        source: std::io::Error,
    },

    #[error("image too large: compressed size {size} bytes exceeds limit {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),
}

impl StoreError {
    /// Terminal errors require a spec change; transient errors are retried
    /// with backoff.
    pub fn is_terminal(&self) -> bool {
        match self {
            StoreError::Reference(_) | StoreError::ImageTooLarge { .. } => true,
            StoreError::Registry(e) => e.is_terminal(),
            StoreError::LayerApply { .. } | StoreError::Filesystem(_) => false,
        }
    }
}

/// Configuration for the image store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root of the cache hierarchy.
    pub base_path: PathBuf,
    /// Registry client configuration.
    pub registry: RegistryConfig,
}

/// Content-addressed image store.
///
/// The store itself does not lock: the caller serializes unpacks per
/// `(owner, digest)`, and every operation is idempotent against retries on
/// an already-populated target.
pub struct ImageStore {
    base_path: PathBuf,
    client: RegistryClient,
    max_compressed_size: u64,
}

impl ImageStore {
    /// Create a store rooted at `config.base_path`, creating the root if
    /// missing. The cache survives process restarts; there is no teardown.
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.base_path)?;
        let client = RegistryClient::new(config.registry.clone())?;
        Ok(Self {
            base_path: config.base_path,
            client,
            max_compressed_size: config.registry.max_compressed_size,
        })
    }

    /// Resolve a reference to its digest-pinned form.
    ///
    /// Digest-pinned references pass through untouched; tagged references
    /// cost one manifest HEAD; name-only references are terminal errors.
    pub async fn resolve(
        &self,
        reference: &ImageReference,
    ) -> Result<ImageReference, StoreError> {
        if reference.is_digest_pinned() {
            return Ok(reference.clone());
        }
        if reference.is_name_only() {
            return Err(ReferenceError::NameOnly {
                reference: reference.to_string(),
            }
            .into());
        }
        let digest = self.client.head_manifest(reference).await?;
        debug!(reference = %reference, digest = %digest, "Resolved tag");
        Ok(reference.with_digest(digest))
    }

    /// Unpack a digest-pinned reference into the cache and return the
    /// directory path.
    ///
    /// Idempotent: an existing populated directory is returned as-is. After
    /// a successful unpack, sibling digest directories for the same owner
    /// are garbage collected.
    pub async fn unpack(
        &self,
        owner: &str,
        reference: &ImageReference,
    ) -> Result<PathBuf, StoreError> {
        let digest = reference.require_digest()?.clone();
        let target = self.digest_path(owner, &digest.to_string());

        if target.exists() {
            if target.is_dir() {
                debug!(owner = %owner, digest = %digest, "Image cache hit");
                self.gc_siblings(owner, &digest.to_string())?;
                return Ok(target);
            }
            // A stray file at the cache path cannot be a valid unpack.
            warn!(path = %target.display(), "Removing stray file at cache path");
            fs::remove_file(&target)?;
        }

        // Stage the OCI layout in a scoped temp directory so it is removed
        // on every path, including unwinds.
        let staging = tempfile::Builder::new()
            .prefix("pull-")
            .tempdir_in(&self.base_path)?;

        let manifest = self.client.get_manifest(reference, &digest).await?;
        let total_compressed = manifest.total_layer_size();
        if total_compressed > self.max_compressed_size {
            return Err(StoreError::ImageTooLarge {
                size: total_compressed,
                limit: self.max_compressed_size,
            });
        }
        info!(
            owner = %owner,
            digest = %digest,
            layer_count = manifest.layers.len(),
            total_compressed_bytes = total_compressed,
            "Pulling bundle image"
        );

        // Fetch all layers concurrently into the staging directory.
        let fetches = manifest.layers.iter().enumerate().map(|(i, layer)| {
            let dest = staging.path().join(format!("layer-{i}"));
            async move {
                self.client.get_blob(reference, &layer.digest, &dest).await?;
                Ok::<PathBuf, RegistryError>(dest)
            }
        });
        let layer_paths = futures_util::future::try_join_all(fetches).await?;

        fs::create_dir_all(&target)?;
        for (layer, path) in manifest.layers.iter().zip(&layer_paths) {
            if let Err(e) = apply_layer(path, &target) {
                // Partial state is impossible: delete before returning.
                fs::remove_dir_all(&target).ok();
                return Err(StoreError::LayerApply {
                    digest: layer.digest.clone(),
                    source: e,
                });
            }
        }

        self.gc_siblings(owner, &digest.to_string())?;
        info!(owner = %owner, digest = %digest, path = %target.display(), "Bundle unpacked");
        Ok(target)
    }

    /// Remove the entire cache subtree for one owner.
    pub fn cleanup(&self, owner: &str) -> Result<(), StoreError> {
        let dir = self.owner_path(owner);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            info!(owner = %owner, "Removed image cache subtree");
        }
        Ok(())
    }

    fn owner_path(&self, owner: &str) -> PathBuf {
        self.base_path.join(owner)
    }

    fn digest_path(&self, owner: &str, digest: &str) -> PathBuf {
        self.owner_path(owner).join(digest)
    }

    /// Remove sibling digest directories left over from earlier versions.
    fn gc_siblings(&self, owner: &str, keep: &str) -> Result<(), StoreError> {
        let dir = self.owner_path(owner);
        if !dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy() == keep {
                continue;
            }
            let path = entry.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match removed {
                Ok(()) => info!(owner = %owner, path = %path.display(), "Collected stale digest"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to collect stale digest"),
            }
        }
        Ok(())
    }
}

/// Apply one layer blob as a tar archive, auto-detecting gzip.
///
/// Ownership is rewritten to the current process identity and every
/// extracted mode is OR-ed with owner read-write-execute so nothing in the
/// cache is unreadable.
fn apply_layer(layer: &Path, dest: &Path) -> std::io::Result<()> {
    let file = fs::File::open(layer)?;
    let reader = std::io::BufReader::new(file);

    if is_gzip(layer)? {
        extract_archive(&mut Archive::new(GzDecoder::new(reader)), dest)
    } else {
        extract_archive(&mut Archive::new(reader), dest)
    }
}

/// Extract a tar archive handling OCI whiteouts.
fn extract_archive<R: Read>(archive: &mut Archive<R>, dest: &Path) -> std::io::Result<()> {
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(false);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        // Check for path traversal
        if path
            .components()
            .any(|c| c == std::path::Component::ParentDir)
        {
            warn!(path = %path.display(), "Skipping path with parent directory");
            continue;
        }

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        // Handle whiteout files
        if let Some(target_name) = file_name.strip_prefix(".wh.") {
            if target_name == ".opq" {
                // Opaque whiteout - remove entire directory contents
                if let Some(parent) = path.parent() {
                    let full_parent = dest.join(parent);
                    if full_parent.exists() {
                        for entry in fs::read_dir(&full_parent)? {
                            let entry = entry?;
                            let _ = fs::remove_dir_all(entry.path());
                            let _ = fs::remove_file(entry.path());
                        }
                    }
                }
            } else {
                // Regular whiteout - remove specific file
                if let Some(parent) = path.parent() {
                    let target = dest.join(parent).join(target_name);
                    let _ = fs::remove_file(&target);
                    let _ = fs::remove_dir_all(&target);
                }
            }
            continue;
        }

        let full_path = dest.join(&path);
        entry.unpack(&full_path)?;

        // OR the mode with 0o700 so the cache is always traversable by the
        // controller; symlink modes are meaningless and skipped.
        if !entry.header().entry_type().is_symlink() {
            let mode = entry.header().mode().unwrap_or(0o644);
            let metadata = fs::symlink_metadata(&full_path)?;
            if !metadata.file_type().is_symlink() {
                fs::set_permissions(&full_path, fs::Permissions::from_mode(mode | 0o700))?;
            }
        }
    }

    Ok(())
}

/// Check if a file is gzip compressed.
fn is_gzip(path: &Path) -> std::io::Result<bool> {
    let mut file = fs::File::open(path)?;
    let mut magic = [0u8; 2];
    if file.read_exact(&mut magic).is_ok() {
        Ok(magic == [0x1f, 0x8b])
    } else {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest as _, Sha256};
    use std::io::Write;
    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Build a gzipped tar layer from (path, contents, mode) triples.
    fn build_layer(entries: &[(&str, &str, u32)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, contents, mode) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(*mode);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_bytes())
                .unwrap();
        }
        let tar_bytes = builder.into_inner().unwrap();

        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn sha(bytes: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
    }

    /// Serve a manifest with the given layer blobs and return the pinned
    /// reference for it.
    async fn serve_image(server: &MockServer, repo: &str, layers: &[Vec<u8>]) -> ImageReference {
        let descriptors: Vec<serde_json::Value> = layers
            .iter()
            .map(|blob| {
                serde_json::json!({
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": sha(blob),
                    "size": blob.len(),
                })
            })
            .collect();
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": format!("sha256:{}", "00".repeat(32)),
                "size": 2,
            },
            "layers": descriptors,
        })
        .to_string();
        let manifest_digest = sha(manifest.as_bytes());

        Mock::given(method("GET"))
            .and(url_path(format!("/v2/{repo}/manifests/{manifest_digest}")))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                manifest.clone(),
                "application/vnd.oci.image.manifest.v1+json",
            ))
            .mount(server)
            .await;
        for blob in layers {
            Mock::given(method("GET"))
                .and(url_path(format!("/v2/{repo}/blobs/{}", sha(blob))))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(blob.clone()))
                .mount(server)
                .await;
        }

        let host = server.address().to_string();
        ImageReference::parse(&format!("{host}/{repo}@{manifest_digest}")).unwrap()
    }

    fn store_at(dir: &Path) -> ImageStore {
        ImageStore::new(StoreConfig {
            base_path: dir.to_path_buf(),
            registry: RegistryConfig::default(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_unpack_applies_layers_and_collects_siblings() {
        let server = MockServer::start().await;
        let layer = build_layer(&[("etc/config.yaml", "a: 1\n", 0o644)]);
        let reference = serve_image(&server, "cat/operator", &[layer]).await;

        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());

        // A stale sibling digest from a previous version.
        let stale = dir
            .path()
            .join("owner-1")
            .join(format!("sha256:{}", "11".repeat(32)));
        fs::create_dir_all(&stale).unwrap();

        let unpacked = store.unpack("owner-1", &reference).await.unwrap();
        assert!(unpacked.is_dir());
        assert_eq!(
            fs::read_to_string(unpacked.join("etc/config.yaml")).unwrap(),
            "a: 1\n"
        );
        assert!(!stale.exists(), "sibling digest must be collected");

        // No staging directories survive.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("pull-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_unpack_is_idempotent() {
        let server = MockServer::start().await;
        let layer = build_layer(&[("data.txt", "x", 0o644)]);
        let reference = serve_image(&server, "cat", &[layer]).await;

        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());

        let first = store.unpack("owner-1", &reference).await.unwrap();
        let marker = first.join("second-call-marker");
        fs::write(&marker, "untouched").unwrap();

        let second = store.unpack("owner-1", &reference).await.unwrap();
        assert_eq!(first, second);
        assert!(marker.exists(), "second unpack must not re-pull");
    }

    #[tokio::test]
    async fn test_unpack_requires_digest_pinned_ref() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let tagged = ImageReference::parse("quay.example/cat:v1").unwrap();

        let err = store.unpack("owner-1", &tagged).await.unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_resolve_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());

        // Digest-pinned: passthrough, no network.
        let pinned =
            ImageReference::parse(&format!("quay.example/cat@sha256:{}", "ab".repeat(32)))
                .unwrap();
        assert_eq!(store.resolve(&pinned).await.unwrap(), pinned);

        // Name-only: terminal.
        let bare = ImageReference::parse("quay.example/cat").unwrap();
        let err = store.resolve(&bare).await.unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_resolve_tag_via_head() {
        let server = MockServer::start().await;
        let digest = format!("sha256:{}", "ab".repeat(32));
        Mock::given(method("HEAD"))
            .and(url_path("/v2/cat/manifests/v1"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("Docker-Content-Digest", digest.as_str()),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let host = server.address().to_string();
        let tagged = ImageReference::parse(&format!("{host}/cat:v1")).unwrap();

        let resolved = store.resolve(&tagged).await.unwrap();
        assert!(resolved.is_digest_pinned());
        assert_eq!(resolved.digest().unwrap().to_string(), digest);
    }

    #[tokio::test]
    async fn test_stray_file_at_cache_path_is_replaced() {
        let server = MockServer::start().await;
        let layer = build_layer(&[("data.txt", "fresh", 0o644)]);
        let reference = serve_image(&server, "cat", &[layer]).await;

        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());

        let digest = reference.digest().unwrap().to_string();
        let target = dir.path().join("owner-1").join(&digest);
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, "stray").unwrap();

        let unpacked = store.unpack("owner-1", &reference).await.unwrap();
        assert!(unpacked.is_dir());
        assert_eq!(fs::read_to_string(unpacked.join("data.txt")).unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_failed_apply_removes_partial_target() {
        let server = MockServer::start().await;
        let good = build_layer(&[("kept.txt", "ok", 0o644)]);
        let garbage = b"this is not a tar archive at all".to_vec();
        let reference = serve_image(&server, "cat", &[good, garbage]).await;

        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());

        let err = store.unpack("owner-1", &reference).await.unwrap_err();
        assert!(matches!(err, StoreError::LayerApply { .. }));
        assert!(!err.is_terminal());

        let digest = reference.digest().unwrap().to_string();
        assert!(
            !dir.path().join("owner-1").join(&digest).exists(),
            "partial target must be deleted"
        );
    }

    #[tokio::test]
    async fn test_whiteouts_remove_earlier_content() {
        let server = MockServer::start().await;
        let base = build_layer(&[
            ("a.txt", "gone", 0o644),
            ("d/keep-then-clear.txt", "gone", 0o644),
        ]);
        let upper = build_layer(&[(".wh.a.txt", "", 0o644), ("d/.wh..opq", "", 0o644)]);
        let reference = serve_image(&server, "cat", &[base, upper]).await;

        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());

        let unpacked = store.unpack("owner-1", &reference).await.unwrap();
        assert!(!unpacked.join("a.txt").exists());
        assert!(unpacked.join("d").is_dir());
        assert_eq!(fs::read_dir(unpacked.join("d")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_modes_are_owner_accessible() {
        let server = MockServer::start().await;
        let layer = build_layer(&[("locked.txt", "secret", 0o000)]);
        let reference = serve_image(&server, "cat", &[layer]).await;

        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());

        let unpacked = store.unpack("owner-1", &reference).await.unwrap();
        let mode = fs::metadata(unpacked.join("locked.txt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o700, 0o700);
    }

    #[tokio::test]
    async fn test_oversized_image_is_refused_before_pull() {
        let server = MockServer::start().await;
        let layer = build_layer(&[("data.txt", "small but over the limit", 0o644)]);
        let reference = serve_image(&server, "cat", &[layer]).await;

        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(StoreConfig {
            base_path: dir.path().to_path_buf(),
            registry: RegistryConfig {
                max_compressed_size: 1,
                ..Default::default()
            },
        })
        .unwrap();

        let err = store.unpack("owner-1", &reference).await.unwrap_err();
        assert!(matches!(err, StoreError::ImageTooLarge { limit: 1, .. }));
        assert!(err.is_terminal());
        assert!(
            !dir.path().join("owner-1").exists(),
            "nothing may reach the cache"
        );
    }

    #[tokio::test]
    async fn test_cleanup_removes_owner_subtree() {
        let server = MockServer::start().await;
        let layer = build_layer(&[("data.txt", "x", 0o644)]);
        let reference = serve_image(&server, "cat", &[layer]).await;

        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());

        store.unpack("owner-1", &reference).await.unwrap();
        assert!(dir.path().join("owner-1").exists());

        store.cleanup("owner-1").unwrap();
        assert!(!dir.path().join("owner-1").exists());

        // Cleaning an absent owner is a no-op.
        store.cleanup("owner-1").unwrap();
    }
}
