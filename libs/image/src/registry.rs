//! OCI distribution client for resolving and pulling bundle images.
//!
//! Implements the subset of the distribution protocol the store needs:
//! manifest HEAD (tag → digest resolution), manifest GET with digest
//! verification, and digest-verified blob downloads staged through a
//! temporary file.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::reference::{Digest, ImageReference, ReferenceError};

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json";

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid reference: {0}")]
    Reference(#[from] ReferenceError),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    #[error("registry authentication failed for {registry}")]
    Auth { registry: String },

    #[error("request timeout")]
    Timeout,
}

impl RegistryError {
    /// Terminal errors cannot be fixed by retrying; everything else is a
    /// transient registry condition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RegistryError::Reference(_)
                | RegistryError::ManifestNotFound(_)
                | RegistryError::DigestMismatch { .. }
        )
    }
}

/// Configuration for the registry client.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Optional bearer token presented to the registry.
    pub auth_token: Option<String>,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Per-layer download timeout.
    pub layer_timeout: Duration,
    /// Maximum total compressed layer size accepted for one image.
    pub max_compressed_size: u64,
    /// Hosts contacted over plain HTTP (local registries, test stubs).
    pub plain_http_hosts: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            auth_token: None,
            request_timeout: Duration::from_secs(60),
            layer_timeout: Duration::from_secs(300),
            max_compressed_size: 10 * 1024 * 1024 * 1024, // 10 GiB
            plain_http_hosts: Vec::new(),
        }
    }
}

/// OCI distribution client.
pub struct RegistryClient {
    config: RegistryConfig,
    client: Client,
}

impl RegistryClient {
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    fn base_url(&self, registry: &str) -> String {
        let plain = registry.starts_with("localhost")
            || registry.starts_with("127.")
            || self
                .config
                .plain_http_hosts
                .iter()
                .any(|h| h == registry);
        if plain {
            format!("http://{registry}")
        } else {
            format!("https://{registry}")
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth_token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    /// Resolve a tagged reference to its manifest digest with a HEAD
    /// request; never pulls content.
    pub async fn head_manifest(
        &self,
        reference: &ImageReference,
    ) -> Result<Digest, RegistryError> {
        let target = reference
            .digest()
            .map(|d| d.to_string())
            .or_else(|| reference.tag().map(|t| t.to_string()))
            .ok_or_else(|| ReferenceError::NameOnly {
                reference: reference.to_string(),
            })?;
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(reference.registry()),
            reference.repository(),
            target
        );
        debug!(url = %url, "Resolving manifest digest");

        let request = self
            .authorize(self.client.head(&url))
            .header("Accept", MANIFEST_ACCEPT);
        let response = request.send().await?;

        match response.status() {
            StatusCode::OK => {
                let header = response
                    .headers()
                    .get("Docker-Content-Digest")
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| RegistryError::ManifestNotFound(target.clone()))?;
                Ok(Digest::parse(header)?)
            }
            StatusCode::NOT_FOUND => Err(RegistryError::ManifestNotFound(target)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RegistryError::Auth {
                registry: reference.registry().to_string(),
            }),
            _ => Err(RegistryError::Http(response.error_for_status().unwrap_err())),
        }
    }

    /// Pull an image manifest by digest, verifying the body hash.
    pub async fn get_manifest(
        &self,
        reference: &ImageReference,
        digest: &Digest,
    ) -> Result<Manifest, RegistryError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(reference.registry()),
            reference.repository(),
            digest
        );
        debug!(url = %url, "Pulling manifest");

        let request = self
            .authorize(self.client.get(&url))
            .header("Accept", MANIFEST_ACCEPT);
        let response = request.send().await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.bytes().await?;
                let computed = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
                if computed != digest.to_string() {
                    return Err(RegistryError::DigestMismatch {
                        expected: digest.to_string(),
                        actual: computed,
                    });
                }
                let manifest: Manifest = serde_json::from_slice(&body)?;
                Ok(manifest)
            }
            StatusCode::NOT_FOUND => Err(RegistryError::ManifestNotFound(digest.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RegistryError::Auth {
                registry: reference.registry().to_string(),
            }),
            _ => Err(RegistryError::Http(response.error_for_status().unwrap_err())),
        }
    }

    /// Download a blob by digest to a file, verifying the hash.
    ///
    /// The blob is staged to a `.tmp` sibling and renamed into place only
    /// after verification.
    pub async fn get_blob(
        &self,
        reference: &ImageReference,
        digest: &str,
        dest: &Path,
    ) -> Result<u64, RegistryError> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base_url(reference.registry()),
            reference.repository(),
            digest
        );
        debug!(url = %url, dest = %dest.display(), "Pulling blob");

        let request = self.authorize(self.client.get(&url));
        let response = tokio::time::timeout(self.config.layer_timeout, request.send())
            .await
            .map_err(|_| RegistryError::Timeout)??;

        match response.status() {
            StatusCode::OK => {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }

                let temp_path = dest.with_extension("tmp");
                let mut file = std::fs::File::create(&temp_path)?;
                let mut hasher = Sha256::new();

                let bytes = response.bytes().await?;
                let total_bytes = bytes.len() as u64;
                hasher.update(&bytes);
                file.write_all(&bytes)?;
                file.sync_all()?;
                drop(file);

                let computed = format!("sha256:{}", hex::encode(hasher.finalize()));
                if computed != digest {
                    std::fs::remove_file(&temp_path).ok();
                    return Err(RegistryError::DigestMismatch {
                        expected: digest.to_string(),
                        actual: computed,
                    });
                }

                std::fs::rename(&temp_path, dest)?;

                info!(digest = %digest, size = total_bytes, "Blob downloaded");
                Ok(total_bytes)
            }
            StatusCode::NOT_FOUND => Err(RegistryError::ManifestNotFound(digest.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RegistryError::Auth {
                registry: reference.registry().to_string(),
            }),
            _ => Err(RegistryError::Http(response.error_for_status().unwrap_err())),
        }
    }
}

/// OCI image manifest.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// Content descriptor.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

impl Manifest {
    /// Total compressed size of all layers.
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}
