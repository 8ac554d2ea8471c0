//! Loading unpacked bundle contents from the image cache.
//!
//! A bundle directory carries its objects under `manifests/` (any mix of
//! YAML and JSON files, concatenated in name order) and may declare a JSON
//! schema for its configuration at `config/schema.json`.

use std::fs;
use std::path::Path;

use thiserror::Error;

const MANIFESTS_DIR: &str = "manifests";
const CONFIG_SCHEMA_PATH: &str = "config/schema.json";

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("bundle has no {MANIFESTS_DIR}/ directory")]
    NoManifests,

    #[error("I/O error reading bundle: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config schema: {0}")]
    MalformedSchema(#[from] serde_json::Error),
}

/// The materialized contents of one unpacked bundle.
#[derive(Debug, Clone)]
pub struct Bundle {
    /// All manifest documents, concatenated into one YAML stream.
    pub manifest_stream: String,
    /// The bundle-declared configuration schema, if any.
    pub config_schema: Option<serde_json::Value>,
}

/// Load a bundle from its unpacked cache directory.
pub fn load_bundle(dir: &Path) -> Result<Bundle, BundleError> {
    let manifests_dir = dir.join(MANIFESTS_DIR);
    if !manifests_dir.is_dir() {
        return Err(BundleError::NoManifests);
    }

    let mut files: Vec<_> = fs::read_dir(&manifests_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| matches!(e, "yaml" | "yml" | "json"))
        })
        .collect();
    files.sort();

    let mut manifest_stream = String::new();
    for file in files {
        let contents = fs::read_to_string(&file)?;
        if !manifest_stream.is_empty() {
            manifest_stream.push_str("\n---\n");
        }
        manifest_stream.push_str(&contents);
    }

    let schema_path = dir.join(CONFIG_SCHEMA_PATH);
    let config_schema = if schema_path.is_file() {
        Some(serde_json::from_str(&fs::read_to_string(&schema_path)?)?)
    } else {
        None
    };

    Ok(Bundle {
        manifest_stream,
        config_schema,
    })
}
