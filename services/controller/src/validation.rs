//! Bundle configuration validation.
//!
//! When an extension carries inline `config`, it is validated against the
//! bundle-declared JSON schema before any rollout. Two custom formats are
//! namespace-sensitive, so a fresh validator is constructed per reconcile
//! with the install namespace captured; nothing is registered globally.

use thiserror::Error;

/// Format asserting the value equals the install namespace.
const OWN_NAMESPACE_FORMAT: &str = "ownNamespaceInstallMode";

/// Format asserting the value differs from the install namespace.
const SINGLE_NAMESPACE_FORMAT: &str = "singleNamespaceInstallMode";

#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("bundle declares no configuration schema but config was provided")]
    NoSchema,

    #[error("bundle configuration schema is invalid: {0}")]
    BadSchema(String),

    /// One message per offending field, aggregated.
    #[error("configuration is invalid: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Validate inline configuration against the bundle schema.
pub fn validate_config(
    schema: &serde_json::Value,
    config: &serde_json::Value,
    install_namespace: &str,
) -> Result<(), ConfigValidationError> {
    let own_namespace = install_namespace.to_string();
    let single_namespace = install_namespace.to_string();

    let validator = jsonschema::options()
        .should_validate_formats(true)
        .with_format(OWN_NAMESPACE_FORMAT, move |value: &str| {
            value == own_namespace
        })
        .with_format(SINGLE_NAMESPACE_FORMAT, move |value: &str| {
            value != single_namespace
        })
        .build(schema)
        .map_err(|e| ConfigValidationError::BadSchema(e.to_string()))?;

    let messages: Vec<String> = validator
        .iter_errors(config)
        .map(|error| {
            let path = error.instance_path().to_string();
            if path.is_empty() {
                error.to_string()
            } else {
                format!("{path}: {error}")
            }
        })
        .collect();

    if messages.is_empty() {
        Ok(())
    } else {
        Err(ConfigValidationError::Invalid(messages))
    }
}
