//! Validation errors for API resources.

use thiserror::Error;

/// A single admission or transition validation failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("field {field} is required")]
    Required { field: String },

    /// A field value is outside its allowed range or grammar.
    #[error("field {field} is invalid: {message}")]
    Invalid { field: String, message: String },

    /// Two fields are mutually exclusive.
    #[error("field {field} is forbidden: {message}")]
    Forbidden { field: String, message: String },

    /// An immutable field was changed after creation.
    #[error("field {field} is immutable")]
    Immutable { field: String },
}

impl ValidationError {
    pub fn required(field: impl Into<String>) -> Self {
        Self::Required {
            field: field.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn forbidden(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Forbidden {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn immutable(field: impl Into<String>) -> Self {
        Self::Immutable {
            field: field.into(),
        }
    }
}

/// All validation failures for one resource, reported together.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{}", join_errors(.0))]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    /// Wrap a non-empty error list, or return `Ok` for an empty one.
    pub fn into_result(errors: Vec<ValidationError>) -> Result<(), Self> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self(errors))
        }
    }

    pub fn errors(&self) -> &[ValidationError] {
        &self.0
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
