//! Per-field change validators.
//!
//! Validators run in sequence over a working copy of the diff. Each one
//! consumes exactly its own keyword (resetting it on both sides) and
//! reports the unsafe directions for that keyword. As soon as the working
//! copy's sides are equal the diff is fully handled; a diff no chain member
//! consumes is refused.

use thiserror::Error;

use crate::diff::FieldDiff;

/// An upgrade-safety violation at one schema path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SafetyError {
    #[error("field {path}: {message}")]
    UnsafeChange { path: String, message: String },

    #[error("field {path}: refusing to determine that change is safe")]
    Unhandled { path: String },
}

type Validator = fn(&mut FieldDiff) -> Option<String>;

/// The validator chain, in keyword order.
const VALIDATORS: &[Validator] = &[
    check_enum,
    check_required,
    check_maximum,
    check_max_length,
    check_max_items,
    check_max_properties,
    check_minimum,
    check_min_length,
    check_min_items,
    check_min_properties,
    check_default,
    check_type,
    check_description,
];

/// Classify one field diff, returning every violation found.
///
/// A diff with differences left after the whole chain has run is reported
/// as unhandled: the engine refuses to determine that such a change is
/// safe.
pub fn validate_field_diff(diff: &FieldDiff) -> Vec<SafetyError> {
    let mut working = diff.clone();
    let mut errors = Vec::new();
    let mut handled = false;

    for validator in VALIDATORS {
        if let Some(message) = validator(&mut working) {
            errors.push(SafetyError::UnsafeChange {
                path: diff.path.clone(),
                message,
            });
        }
        if working.old == working.new {
            handled = true;
            break;
        }
    }

    if !handled {
        errors.push(SafetyError::Unhandled {
            path: diff.path.clone(),
        });
    }
    errors
}

fn check_enum(diff: &mut FieldDiff) -> Option<String> {
    let old = std::mem::take(&mut diff.old.enum_values);
    let new = std::mem::take(&mut diff.new.enum_values);
    if old == new {
        return None;
    }
    if old.is_empty() && !new.is_empty() {
        return Some(format!(
            "enum constraint [{}] added when there were no restrictions",
            render_values(&new)
        ));
    }
    let removed: Vec<&serde_json::Value> = old.iter().filter(|v| !new.contains(v)).collect();
    if !removed.is_empty() {
        return Some(format!(
            "enum values removed: [{}]",
            removed
                .iter()
                .map(|v| render_value(v))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    // Values only added to an existing enum widen the field.
    None
}

fn check_required(diff: &mut FieldDiff) -> Option<String> {
    let old = std::mem::take(&mut diff.old.required);
    let new = std::mem::take(&mut diff.new.required);
    let added: Vec<&String> = new.iter().filter(|f| !old.contains(f)).collect();
    if added.is_empty() {
        return None;
    }
    Some(format!(
        "new required fields added: [{}]",
        added
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    ))
}

/// Upper bounds: adding the constraint or decreasing it is unsafe.
fn check_upper_bound<T: PartialOrd + std::fmt::Display>(
    keyword: &str,
    old: Option<T>,
    new: Option<T>,
) -> Option<String> {
    match (old, new) {
        (None, Some(n)) => Some(format!(
            "{keyword} constraint {n} added when there were no restrictions"
        )),
        (Some(o), Some(n)) if n < o => Some(format!("{keyword} decreased from {o} to {n}")),
        _ => None,
    }
}

/// Lower bounds: adding the constraint or increasing it is unsafe.
fn check_lower_bound<T: PartialOrd + std::fmt::Display>(
    keyword: &str,
    old: Option<T>,
    new: Option<T>,
) -> Option<String> {
    match (old, new) {
        (None, Some(n)) => Some(format!(
            "{keyword} constraint {n} added when there were no restrictions"
        )),
        (Some(o), Some(n)) if n > o => Some(format!("{keyword} increased from {o} to {n}")),
        _ => None,
    }
}

fn check_maximum(diff: &mut FieldDiff) -> Option<String> {
    check_upper_bound("maximum", diff.old.maximum.take(), diff.new.maximum.take())
}

fn check_max_length(diff: &mut FieldDiff) -> Option<String> {
    check_upper_bound(
        "maxLength",
        diff.old.max_length.take(),
        diff.new.max_length.take(),
    )
}

fn check_max_items(diff: &mut FieldDiff) -> Option<String> {
    check_upper_bound(
        "maxItems",
        diff.old.max_items.take(),
        diff.new.max_items.take(),
    )
}

fn check_max_properties(diff: &mut FieldDiff) -> Option<String> {
    check_upper_bound(
        "maxProperties",
        diff.old.max_properties.take(),
        diff.new.max_properties.take(),
    )
}

fn check_minimum(diff: &mut FieldDiff) -> Option<String> {
    check_lower_bound("minimum", diff.old.minimum.take(), diff.new.minimum.take())
}

fn check_min_length(diff: &mut FieldDiff) -> Option<String> {
    check_lower_bound(
        "minLength",
        diff.old.min_length.take(),
        diff.new.min_length.take(),
    )
}

fn check_min_items(diff: &mut FieldDiff) -> Option<String> {
    check_lower_bound(
        "minItems",
        diff.old.min_items.take(),
        diff.new.min_items.take(),
    )
}

fn check_min_properties(diff: &mut FieldDiff) -> Option<String> {
    check_lower_bound(
        "minProperties",
        diff.old.min_properties.take(),
        diff.new.min_properties.take(),
    )
}

fn check_default(diff: &mut FieldDiff) -> Option<String> {
    let old = diff.old.default.take();
    let new = diff.new.default.take();
    match (old, new) {
        (None, Some(n)) => Some(format!("default value {} added", render_value(&n))),
        (Some(o), None) => Some(format!("default value {} removed", render_value(&o))),
        (Some(o), Some(n)) if o != n => Some(format!(
            "default value changed from {} to {}",
            render_value(&o),
            render_value(&n)
        )),
        _ => None,
    }
}

fn check_type(diff: &mut FieldDiff) -> Option<String> {
    let old = diff.old.schema_type.take();
    let new = diff.new.schema_type.take();
    if old == new {
        return None;
    }
    Some(format!(
        "type changed from {:?} to {:?}",
        old.as_deref().unwrap_or(""),
        new.as_deref().unwrap_or("")
    ))
}

/// Description changes are cosmetic: consumed, never an error.
fn check_description(diff: &mut FieldDiff) -> Option<String> {
    diff.old.description.take();
    diff.new.description.take();
    None
}

fn render_values(values: &[serde_json::Value]) -> String {
    values
        .iter()
        .map(render_value)
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_value(value: &serde_json::Value) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    }
}
