//! Error types for vocab-core.

use serde_json::Value;
use thiserror::Error;

/// Errors raised by the strict decoders when a container has the wrong shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("expected {expected} at `{path}`, found {found}")]
    WrongType {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("entry `{key}` in `{path}` is {found}, not an object")]
    MalformedEntry {
        path: String,
        key: String,
        found: &'static str,
    },
}

/// A review quality outside the 0-5 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("quality must be between 0 and 5, got {0}")]
pub struct QualityError(pub u8);

/// Human-readable name for the JSON kind of a value.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
