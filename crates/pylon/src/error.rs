//! Runtime and domain error types.
//!
//! Two layers are kept apart on purpose:
//!
//! - [`Error`] is the crate-internal error for transport, registry and
//!   configuration failures. It never travels over the wire.
//! - [`PluginError`] is the structured `{message, code, info}` triple that a
//!   callable raises deliberately and that is serialized back to the host in
//!   a `RESPONSE` payload.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the runtime itself
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Wire error: {0}")]
    Wire(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Error codes shared with the host. The numeric values are part of the wire
// contract and must not be renumbered.
pub mod code {
    pub const NOT_AUTHENTICATED: i64 = 101;
    pub const PERMISSION_DENIED: i64 = 102;
    pub const ACCESS_KEY_NOT_ACCEPTED: i64 = 103;
    pub const ACCESS_TOKEN_NOT_ACCEPTED: i64 = 104;
    pub const INVALID_CREDENTIALS: i64 = 105;
    pub const INVALID_SIGNATURE: i64 = 106;
    pub const BAD_REQUEST: i64 = 107;
    pub const INVALID_ARGUMENT: i64 = 108;
    pub const DUPLICATED: i64 = 109;
    pub const RESOURCE_NOT_FOUND: i64 = 110;
    pub const NOT_SUPPORTED: i64 = 111;
    pub const NOT_IMPLEMENTED: i64 = 112;
    pub const CONSTRAINT_VIOLATED: i64 = 113;
    pub const INCOMPATIBLE_SCHEMA: i64 = 114;
    pub const ATOMIC_OPERATION_FAILURE: i64 = 115;
    pub const PARTIAL_OPERATION_FAILURE: i64 = 116;
    pub const UNDEFINED_OPERATION: i64 = 117;
    pub const PLUGIN_UNAVAILABLE: i64 = 118;
    pub const PLUGIN_TIMEOUT: i64 = 119;

    pub const UNEXPECTED_ERROR: i64 = 10000;
}

/// A structured error raised by plugin code (or the runtime on its behalf)
/// to signal that the requested operation was not successful.
///
/// Serializes to the `{"message", "code", "info"}` shape the host expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginError {
    pub message: String,
    pub code: i64,
    #[serde(default)]
    pub info: Map<String, Value>,
}

impl PluginError {
    pub fn new(message: impl Into<String>, code: i64) -> Self {
        Self {
            message: message.into(),
            code,
            info: Map::new(),
        }
    }

    /// An error with the generic "unexpected" code.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(message, code::UNEXPECTED_ERROR)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(message, code::INVALID_ARGUMENT)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(message, code::RESOURCE_NOT_FOUND)
    }

    pub fn with_info(mut self, key: impl Into<String>, value: Value) -> Self {
        self.info.insert(key.into(), value);
        self
    }

    /// The wire representation used inside a `RESPONSE` payload.
    pub fn as_value(&self) -> Value {
        json!({
            "message": self.message,
            "code": self.code,
            "info": Value::Object(self.info.clone()),
        })
    }
}

impl std::fmt::Display for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for PluginError {}

impl From<Error> for PluginError {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound(what) => PluginError::new(what, code::UNDEFINED_OPERATION),
            other => PluginError::unexpected(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_error_wire_shape() {
        let err = PluginError::invalid_argument("bad args")
            .with_info("arguments", json!(["a", "b"]));
        let value = err.as_value();
        assert_eq!(value["message"], "bad args");
        assert_eq!(value["code"], code::INVALID_ARGUMENT);
        assert_eq!(value["info"]["arguments"], json!(["a", "b"]));
    }

    #[test]
    fn test_plugin_error_roundtrip() {
        let err = PluginError::unexpected("boom");
        let parsed: PluginError =
            serde_json::from_value(serde_json::to_value(&err).unwrap()).unwrap();
        assert_eq!(parsed, err);
    }

    #[test]
    fn test_not_found_maps_to_undefined_operation() {
        let err: PluginError = Error::NotFound("no such op 'hello'".to_string()).into();
        assert_eq!(err.code, code::UNDEFINED_OPERATION);
    }
}
