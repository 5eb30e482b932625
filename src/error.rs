//! Error types for FTL2.
//!
//! This module defines the error types used throughout FTL2, carrying every
//! kind a caller needs to branch on (the failure taxonomy of the executor,
//! the fan-out aggregation, context-entry validation) without ever erasing
//! the kind behind a formatted string.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for FTL2 operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for FTL2.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Context-entry errors (fatal; abort the context)
    // ========================================================================
    /// Malformed inventory document.
    #[error("inventory invalid: {0}")]
    InventoryInvalid(String),

    /// A secret referenced by a binding could not be resolved. Fail closed.
    #[error("secret '{0}' could not be resolved")]
    SecretMissing(String),

    /// Malformed policy document.
    #[error("policy invalid: {0}")]
    PolicyInvalid(String),

    /// The audit file configured for replay exists but is malformed.
    #[error("audit log at '{0}' is malformed, refusing to start replay")]
    AuditCorrupt(PathBuf),

    // ========================================================================
    // Per-call errors
    // ========================================================================
    /// A deny rule matched for this call.
    #[error("policy denied: {0}")]
    PolicyDenied(String),

    /// Dependency resolution or archive packaging failed while building a bundle.
    #[error("bundle build failed: {0}")]
    BundleBuildFailed(String),

    /// The SSH session or gate process died.
    #[error("transport lost to host '{0}'")]
    TransportLost(String),

    /// A malformed frame or duplicated request id arrived on a gate.
    #[error("gate protocol error: {0}")]
    ProtocolError(String),

    /// The per-call deadline was exceeded.
    #[error("call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The call was cooperatively cancelled.
    #[error("call cancelled")]
    Cancelled,

    /// The module itself reported `success: false`.
    #[error("module '{module}' failed on '{host}': {message}")]
    ModuleFailed {
        /// Module FQCN
        module: String,
        /// Target host
        host: String,
        /// Message from the module output
        message: String,
    },

    /// The requested module could not be resolved by the registry.
    #[error("module '{0}' not found")]
    ModuleNotFound(String),

    /// Host or group selector did not resolve to any host.
    #[error("no host matched selector '{0}'")]
    NoSuchHost(String),

    // ========================================================================
    // Ambient leaves
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Generic error with an attached source, used by [`ErrorContext`].
    #[error("{message}")]
    Other {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// True if this error kind never carries retry semantics beyond the
    /// controller's own one-shot transport retries (see executor §7).
    pub fn is_terminal_for_call(&self) -> bool {
        !matches!(self, Error::TransportLost(_))
    }

    /// Maps an error to the CLI exit status used by the diagnostic binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InventoryInvalid(_) => 5,
            Error::SecretMissing(_) => 6,
            Error::PolicyInvalid(_) | Error::PolicyDenied(_) => 7,
            Error::BundleBuildFailed(_) => 8,
            Error::TransportLost(_) | Error::ProtocolError(_) => 9,
            Error::Timeout(_) => 10,
            Error::Cancelled => 11,
            Error::ModuleFailed { .. } => 2,
            Error::ModuleNotFound(_) | Error::NoSuchHost(_) => 3,
            Error::AuditCorrupt(_) => 4,
            _ => 1,
        }
    }
}

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Adds context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Adds context with a closure that is only evaluated on error.
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Other {
            message: message.into(),
            source: Some(Box::new(e)),
        })
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| Error::Other {
            message: f().into(),
            source: Some(Box::new(e)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_by_family() {
        assert_eq!(Error::InventoryInvalid("x".into()).exit_code(), 5);
        assert_eq!(Error::PolicyDenied("x".into()).exit_code(), 7);
        assert_eq!(Error::Cancelled.exit_code(), 11);
    }

    #[test]
    fn context_wraps_source() {
        let r: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ));
        let wrapped = r.context("loading inventory");
        assert!(wrapped.is_err());
        assert!(wrapped.unwrap_err().to_string().contains("loading inventory"));
    }
}
