//! No-log enforcement for secret values.
//!
//! Keeps a registry of resolved secret values so they can be scrubbed from
//! any text about to reach a log line or an audit record, independent of
//! whether the call site remembered to redact explicitly.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// A string wrapper that displays as `[REDACTED]` everywhere except `expose()`.
#[derive(Clone)]
pub struct SensitiveString {
    value: String,
}

impl SensitiveString {
    /// Create a new sensitive string.
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into() }
    }

    /// Access the actual value. Callers must not log or serialize the result.
    pub fn expose(&self) -> &str {
        &self.value
    }

    /// Consume and return the underlying value.
    pub fn into_inner(self) -> String {
        self.value
    }

    /// Whether the value is empty.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveString([REDACTED])")
    }
}

impl From<String> for SensitiveString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SensitiveString {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl PartialEq for SensitiveString {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for SensitiveString {}

// Always serializes as redacted; there is no code path that should ever
// persist a raw secret value to disk or to the wire.
impl serde::Serialize for SensitiveString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str("[REDACTED]")
    }
}

/// Registry of resolved secret values, used to scrub them out of arbitrary text.
pub struct NoLogRegistry {
    values: RwLock<HashSet<String>>,
}

impl NoLogRegistry {
    /// Create a new, empty registry.
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashSet::new()),
        }
    }

    /// Register a value for redaction. No-op for empty strings.
    pub fn register(&self, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() {
            self.values.write().insert(value);
        }
    }

    /// Whether `text` contains any registered value.
    pub fn contains_sensitive(&self, text: &str) -> bool {
        self.values.read().iter().any(|v| text.contains(v.as_str()))
    }

    /// Replace every occurrence of a registered value in `text` with `[REDACTED]`.
    pub fn redact(&self, text: &str) -> String {
        let values = self.values.read();
        let mut result = text.to_string();
        for value in values.iter() {
            if result.contains(value.as_str()) {
                result = result.replace(value.as_str(), "[REDACTED]");
            }
        }
        result
    }

    /// Number of registered values.
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// Whether the registry has no registered values.
    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

impl Default for NoLogRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NoLogRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoLogRegistry")
            .field("registered_values", &self.len())
            .finish()
    }
}

/// Scoped registration that unregisters its values when dropped.
pub struct NoLogGuard {
    registry: Arc<NoLogRegistry>,
    values: Vec<String>,
}

impl NoLogGuard {
    /// Create a guard bound to `registry`.
    pub fn new(registry: Arc<NoLogRegistry>) -> Self {
        Self {
            registry,
            values: Vec::new(),
        }
    }

    /// Register a value for the lifetime of this guard.
    pub fn protect(&mut self, value: impl Into<String>) {
        let value = value.into();
        self.registry.register(value.clone());
        self.values.push(value);
    }
}

impl Drop for NoLogGuard {
    fn drop(&mut self) {
        let mut values = self.registry.values.write();
        for value in &self.values {
            values.remove(value);
        }
    }
}

/// Parameter names that always carry credentials, regardless of any declared binding.
const WELL_KNOWN_CREDENTIAL_PARAMS: &[&str] = &["password", "token", "bearer_token"];

/// Whether a (possibly dotted) parameter key names a well-known credential
/// carrier: `password`, `token`, `bearer_token`, or a `headers.*` entry whose
/// tail is `Authorization`.
pub fn is_well_known_credential_param(key: &str) -> bool {
    if WELL_KNOWN_CREDENTIAL_PARAMS.contains(&key) {
        return true;
    }
    if let Some(rest) = key.strip_prefix("headers.") {
        return rest.eq_ignore_ascii_case("authorization");
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_string_hides_value() {
        let secret = SensitiveString::new("my_secret_password");
        assert_eq!(format!("{}", secret), "[REDACTED]");
        assert!(format!("{:?}", secret).contains("REDACTED"));
        assert_eq!(secret.expose(), "my_secret_password");
    }

    #[test]
    fn registry_redacts_registered_values() {
        let registry = NoLogRegistry::new();
        registry.register("secret_value");
        let redacted = registry.redact("the value is secret_value here");
        assert!(!redacted.contains("secret_value"));
        assert!(redacted.contains("[REDACTED]"));
    }

    #[test]
    fn guard_unregisters_on_drop() {
        let registry = Arc::new(NoLogRegistry::new());
        {
            let mut guard = NoLogGuard::new(registry.clone());
            guard.protect("temp_secret");
            assert!(registry.contains_sensitive("contains temp_secret"));
        }
        assert!(!registry.contains_sensitive("contains temp_secret"));
    }

    #[test]
    fn well_known_credential_params() {
        assert!(is_well_known_credential_param("password"));
        assert!(is_well_known_credential_param("bearer_token"));
        assert!(is_well_known_credential_param("headers.Authorization"));
        assert!(!is_well_known_credential_param("headers.Content-Type"));
        assert!(!is_well_known_credential_param("username"));
    }

    #[test]
    fn sensitive_string_serializes_as_redacted() {
        let secret = SensitiveString::new("actual_secret");
        let json = serde_json::to_string(&secret).unwrap();
        assert!(json.contains("REDACTED"));
        assert!(!json.contains("actual_secret"));
    }
}
