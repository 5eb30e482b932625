//! KV secret store backend.
//!
//! A secret reference has the shape `path#field`: `path` names a document in
//! the store, `field` a key within it. Lookups are batched by `path` so a
//! module that binds five fields out of the same document costs one request.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// A parsed `path#field` secret reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KvRef {
    pub path: String,
    pub field: String,
}

impl KvRef {
    /// Parse `path#field`. Fails if there's no `#` or either side is empty.
    pub fn parse(reference: &str) -> Result<Self> {
        let (path, field) = reference
            .split_once('#')
            .ok_or_else(|| Error::SecretMissing(reference.to_string()))?;
        if path.is_empty() || field.is_empty() {
            return Err(Error::SecretMissing(reference.to_string()));
        }
        Ok(Self {
            path: path.to_string(),
            field: field.to_string(),
        })
    }
}

/// Fetches secret documents from a KV store over HTTP.
#[cfg(feature = "kv-secrets")]
#[derive(Debug)]
pub struct KvBackend {
    client: reqwest::Client,
    addr: String,
    token: Option<String>,
}

#[cfg(feature = "kv-secrets")]
impl KvBackend {
    /// Build a backend pointed at `addr`, authenticating with `token` if set.
    pub fn new(addr: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            addr: addr.into(),
            token,
        }
    }

    /// Fetch every field in the document at `path`.
    pub async fn fetch(&self, path: &str) -> Result<HashMap<String, String>> {
        let url = format!("{}/{}", self.addr.trim_end_matches('/'), path.trim_start_matches('/'));
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| Error::Other {
            message: format!("kv store request to {} failed", url),
            source: Some(Box::new(e)),
        })?;
        if !response.status().is_success() {
            return Err(Error::SecretMissing(path.to_string()));
        }
        response.json().await.map_err(|e| Error::Other {
            message: format!("kv store response from {} was not valid json", url),
            source: Some(Box::new(e)),
        })
    }
}

/// Without the `kv-secrets` feature, any KV reference fails to resolve.
#[cfg(not(feature = "kv-secrets"))]
#[derive(Debug)]
pub struct KvBackend;

#[cfg(not(feature = "kv-secrets"))]
impl KvBackend {
    pub fn new(_addr: impl Into<String>, _token: Option<String>) -> Self {
        Self
    }

    pub async fn fetch(&self, path: &str) -> Result<HashMap<String, String>> {
        Err(Error::Config(format!(
            "secret path '{path}' requires the kv-secrets feature, which is not enabled"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_path_and_field() {
        let r = KvRef::parse("secret/data/app#api_key").unwrap();
        assert_eq!(r.path, "secret/data/app");
        assert_eq!(r.field, "api_key");
    }

    #[test]
    fn rejects_missing_separator() {
        assert!(KvRef::parse("no-separator-here").is_err());
    }
}
