//! Secret resolution for module parameters.
//!
//! A run declares two kinds of secret sources: environment variable names,
//! and KV references of the shape `path#field`. Both are resolved once, on
//! context entry, env lookups locally and KV lookups batched by path. After
//! that `SecretResolver` is a read-only lookup table for the rest of the run.
//!
//! Bindings connect a resolved secret to a module parameter:
//! `{module_fqcn: {param: secret_name}}`. `bindings_for` turns that
//! declaration into the literal `{param: value}` map the executor merges
//! into a call's params, and `redact` strips those same keys (plus a short
//! list of well-known credential-carrying names) back out before a call is
//! written to the audit log.

pub mod backend;
pub mod no_log;

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::{Error, Result};
use backend::{KvBackend, KvRef};
use no_log::{is_well_known_credential_param, NoLogRegistry};

/// Declares what to resolve and how to bind it to module parameters.
#[derive(Debug, Clone, Default)]
pub struct SecretSpec {
    /// Environment variable names to resolve. The variable name doubles as
    /// the secret name used in bindings.
    pub env: Vec<String>,

    /// Secret name to `path#field` KV reference.
    pub kv: IndexMap<String, String>,

    /// Module FQCN to `{param: secret_name}`.
    pub bindings: IndexMap<String, IndexMap<String, String>>,
}

/// Resolved secret values plus the bindings that connect them to module
/// parameters. Built once per context and held for the life of the run.
#[derive(Debug)]
pub struct SecretResolver {
    values: HashMap<String, String>,
    bindings: IndexMap<String, IndexMap<String, String>>,
    registry: Arc<NoLogRegistry>,
}

impl SecretResolver {
    /// Resolve every source named in `spec` and build the lookup table.
    ///
    /// Fails closed: a missing env var or KV field aborts context entry
    /// rather than letting a module run with a silently-absent credential.
    pub async fn resolve(spec: SecretSpec, kv_addr: Option<&str>, kv_token: Option<String>) -> Result<Self> {
        let mut values = HashMap::new();

        for name in &spec.env {
            let value = std::env::var(name).map_err(|_| Error::SecretMissing(name.clone()))?;
            values.insert(name.clone(), value);
        }

        if !spec.kv.is_empty() {
            let addr = kv_addr.ok_or_else(|| {
                Error::Config("secrets.kv references are declared but no secrets_addr is configured".into())
            })?;
            let backend = KvBackend::new(addr, kv_token);

            let mut by_path: IndexMap<String, Vec<(String, String)>> = IndexMap::new();
            for (secret_name, reference) in &spec.kv {
                let kv_ref = KvRef::parse(reference)?;
                by_path
                    .entry(kv_ref.path)
                    .or_default()
                    .push((kv_ref.field, secret_name.clone()));
            }

            for (path, fields) in by_path {
                let document = backend.fetch(&path).await?;
                for (field, secret_name) in fields {
                    let value = document
                        .get(&field)
                        .ok_or_else(|| Error::SecretMissing(format!("{path}#{field}")))?;
                    values.insert(secret_name, value.clone());
                }
            }
        }

        let registry = Arc::new(NoLogRegistry::new());
        for value in values.values() {
            registry.register(value.clone());
        }

        Ok(Self {
            values,
            bindings: spec.bindings,
            registry,
        })
    }

    /// An empty resolver, for contexts that declare no secrets.
    pub fn empty() -> Self {
        Self {
            values: HashMap::new(),
            bindings: IndexMap::new(),
            registry: Arc::new(NoLogRegistry::new()),
        }
    }

    /// Look up a resolved secret by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// The params a call to `module_fqcn` should receive from bindings,
    /// `{param: value}`. Missing bindings for the module yield an empty map.
    pub fn bindings_for(&self, module_fqcn: &str) -> IndexMap<String, Value> {
        let mut out = IndexMap::new();
        if let Some(params) = self.bindings.get(module_fqcn) {
            for (param, secret_name) in params {
                if let Some(value) = self.get(secret_name) {
                    out.insert(param.clone(), Value::String(value.to_string()));
                }
            }
        }
        out
    }

    /// Strip bound secret params and well-known credential-carrying names
    /// out of `params` before the call is written to the audit log.
    pub fn redact(&self, params: &IndexMap<String, Value>, module_fqcn: &str) -> IndexMap<String, Value> {
        let bound: std::collections::HashSet<&str> = self
            .bindings
            .get(module_fqcn)
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default();

        params
            .iter()
            .filter(|(key, _)| !bound.contains(key.as_str()))
            .map(|(key, value)| {
                if is_well_known_credential_param(key) {
                    (key.clone(), Value::String("[REDACTED]".to_string()))
                } else {
                    (key.clone(), value.clone())
                }
            })
            .collect()
    }

    /// Registry of resolved values, for scrubbing free-form text such as
    /// module stdout before it reaches a log line.
    pub fn no_log_registry(&self) -> Arc<NoLogRegistry> {
        self.registry.clone()
    }
}
