//! Configuration for FTL2 contexts.
//!
//! Handles loading and merging configuration from multiple sources in the
//! order defaults < config file < environment, matching the layering the
//! teacher crate used for its own `Config`, here via the `config` crate
//! instead of hand-rolled file merging.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tunables for a running context. Defaults match spec §5/§6 exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum per-host executors running concurrently in a fan-out.
    pub max_parallel_hosts: usize,

    /// Drain window given to in-flight remote calls on fail-fast cancellation.
    #[serde(with = "humantime_serde")]
    pub cancel_grace: std::time::Duration,

    /// Default per-call deadline.
    #[serde(with = "humantime_serde")]
    pub timeout: std::time::Duration,

    /// Root directory for the bundle cache.
    pub cache_dir: PathBuf,

    /// Address of the KV secret store (HTTP API), if configured.
    pub secrets_addr: Option<String>,

    /// Bearer token for the KV secret store.
    pub secrets_token: Option<String>,

    /// Directories searched for a bare module name before the bundled
    /// collection.
    pub module_search_paths: Vec<PathBuf>,

    /// Root of the bundled module collection.
    pub collection_root: PathBuf,

    /// Root of auxiliary libraries a module may declare as dependencies.
    pub lib_root: PathBuf,

    /// Target the bundle builder packs modules for, e.g.
    /// `"x86_64-linux/python3.11"`. Part of the bundle fingerprint.
    pub target_profile: String,

    /// Label surfaced to policy evaluation as the call's `environment`.
    pub environment: String,

    /// Shell fragment run on a host once its bundle is staged and
    /// extracted, to start the gate process.
    pub gate_entry_command: String,

    /// Shell fragment run against an extracted (not staged) bundle to
    /// invoke one module directly, for the diagnostics harness in
    /// [`crate::gate::diagnostics`]. The archive's entry stub answers to
    /// both this and `gate_entry_command` (`--run <fqcn>` vs `--stream`).
    pub gate_diagnostic_command: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_parallel_hosts: 50,
            cancel_grace: std::time::Duration::from_secs(5),
            timeout: std::time::Duration::from_secs(300),
            cache_dir: default_cache_dir(),
            secrets_addr: None,
            secrets_token: None,
            module_search_paths: Vec::new(),
            collection_root: default_cache_dir().join("collection"),
            lib_root: default_cache_dir().join("lib"),
            target_profile: "x86_64-linux/python3.11".to_string(),
            environment: "default".to_string(),
            gate_entry_command: "python3 entrypoint.py --stream".to_string(),
            gate_diagnostic_command: "python3 entrypoint.py --run".to_string(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ftl2")
}

impl Config {
    /// Load configuration, layering an optional config file over defaults
    /// and then applying the environment variables named in spec §6.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("max_parallel_hosts", 50i64)
            .map_err(|e| Error::Config(e.to_string()))?
            .set_default("cancel_grace", "5s")
            .map_err(|e| Error::Config(e.to_string()))?
            .set_default("timeout", "300s")
            .map_err(|e| Error::Config(e.to_string()))?
            .set_default("cache_dir", default_cache_dir().to_string_lossy().to_string())
            .map_err(|e| Error::Config(e.to_string()))?;

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("FTL2")
                .try_parsing(true)
                .separator("_"),
        );

        let raw = builder.build().map_err(|e| Error::Config(e.to_string()))?;
        let mut cfg: Config = raw
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;

        if let Ok(dir) = std::env::var("FTL2_CACHE_DIR") {
            cfg.cache_dir = PathBuf::from(dir);
        }
        if let Ok(n) = std::env::var("FTL2_MAX_PARALLEL_HOSTS") {
            if let Ok(n) = n.parse() {
                cfg.max_parallel_hosts = n;
            }
        }
        if let Ok(addr) = std::env::var("FTL2_SECRETS_ADDR") {
            cfg.secrets_addr = Some(addr);
        }
        if let Ok(token) = std::env::var("FTL2_SECRETS_TOKEN") {
            cfg.secrets_token = Some(token);
        }

        Ok(cfg)
    }
}
