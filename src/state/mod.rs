//! Crash-safe state snapshot store.
//!
//! Tracks dynamically-added hosts and ad-hoc variables across runs. The
//! snapshot is `{hosts, vars}`; writes are batched in memory and flushed
//! atomically (write to a temp file, fsync, rename) so a crash mid-write
//! never corrupts the file on disk.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorContext, Result};

/// The on-disk shape of a state snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Dynamically-added hosts, name to attribute map.
    #[serde(default)]
    pub hosts: IndexMap<String, IndexMap<String, serde_yaml::Value>>,
    /// Ad-hoc variables set outside of any host.
    #[serde(default)]
    pub vars: IndexMap<String, serde_yaml::Value>,
}

/// The state store for a context. One writer at a time; readers see the
/// last-committed in-memory snapshot.
#[derive(Debug)]
pub struct State {
    path: PathBuf,
    snapshot: Mutex<Snapshot>,
}

impl State {
    /// Load the snapshot at `path`. A missing file yields an empty snapshot.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).context("parsing state snapshot")?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            snapshot: Mutex::new(snapshot),
        })
    }

    /// Insert or update a dynamically-added host's attributes.
    pub fn put_host(&self, name: impl Into<String>, attrs: IndexMap<String, serde_yaml::Value>) {
        self.snapshot.lock().hosts.insert(name.into(), attrs);
    }

    /// Set an ad-hoc variable.
    pub fn put_var(&self, key: impl Into<String>, value: serde_yaml::Value) {
        self.snapshot.lock().vars.insert(key.into(), value);
    }

    /// Whether a host or var key is already known.
    pub fn has(&self, key: &str) -> bool {
        let snapshot = self.snapshot.lock();
        snapshot.hosts.contains_key(key) || snapshot.vars.contains_key(key)
    }

    /// A copy of the currently-known hosts.
    pub fn hosts(&self) -> IndexMap<String, IndexMap<String, serde_yaml::Value>> {
        self.snapshot.lock().hosts.clone()
    }

    /// Flush pending writes to disk atomically.
    pub fn flush(&self) -> Result<()> {
        let snapshot = self.snapshot.lock();
        write_atomic(&self.path, &*snapshot)
    }
}

impl Drop for State {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, path = %self.path.display(), "failed to flush state on drop");
        }
    }
}

fn write_atomic(path: &Path, snapshot: &Snapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec_pretty(snapshot).context("serializing state snapshot")?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).context("creating temp state file")?;
    use std::io::Write;
    tmp.write_all(&body).context("writing temp state file")?;
    tmp.flush().context("flushing temp state file")?;
    tmp.as_file().sync_all().context("fsyncing temp state file")?;
    tmp.persist(path).map_err(|e| e.error).context("renaming state file into place")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let state = State::load(dir.path().join("state.json")).unwrap();
        assert_eq!(state.hosts().len(), 0);
    }

    #[test]
    fn put_and_flush_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut attrs = IndexMap::new();
        attrs.insert("address".to_string(), serde_yaml::Value::String("10.0.0.5".into()));

        {
            let state = State::load(&path).unwrap();
            state.put_host("dyn1", attrs.clone());
            state.flush().unwrap();
        }

        let reloaded = State::load(&path).unwrap();
        assert_eq!(reloaded.hosts().get("dyn1"), Some(&attrs));
    }

    #[test]
    fn has_checks_hosts_and_vars() {
        let dir = tempfile::tempdir().unwrap();
        let state = State::load(dir.path().join("state.json")).unwrap();
        assert!(!state.has("x"));
        state.put_var("x", serde_yaml::Value::Bool(true));
        assert!(state.has("x"));
    }
}
