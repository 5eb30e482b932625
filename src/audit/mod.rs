//! The audit log: an ordered, append-only record of every module call.
//!
//! Record order equals emission order from the fan-out driver, not
//! completion order, so positional replay is deterministic even though
//! calls themselves run concurrently. On disk the log is one JSON array;
//! in memory it's a plain `Vec` guarded by a mutex, flushed on an interval
//! and on context exit.

use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, ErrorContext, Result};

/// Outcome of a single module call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Ok,
    Failed,
    Replayed,
}

/// One entry in the audit log: a single module call against a single host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub request_id: String,
    pub timestamp: String,
    pub host: String,
    pub module: String,
    /// Params with bound secrets and well-known credential fields stripped.
    pub params: IndexMap<String, Value>,
    pub outcome: Outcome,
    pub changed: bool,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Append-only, in-memory-first audit log with optional replay from a prior run.
///
/// Slots are `Option<Record>` rather than bare `Record` so the fan-out
/// driver can reserve a position in inventory order before a call starts
/// and fill it in whenever that call actually finishes, keeping emission
/// order equal to selector order regardless of completion order.
pub struct AuditLog {
    path: Option<PathBuf>,
    records: Mutex<Vec<Option<Record>>>,
    prior: Vec<Record>,
    cursor: Mutex<Option<usize>>,
}

impl AuditLog {
    /// An audit log with no backing file and no replay source.
    pub fn new() -> Self {
        Self {
            path: None,
            records: Mutex::new(Vec::new()),
            prior: Vec::new(),
            cursor: Mutex::new(None),
        }
    }

    /// An audit log that will flush to `path`, optionally replaying `path`'s
    /// existing contents first.
    pub fn with_path(path: impl Into<PathBuf>, replay: bool) -> Result<Self> {
        let path = path.into();
        let prior = if replay { Self::load_prior(&path)? } else { Vec::new() };
        let cursor = if prior.is_empty() { None } else { Some(0) };
        Ok(Self {
            path: Some(path),
            records: Mutex::new(Vec::new()),
            prior,
            cursor: Mutex::new(cursor),
        })
    }

    /// Read an existing audit file into an ordered list of records. A
    /// missing file yields an empty list rather than an error, since an
    /// absent file just means this is the first run.
    fn load_prior(path: &Path) -> Result<Vec<Record>> {
        match std::fs::read(path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|_| Error::AuditCorrupt(path.to_path_buf()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Append a record to the in-memory log.
    pub fn append(&self, record: Record) {
        self.records.lock().push(Some(record));
    }

    /// Reserve the next slot in emission order without a record yet,
    /// returning its index. Used by the fan-out driver so a selector's
    /// hosts occupy the log in inventory order even though their calls
    /// race to completion.
    pub fn reserve(&self) -> usize {
        let mut records = self.records.lock();
        records.push(None);
        records.len() - 1
    }

    /// Fill in a slot reserved with [`Self::reserve`].
    pub fn finalize(&self, slot: usize, record: Record) {
        self.records.lock()[slot] = Some(record);
    }

    /// Attempt to satisfy a call from the prior run's log instead of
    /// executing it again.
    ///
    /// Positional matching: peek the record at the cursor. If it names the
    /// same module and host and its outcome was `ok`, advance the cursor
    /// and return it. Any mismatch disengages replay permanently for the
    /// rest of the run, since the script has diverged from what was
    /// recorded and positional matching can no longer be trusted.
    pub fn try_replay(&self, module: &str, host: &str, call_index: usize) -> Option<Record> {
        let mut cursor = self.cursor.lock();
        let index = (*cursor)?;

        let Some(record) = self.prior.get(index) else {
            tracing::debug!(call_index, "replay cursor past end, disengaging");
            *cursor = None;
            return None;
        };

        if record.module == module && record.host == host && record.outcome == Outcome::Ok {
            *cursor = Some(index + 1);
            Some(record.clone())
        } else {
            tracing::debug!(call_index, module, host, "replay mismatch, disengaging");
            *cursor = None;
            None
        }
    }

    /// Whether replay is still engaged (no mismatch has occurred yet).
    pub fn replaying(&self) -> bool {
        self.cursor.lock().is_some()
    }

    /// Number of records appended so far this run.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether any records have been appended this run.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// A snapshot of finalized records in emission order, skipping any
    /// slot still awaiting [`Self::finalize`].
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().iter().filter_map(Clone::clone).collect()
    }

    /// Write every appended record to the backing file, if one is configured.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let records = self.records.lock();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let finalized: Vec<&Record> = records.iter().filter_map(|r| r.as_ref()).collect();
        let body = serde_json::to_vec_pretty(&finalized).context("serializing audit log")?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).context("creating temp audit file")?;
        use std::io::Write;
        tmp.write_all(&body).context("writing temp audit file")?;
        tmp.flush().context("flushing temp audit file")?;
        tmp.as_file().sync_all().context("fsyncing temp audit file")?;
        tmp.persist(path).map_err(|e| e.error).context("renaming audit file into place")?;
        Ok(())
    }

    /// Periodic flush interval used by the context's background flusher.
    pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AuditLog {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "failed to flush audit log on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(module: &str, host: &str, outcome: Outcome) -> Record {
        Record {
            request_id: "r1".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            host: host.to_string(),
            module: module.to_string(),
            params: IndexMap::new(),
            outcome,
            changed: false,
            output: Value::Null,
            error: None,
            duration_ms: 10,
        }
    }

    #[test]
    fn fresh_log_does_not_replay() {
        let log = AuditLog::new();
        assert!(log.try_replay("m", "h", 0).is_none());
        assert!(!log.replaying());
    }

    #[test]
    fn replay_matches_positionally_then_disengages_on_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.json");
        std::fs::write(
            &path,
            serde_json::to_vec(&vec![
                record("ftl2.builtin.copy", "web1", Outcome::Ok),
                record("ftl2.builtin.shell", "web1", Outcome::Ok),
            ])
            .unwrap(),
        )
        .unwrap();

        let log = AuditLog::with_path(&path, true).unwrap();
        assert!(log.replaying());

        let replayed = log.try_replay("ftl2.builtin.copy", "web1", 0).unwrap();
        assert_eq!(replayed.outcome, Outcome::Ok);
        assert!(log.replaying());

        // Wrong host at this position: disengage for the rest of the run.
        assert!(log.try_replay("ftl2.builtin.shell", "web2", 1).is_none());
        assert!(!log.replaying());
        assert!(log.try_replay("ftl2.builtin.shell", "web1", 1).is_none());
    }

    #[test]
    fn missing_prior_file_yields_no_replay() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::with_path(dir.path().join("missing.json"), true).unwrap();
        assert!(!log.replaying());
    }

    #[test]
    fn flush_writes_appended_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.json");
        {
            let log = AuditLog::with_path(&path, false).unwrap();
            log.append(record("ftl2.builtin.copy", "web1", Outcome::Ok));
            log.flush().unwrap();
        }
        let reloaded: Vec<Record> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].module, "ftl2.builtin.copy");
    }

    #[test]
    fn corrupt_prior_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(AuditLog::with_path(&path, true), Err(Error::AuditCorrupt(_))));
    }

    #[test]
    fn reserved_slots_flush_in_reservation_order_regardless_of_fill_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.json");
        let log = AuditLog::with_path(&path, false).unwrap();

        let first = log.reserve();
        let second = log.reserve();
        assert_eq!((first, second), (0, 1));

        // Second host's call happens to finish first.
        log.finalize(second, record("ftl2.builtin.shell", "web2", Outcome::Ok));
        log.finalize(first, record("ftl2.builtin.copy", "web1", Outcome::Ok));

        log.flush().unwrap();
        let reloaded: Vec<Record> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(reloaded[0].host, "web1");
        assert_eq!(reloaded[1].host, "web2");
    }
}
