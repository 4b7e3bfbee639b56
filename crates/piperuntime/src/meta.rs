use pipecore::{file_digest, Fingerprint, PipelineError, Record, RecordOutcome, TargetError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Durable record index driving staleness checks.
///
/// Completions arrive concurrently from many workers; all writes go
/// through one mutex so record appends are serialized. The index is
/// loaded at run start and flushed after the run.
pub struct MetadataStore {
    records: Mutex<HashMap<String, Record>>,
    path: Option<PathBuf>,
}

impl MetadataStore {
    /// Store with no backing file; records last for the process only.
    pub fn in_memory() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            path: None,
        }
    }

    /// Open a store backed by a JSON file, loading any existing index.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        let records: HashMap<String, Record> = if path.exists() {
            let bytes = std::fs::read(&path)?;
            serde_json::from_slice(&bytes)?
        } else {
            HashMap::new()
        };
        tracing::debug!(
            "Metadata store opened: {} ({} records)",
            path.display(),
            records.len()
        );
        Ok(Self {
            records: Mutex::new(records),
            path: Some(path),
        })
    }

    pub fn get(&self, name: &str) -> Option<Record> {
        self.records.lock().unwrap().get(name).cloned()
    }

    /// Insert or replace a record. Whole records only; branch records
    /// are never mutated in place across runs.
    pub fn put(&self, record: Record) {
        tracing::debug!("Record updated: {} [{:?}]", record.name, record.outcome);
        self.records
            .lock()
            .unwrap()
            .insert(record.name.clone(), record);
    }

    /// A unit is stale if it has no record, its last run did not
    /// succeed, or its recomputed fingerprint differs from the stored
    /// one.
    pub fn is_stale(&self, name: &str, current: &Fingerprint) -> bool {
        match self.get(name) {
            None => true,
            Some(record) => !record.outcome.is_success() || record.fingerprint != *current,
        }
    }

    /// Recompute digests of a file target's tracked paths. A missing
    /// path is a hard failure; a changed digest only marks the target
    /// stale through its fingerprint.
    pub fn current_file_digests(paths: &[String]) -> Result<Vec<(String, String)>, TargetError> {
        paths
            .iter()
            .map(|p| {
                file_digest(Path::new(p))
                    .map(|digest| (p.clone(), digest))
                    .map_err(|_| TargetError::StaleFile(p.clone()))
            })
            .collect()
    }

    /// Drop branch records of `pattern` whose identity no longer
    /// appears in the recomputed branch list.
    pub fn prune_branches(&self, pattern: &str, live: &[String]) {
        let prefix = format!("{pattern}#");
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|name, _| !name.starts_with(&prefix) || live.contains(name));
        let pruned = before - records.len();
        if pruned > 0 {
            tracing::debug!("Pruned {pruned} orphaned branches of {pattern}");
        }
    }

    /// Record a failure durably before it propagates.
    pub fn record_failure(&self, name: &str, fingerprint: Fingerprint, kind: &str, message: &str) {
        self.put(
            Record::new(name, fingerprint).with_outcome(RecordOutcome::Failed {
                kind: kind.to_string(),
                message: message.to_string(),
            }),
        );
    }

    /// Write the whole index to the backing file, atomically via a
    /// temporary sibling.
    pub fn flush(&self) -> Result<(), PipelineError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let records = self.records.lock().unwrap();
        let bytes = serde_json::to_vec_pretty(&*records)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        tracing::debug!("Metadata flushed: {} records", records.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(text: &str) -> Fingerprint {
        Fingerprint::of_parts([text.as_bytes()])
    }

    #[test]
    fn missing_record_is_stale() {
        let store = MetadataStore::in_memory();
        assert!(store.is_stale("a", &fp("x")));
    }

    #[test]
    fn matching_fingerprint_is_fresh() {
        let store = MetadataStore::in_memory();
        store.put(Record::new("a", fp("x")));
        assert!(!store.is_stale("a", &fp("x")));
        assert!(store.is_stale("a", &fp("y")));
    }

    #[test]
    fn failed_record_stays_stale() {
        let store = MetadataStore::in_memory();
        store.record_failure("a", fp("x"), "TargetRuntimeError", "boom");
        assert!(store.is_stale("a", &fp("x")));
        // But the failure is durably reported.
        let record = store.get("a").unwrap();
        assert!(matches!(record.outcome, RecordOutcome::Failed { .. }));
    }

    #[test]
    fn prune_drops_only_orphaned_branches() {
        let store = MetadataStore::in_memory();
        store.put(Record::new("p#aaa", fp("1")));
        store.put(Record::new("p#bbb", fp("2")));
        store.put(Record::new("q#ccc", fp("3")));
        store.prune_branches("p", &["p#bbb".to_string()]);
        assert!(store.get("p#aaa").is_none());
        assert!(store.get("p#bbb").is_some());
        assert!(store.get("q#ccc").is_some());
    }

    #[test]
    fn flush_and_reopen_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");

        let store = MetadataStore::open(&path).unwrap();
        store.put(Record::new("a", fp("x")).with_location("loc/a"));
        store.flush().unwrap();

        let reopened = MetadataStore::open(&path).unwrap();
        let record = reopened.get("a").unwrap();
        assert_eq!(record.location.as_deref(), Some("loc/a"));
        assert!(!reopened.is_stale("a", &fp("x")));
    }
}
