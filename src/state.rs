//! Crash-consistent persistence of a batch
//!
//! The batch is stored as one pretty-printed JSON document:
//!
//! ```text
//! {
//!   "schema_version": "1.0",
//!   "batch_id": "...", "source": "...", "destination": "...", "region": "...",
//!   "saved_at": "...", "started_at": ..., "completed_at": ...,
//!   "records": [ { "source_id": ..., "status": "pending", ... }, ... ]
//! }
//! ```
//!
//! Saves go to a temporary file in the same directory which is then renamed
//! over the real path, so a reader only ever sees the previous document or
//! the new one. The file is never edited in place.

use crate::error::{StateError, StateResult};
use crate::job::{Batch, JobRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Schema version written by this build
pub const SCHEMA_VERSION: &str = "1.0";

/// Schema versions this build can load
pub const SUPPORTED_SCHEMA_VERSIONS: &[&str] = &["1.0"];

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    schema_version: String,
    batch_id: String,
    source: String,
    destination: String,
    region: String,
    saved_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    records: Vec<JobRecord>,
}

impl PersistedState {
    fn from_batch(batch: &Batch) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            batch_id: batch.batch_id.clone(),
            source: batch.source.clone(),
            destination: batch.destination.clone(),
            region: batch.region.clone(),
            saved_at: Utc::now(),
            started_at: batch.started_at(),
            completed_at: batch.completed_at(),
            records: batch.records().to_vec(),
        }
    }

    fn into_batch(self) -> Result<Batch, String> {
        let batch = Batch::new(self.batch_id, self.source, self.destination, self.region);
        Batch::from_parts(batch, self.started_at, self.completed_at, self.records)
    }
}

/// State file owner; assumes a single writing process
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Atomically replace the state file with `batch`
    pub fn save(&self, batch: &Batch) -> StateResult<()> {
        self.save_with(batch, |tmp, path| tmp.persist(path).map(drop).map_err(|e| e.error))
    }

    /// Save with a custom final rename step
    ///
    /// The temporary file is dropped (and so removed) whenever `persist`
    /// fails, leaving the previous document untouched.
    fn save_with<F>(&self, batch: &Batch, persist: F) -> StateResult<()>
    where
        F: FnOnce(NamedTempFile, &Path) -> io::Result<()>,
    {
        let dir = self.dir();
        fs::create_dir_all(&dir).map_err(|e| self.io_error(e))?;

        let state = PersistedState::from_batch(batch);
        let tmp = NamedTempFile::new_in(&dir).map_err(|e| self.io_error(e))?;

        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, &state)?;
            writer.write_all(b"\n").map_err(|e| self.io_error(e))?;
            writer.flush().map_err(|e| self.io_error(e))?;
        }
        tmp.as_file().sync_all().map_err(|e| self.io_error(e))?;

        persist(tmp, &self.path).map_err(|e| self.io_error(e))?;

        debug!(
            path = %self.path.display(),
            records = batch.len(),
            "State saved"
        );
        Ok(())
    }

    /// Load the persisted batch; `Ok(None)` if there is no state file
    pub fn load(&self) -> StateResult<Option<Batch>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };

        let document: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| self.malformed(e.to_string()))?;

        // Version first, so an unknown format is never decoded as a known one
        let version = document
            .get("schema_version")
            .and_then(|v| v.as_str())
            .ok_or_else(|| self.malformed("missing schema_version".to_string()))?;
        if !SUPPORTED_SCHEMA_VERSIONS.contains(&version) {
            return Err(StateError::UnsupportedVersion {
                version: version.to_string(),
                supported: SUPPORTED_SCHEMA_VERSIONS.join(", "),
            });
        }

        let state: PersistedState =
            serde_json::from_value(document).map_err(|e| self.malformed(e.to_string()))?;

        info!(
            path = %self.path.display(),
            batch_id = %state.batch_id,
            records = state.records.len(),
            saved_at = %state.saved_at,
            "Loaded persisted state"
        );
        let batch = state.into_batch().map_err(|reason| self.malformed(reason))?;
        Ok(Some(batch))
    }

    /// Load state, refusing state that belongs to another run
    ///
    /// `region` is only compared when the caller named one explicitly; a
    /// resumed run otherwise keeps the region the batch was started in.
    pub fn load_for(
        &self,
        source: &str,
        destination: &str,
        region: Option<&str>,
    ) -> StateResult<Option<Batch>> {
        let Some(batch) = self.load()? else {
            return Ok(None);
        };
        if batch.source != source || batch.destination != destination {
            return Err(StateError::Mismatch {
                expected: format!("{} -> {}", source, destination),
                found: batch.route(),
            });
        }
        if let Some(region) = region {
            if batch.region != region {
                return Err(StateError::Mismatch {
                    expected: format!("region {}", region),
                    found: format!("region {}", batch.region),
                });
            }
        }
        Ok(Some(batch))
    }

    /// Remove the state file; returns whether one existed
    pub fn delete(&self) -> StateResult<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "State file deleted");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn io_error(&self, source: io::Error) -> StateError {
        StateError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn malformed(&self, reason: String) -> StateError {
        StateError::Malformed {
            path: self.path.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use tempfile::tempdir;

    fn sample_batch() -> Batch {
        let mut batch = Batch::new("b-1", "src-vault", "dst-account", "us-east-1");
        batch.add(JobRecord::new("rp-1", "dst").with_size(1024));
        batch.add(JobRecord::new("rp-2", "dst"));
        batch.add(JobRecord::new("rp-3", "dst"));
        batch.mark_started();
        let records = batch.records_mut();
        records[0].start("op-rp-1").unwrap();
        records[0].complete().unwrap();
        records[1].start("op-rp-2").unwrap();
        records[2].fail("start rejected").unwrap();
        batch
    }

    fn records_json(path: &Path) -> Vec<u8> {
        let value: serde_json::Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        serde_json::to_vec(&value["records"]).unwrap()
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        assert!(store.load().unwrap().is_none());
        assert!(!store.delete().unwrap());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let batch = sample_batch();

        store.save(&batch).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, batch);
        assert_eq!(loaded.records()[1].status(), JobStatus::InProgress);
        assert_eq!(loaded.records()[1].operation_handle(), Some("op-rp-2"));
    }

    #[test]
    fn test_resave_is_byte_equivalent() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("first.json");
        let second = dir.path().join("second.json");

        StateStore::new(&first).save(&sample_batch()).unwrap();
        let loaded = StateStore::new(&first).load().unwrap().unwrap();
        StateStore::new(&second).save(&loaded).unwrap();

        assert_eq!(records_json(&first), records_json(&second));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"schema_version": "2.0", "records": "not even a list"}"#).unwrap();

        let err = StateStore::new(&path).load().unwrap_err();
        assert!(matches!(err, StateError::UnsupportedVersion { ref version, .. } if version == "2.0"));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_malformed_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            StateStore::new(&path).load().unwrap_err(),
            StateError::Malformed { .. }
        ));

        fs::write(&path, r#"{"schema_version": "1.0", "batch_id": 7}"#).unwrap();
        assert!(matches!(
            StateStore::new(&path).load().unwrap_err(),
            StateError::Malformed { .. }
        ));

        fs::write(&path, r#"{"records": []}"#).unwrap();
        assert!(StateStore::new(&path).load().unwrap_err().is_corruption());
    }

    #[test]
    fn test_failed_rename_keeps_previous_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(&path);

        store.save(&sample_batch()).unwrap();
        let before = fs::read(&path).unwrap();

        let mut changed = sample_batch();
        changed.add(JobRecord::new("rp-4", "dst"));
        let err = store
            .save_with(&changed, |_tmp, _path| {
                Err(io::Error::new(io::ErrorKind::Other, "simulated crash"))
            })
            .unwrap_err();
        assert!(matches!(err, StateError::Io { .. }));

        assert_eq!(fs::read(&path).unwrap(), before);
        // Temporary file is gone too
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_load_for_mismatch() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.save(&sample_batch()).unwrap();

        assert!(store.load_for("src-vault", "dst-account", None).unwrap().is_some());
        assert!(matches!(
            store.load_for("other", "dst-account", None).unwrap_err(),
            StateError::Mismatch { .. }
        ));
    }

    #[test]
    fn test_load_for_explicit_region() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.save(&sample_batch()).unwrap();

        let same = store.load_for("src-vault", "dst-account", Some("us-east-1"));
        assert_eq!(same.unwrap().unwrap().region, "us-east-1");

        let err = store
            .load_for("src-vault", "dst-account", Some("eu-west-1"))
            .unwrap_err();
        assert!(matches!(err, StateError::Mismatch { ref found, .. } if found == "region us-east-1"));
        assert!(!err.is_corruption());
    }

    #[test]
    fn test_inconsistent_record_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(&path);
        store.save(&sample_batch()).unwrap();

        // Completed record that lost its completion time
        let mut document: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        document["records"][0]["completed_at"] = serde_json::Value::Null;
        fs::write(&path, serde_json::to_vec(&document).unwrap()).unwrap();

        let err = store.load().unwrap_err();
        assert!(matches!(err, StateError::Malformed { ref reason, .. } if reason.contains("rp-1")));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_delete_and_nested_dir() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested/run/state.json"));
        store.save(&sample_batch()).unwrap();
        assert!(store.exists());
        assert!(store.delete().unwrap());
        assert!(!store.exists());
    }
}
