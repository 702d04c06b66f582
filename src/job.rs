//! Job records and batches
//!
//! A [`JobRecord`] tracks one copy operation from PENDING to a terminal
//! state. A [`Batch`] is every record of one run plus the run metadata.
//!
//! Status transitions are the only way to mutate a record:
//!
//! ```text
//! PENDING ──start──▶ IN_PROGRESS ──complete──▶ COMPLETED
//!    │                    │
//!    │                    └────fail────▶ FAILED
//!    ├──────fail──────────────────────▶ FAILED
//!    └──────skip──────────────────────▶ SKIPPED
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Status of a job in the copy pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Not dispatched yet
    Pending,
    /// Backend accepted the start request; being polled
    InProgress,
    /// Backend reported success
    Completed,
    /// Start or copy failed
    Failed,
    /// Never dispatched on purpose (dry run, not copyable)
    Skipped,
}

impl JobStatus {
    /// Terminal states are never left once entered
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Skipped
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::InProgress => write!(f, "in_progress"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Rejected status transition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Job '{source_id}' cannot move from {from} to {to}")]
pub struct TransitionError {
    pub source_id: String,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// One migration unit
///
/// Identity fields are public; the lifecycle fields only change through the
/// transition methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Identifier of the item being copied
    pub source_id: String,
    /// Where the copy should land
    pub target: String,
    /// Size of the item, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    status: JobStatus,
    /// Backend operation handle, set when the job starts
    operation_handle: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    /// Failure or skip reason
    error_message: Option<String>,
}

impl JobRecord {
    /// Create a new pending record
    pub fn new(source_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            target: target.into(),
            size_bytes: None,
            status: JobStatus::Pending,
            operation_handle: None,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// Attach a known size
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn operation_handle(&self) -> Option<&str> {
        self.operation_handle.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check that the lifecycle fields agree with the status
    ///
    /// Records built through the transition methods always pass; this is for
    /// records decoded from disk.
    pub fn validate(&self) -> Result<(), String> {
        let problem = match self.status {
            JobStatus::Pending if self.operation_handle.is_some() => "pending with an operation handle",
            JobStatus::Pending if self.completed_at.is_some() => "pending with a completion time",
            JobStatus::InProgress | JobStatus::Completed if self.operation_handle.is_none() => {
                "started without an operation handle"
            }
            JobStatus::InProgress | JobStatus::Completed if self.started_at.is_none() => {
                "started without a start time"
            }
            JobStatus::InProgress if self.completed_at.is_some() => "in progress with a completion time",
            JobStatus::Completed | JobStatus::Failed | JobStatus::Skipped
                if self.completed_at.is_none() =>
            {
                "terminal without a completion time"
            }
            JobStatus::Failed if self.error_message.is_none() => "failed without an error message",
            JobStatus::Skipped if self.operation_handle.is_some() => "skipped with an operation handle",
            _ => return Ok(()),
        };
        Err(format!("job '{}' is {}", self.source_id, problem))
    }

    /// Mark as started with the backend's operation handle
    pub fn start(&mut self, handle: impl Into<String>) -> Result<(), TransitionError> {
        self.check(JobStatus::InProgress, self.status == JobStatus::Pending)?;
        self.status = JobStatus::InProgress;
        self.operation_handle = Some(handle.into());
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Mark as completed
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.check(JobStatus::Completed, self.status == JobStatus::InProgress)?;
        self.status = JobStatus::Completed;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Mark as failed, either from a failed start or a failed copy
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.check(JobStatus::Failed, !self.is_terminal())?;
        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(error.into());
        Ok(())
    }

    /// Mark as skipped; only a job that was never dispatched can be skipped
    pub fn skip(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.check(JobStatus::Skipped, self.status == JobStatus::Pending)?;
        self.status = JobStatus::Skipped;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(reason.into());
        Ok(())
    }

    /// Time between start and completion (or now, while running)
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - started).to_std().ok()
    }

    fn check(&self, to: JobStatus, allowed: bool) -> Result<(), TransitionError> {
        if allowed {
            Ok(())
        } else {
            Err(TransitionError {
                source_id: self.source_id.clone(),
                from: self.status,
                to,
            })
        }
    }
}

/// All jobs of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Human batch identifier
    pub batch_id: String,
    /// Source identifier (account, vault, ...)
    pub source: String,
    /// Destination identifier
    pub destination: String,
    /// Region the backend sessions are opened for
    pub region: String,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    records: Vec<JobRecord>,
}

impl Batch {
    /// Create an empty batch
    pub fn new(
        batch_id: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            source: source.into(),
            destination: destination.into(),
            region: region.into(),
            started_at: None,
            completed_at: None,
            records: Vec::new(),
        }
    }

    /// Rebuild a batch from persisted parts, rejecting inconsistent records
    pub(crate) fn from_parts(
        mut batch: Batch,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
        records: Vec<JobRecord>,
    ) -> Result<Self, String> {
        let mut seen = HashSet::new();
        for record in &records {
            record.validate()?;
            if !seen.insert(record.source_id.as_str()) {
                return Err(format!("job '{}' appears more than once", record.source_id));
            }
        }
        if completed_at.is_some() && !records.iter().all(JobRecord::is_terminal) {
            return Err("batch marked complete with unfinished jobs".into());
        }
        batch.started_at = started_at;
        batch.completed_at = completed_at;
        batch.records = records;
        Ok(batch)
    }

    /// Add a record to the batch
    pub fn add(&mut self, record: JobRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[JobRecord] {
        &self.records
    }

    /// Records in batch order; they only change through their transitions
    pub fn records_mut(&mut self) -> &mut [JobRecord] {
        &mut self.records
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a record by source identifier
    pub fn get(&self, source_id: &str) -> Option<&JobRecord> {
        self.records.iter().find(|r| r.source_id == source_id)
    }

    pub fn count_by_status(&self, status: JobStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    /// True iff no record is PENDING or IN_PROGRESS
    pub fn is_complete(&self) -> bool {
        self.records.iter().all(JobRecord::is_terminal)
    }

    /// Percentage of COMPLETED records, rounded to two decimals
    pub fn success_rate(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        let completed = self.count_by_status(JobStatus::Completed) as f64;
        let rate = completed / self.records.len() as f64 * 100.0;
        (rate * 100.0).round() / 100.0
    }

    /// Indices of records a run should pick up: pending ones, plus in-progress
    /// ones that can be polled again from their stored handle
    pub fn resumable_indices(&self) -> Vec<usize> {
        self.indices_where(|r| match r.status {
            JobStatus::Pending => true,
            JobStatus::InProgress => r.operation_handle.is_some(),
            _ => false,
        })
    }

    /// Records that ended in FAILED
    pub fn failed(&self) -> impl Iterator<Item = &JobRecord> {
        self.records
            .iter()
            .filter(|r| r.status == JobStatus::Failed)
    }

    /// Sum of known sizes for records in the given status
    pub fn total_bytes(&self, status: JobStatus) -> u64 {
        self.records
            .iter()
            .filter(|r| r.status == status)
            .filter_map(|r| r.size_bytes)
            .sum()
    }

    /// Record the first start of this batch
    pub fn mark_started(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Set `completed_at` if every record is terminal; returns whether it is set
    pub fn mark_completed_if_done(&mut self) -> bool {
        if !self.is_complete() {
            return false;
        }
        if self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
        true
    }

    /// Label used in logs and state mismatch errors
    pub fn route(&self) -> String {
        format!("{} -> {}", self.source, self.destination)
    }

    fn indices_where(&self, pred: impl Fn(&JobRecord) -> bool) -> Vec<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| pred(r))
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_of(n: usize) -> Batch {
        let mut batch = Batch::new("b-1", "src", "dst", "us-east-1");
        for i in 0..n {
            batch.add(JobRecord::new(format!("rp-{i}"), "vault-dst"));
        }
        batch
    }

    #[test]
    fn test_record_lifecycle() {
        let mut rec = JobRecord::new("rp-1", "dst");
        assert_eq!(rec.status, JobStatus::Pending);
        assert!(rec.completed_at.is_none());

        rec.start("job-1").unwrap();
        assert_eq!(rec.status, JobStatus::InProgress);
        assert_eq!(rec.operation_handle.as_deref(), Some("job-1"));
        assert!(rec.started_at.is_some());
        assert!(rec.completed_at.is_none());

        rec.complete().unwrap();
        assert_eq!(rec.status, JobStatus::Completed);
        assert!(rec.completed_at.is_some());
        assert!(rec.duration().is_some());
    }

    #[test]
    fn test_terminal_is_never_overwritten() {
        let mut rec = JobRecord::new("rp-1", "dst");
        rec.start("job-1").unwrap();
        rec.fail("copy failed").unwrap();

        let before = rec.clone();
        assert!(rec.complete().is_err());
        assert!(rec.fail("again").is_err());
        assert!(rec.skip("late").is_err());
        assert!(rec.start("job-2").is_err());
        assert_eq!(rec, before);
    }

    #[test]
    fn test_skip_only_from_pending() {
        let mut rec = JobRecord::new("rp-1", "dst");
        rec.start("job-1").unwrap();
        let err = rec.skip("dry run").unwrap_err();
        assert_eq!(err.from, JobStatus::InProgress);
        assert_eq!(err.to, JobStatus::Skipped);

        let mut pending = JobRecord::new("rp-2", "dst");
        pending.skip("dry run").unwrap();
        assert_eq!(pending.error_message.as_deref(), Some("dry run"));
        assert!(pending.completed_at.is_some());
    }

    #[test]
    fn test_failed_start_goes_straight_to_failed() {
        let mut rec = JobRecord::new("rp-1", "dst");
        rec.fail("start rejected").unwrap();
        assert_eq!(rec.status, JobStatus::Failed);
        assert!(rec.operation_handle.is_none());
    }

    #[test]
    fn test_empty_batch_is_complete() {
        let batch = batch_of(0);
        assert!(batch.is_complete());
        assert_eq!(batch.success_rate(), 0.0);
    }

    #[test]
    fn test_batch_counts_and_success_rate() {
        let mut batch = batch_of(5);
        for (i, rec) in batch.records.iter_mut().enumerate() {
            rec.start(format!("job-{i}")).unwrap();
            if i % 2 == 0 {
                rec.complete().unwrap();
            } else {
                rec.fail("nope").unwrap();
            }
        }

        assert!(batch.is_complete());
        assert_eq!(batch.count_by_status(JobStatus::Completed), 3);
        assert_eq!(batch.count_by_status(JobStatus::Failed), 2);
        assert_eq!(batch.success_rate(), 60.0);
        assert_eq!(batch.failed().count(), 2);
    }

    #[test]
    fn test_success_rate_rounding() {
        let mut batch = batch_of(3);
        batch.records[0].start("j").unwrap();
        batch.records[0].complete().unwrap();
        assert_eq!(batch.success_rate(), 33.33);
    }

    #[test]
    fn test_resumable_indices() {
        let mut batch = batch_of(4);
        batch.records[1].start("job-1").unwrap();
        batch.records[2].skip("not copyable").unwrap();
        batch.records[3].fail("start rejected").unwrap();

        assert_eq!(batch.resumable_indices(), vec![0, 1]);
        assert!(!batch.is_complete());
    }

    #[test]
    fn test_validate_rejects_inconsistent_records() {
        let mut completed = JobRecord::new("rp-1", "dst");
        completed.start("job-1").unwrap();
        completed.complete().unwrap();
        assert!(completed.validate().is_ok());

        let mut no_time = completed.clone();
        no_time.completed_at = None;
        assert!(no_time.validate().unwrap_err().contains("completion time"));

        let mut no_handle = JobRecord::new("rp-2", "dst");
        no_handle.status = JobStatus::InProgress;
        no_handle.started_at = Some(Utc::now());
        assert!(no_handle.validate().unwrap_err().contains("operation handle"));

        let mut failed = JobRecord::new("rp-3", "dst");
        failed.fail("x").unwrap();
        failed.error_message = None;
        assert!(failed.validate().is_err());
    }

    #[test]
    fn test_from_parts_checks_records() {
        let base = Batch::new("b", "s", "d", "r");
        let rec = JobRecord::new("rp-1", "dst");

        let dup = Batch::from_parts(base.clone(), None, None, vec![rec.clone(), rec.clone()]);
        assert!(dup.unwrap_err().contains("more than once"));

        let early = Batch::from_parts(base.clone(), None, Some(Utc::now()), vec![rec.clone()]);
        assert!(early.is_err());

        let ok = Batch::from_parts(base, None, None, vec![rec]).unwrap();
        assert_eq!(ok.len(), 1);
    }

    #[test]
    fn test_completed_at_only_when_all_terminal() {
        let mut batch = batch_of(2);
        batch.records[0].skip("x").unwrap();
        assert!(!batch.mark_completed_if_done());
        assert!(batch.completed_at.is_none());

        batch.records[1].skip("x").unwrap();
        assert!(batch.mark_completed_if_done());
        assert!(batch.completed_at.is_some());
    }

    #[test]
    fn test_total_bytes() {
        let mut batch = Batch::new("b", "s", "d", "r");
        batch.add(JobRecord::new("a", "t").with_size(100));
        batch.add(JobRecord::new("b", "t").with_size(50));
        batch.add(JobRecord::new("c", "t"));
        assert_eq!(batch.total_bytes(JobStatus::Pending), 150);
        assert_eq!(batch.total_bytes(JobStatus::Completed), 0);
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&JobStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        assert_eq!(JobStatus::InProgress.to_string(), "in_progress");
    }
}
