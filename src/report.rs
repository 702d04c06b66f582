//! End-of-run summary report

use crate::job::{Batch, JobStatus};
use crate::progress::format_duration;
use chrono::{DateTime, Utc};
use humansize::{format_size, BINARY};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

/// One failed job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureDetail {
    pub source_id: String,
    pub error: String,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Counts, rates and failures of a batch after a run
#[derive(Debug, Clone, Serialize)]
pub struct SummaryReport {
    pub batch_id: String,
    pub source: String,
    pub destination: String,

    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
    pub in_progress: usize,

    /// Percentage of completed jobs, two decimals
    pub success_rate: f64,

    pub duration_secs: f64,

    /// Human readable duration
    pub duration: String,

    /// Jobs that reached a terminal state during this run
    pub finished_this_run: usize,

    /// Jobs finished per hour of this run; absent for runs shorter than a second
    pub throughput_per_hour: Option<f64>,

    /// Sum of known sizes of completed jobs
    pub bytes_copied: u64,
    pub bytes_copied_human: String,

    pub failures: Vec<FailureDetail>,
    pub generated_at: DateTime<Utc>,
}

impl SummaryReport {
    /// Build the report for a run that finished `finished` jobs in `duration`
    ///
    /// Jobs that were already terminal when a resumed run started count in
    /// the totals but not in the throughput.
    pub fn from_batch(batch: &Batch, duration: Duration, finished: usize) -> Self {
        let completed = batch.count_by_status(JobStatus::Completed);
        let secs = duration.as_secs_f64();
        let throughput_per_hour = (secs >= 1.0)
            .then(|| ((finished as f64 / secs * 3600.0) * 100.0).round() / 100.0);
        let bytes_copied = batch.total_bytes(JobStatus::Completed);

        let failures = batch
            .failed()
            .map(|r| FailureDetail {
                source_id: r.source_id.clone(),
                error: r.error_message().unwrap_or_default().to_string(),
                failed_at: r.completed_at(),
            })
            .collect();

        Self {
            batch_id: batch.batch_id.clone(),
            source: batch.source.clone(),
            destination: batch.destination.clone(),
            total: batch.len(),
            completed,
            failed: batch.count_by_status(JobStatus::Failed),
            skipped: batch.count_by_status(JobStatus::Skipped),
            pending: batch.count_by_status(JobStatus::Pending),
            in_progress: batch.count_by_status(JobStatus::InProgress),
            success_rate: batch.success_rate(),
            duration_secs: secs,
            duration: format_duration(duration),
            finished_this_run: finished,
            throughput_per_hour,
            bytes_copied,
            bytes_copied_human: format_size(bytes_copied, BINARY),
            failures,
            generated_at: Utc::now(),
        }
    }

    /// No failures and nothing left to do
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.pending == 0 && self.in_progress == 0
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        let mut json = self.to_json()?;
        json.push('\n');
        fs::write(path, json)
    }
}
