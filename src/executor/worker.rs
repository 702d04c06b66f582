//! Worker thread logic for the executor
//!
//! Each worker:
//! - Walks its own partition of records in order
//! - Starts PENDING jobs and polls them to a terminal state
//! - Resumes polling IN_PROGRESS jobs from their stored handle
//! - Sends every transition back to the supervisor as a [`JobUpdate`]
//!
//! Cancellation is observed before each dispatch and around every poll
//! sleep. A backend round-trip in flight is always allowed to finish.

use super::{JobUpdate, ProgressSink};
use crate::backend::{Backend, JobDescriptor, RemoteStatus};
use crate::credentials::CredentialCoordinator;
use crate::error::{CallError, CredentialError, JobOutcome};
use crate::job::{JobRecord, JobStatus, TransitionError};
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Longest uninterrupted sleep; cancellation is checked in between
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// State shared by all workers of one run
pub(super) struct WorkerContext<'a, B: Backend> {
    pub coordinator: &'a CredentialCoordinator<B>,
    pub region: &'a str,
    pub source: &'a str,
    pub destination: &'a str,
    pub poll_interval: Duration,

    /// No new dispatches after this instant
    pub deadline: Option<Instant>,

    /// Records in the batch
    pub total: usize,

    pub progress: Option<&'a dyn ProgressSink>,
    pub cancel: Option<&'a (dyn Fn() -> bool + Sync)>,

    /// Set on shared infrastructure failure
    pub abort: AtomicBool,

    /// Some worker saw the cancellation predicate return true
    pub cancelled: AtomicBool,

    pub budget_exhausted: AtomicBool,

    /// Terminal records in the batch, including ones finished before this run
    pub completed: AtomicUsize,

    /// Records finished in this run
    pub finished: AtomicUsize,

    /// Start requests accepted in this run
    pub dispatched: AtomicUsize,
}

impl<'a, B: Backend> WorkerContext<'a, B> {
    /// True once the run must stop: cancellation or abort
    fn stop_requested(&self) -> bool {
        if self.abort.load(Ordering::SeqCst) {
            return true;
        }
        match self.cancel {
            Some(cancel) if cancel() => {
                self.cancelled.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// True once the runtime budget is used up
    fn budget_spent(&self) -> bool {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                if !self.budget_exhausted.swap(true, Ordering::SeqCst) {
                    warn!("Runtime budget reached, no new jobs will be started");
                }
                true
            }
            _ => false,
        }
    }

    fn record_finished(&self, record: &JobRecord) {
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.finished.fetch_add(1, Ordering::SeqCst);

        if let Some(progress) = self.progress {
            if record.status() == JobStatus::Failed {
                progress.job_failed(&record.source_id, record.error_message().unwrap_or(""));
            }
            let message = format!("{} {}", record.source_id, record.status());
            progress.report(&message, completed, self.total);
        }
    }
}

/// One executor worker
pub(super) struct Worker<'a, B: Backend> {
    id: usize,
    ctx: &'a WorkerContext<'a, B>,
    updates: Sender<JobUpdate>,
}

impl<'a, B: Backend> Worker<'a, B> {
    pub fn new(id: usize, ctx: &'a WorkerContext<'a, B>, updates: Sender<JobUpdate>) -> Self {
        Self { id, ctx, updates }
    }

    /// Process the assigned records in order
    ///
    /// Returns an error only for credential failures, after raising the
    /// abort flag so the other workers stop too.
    pub fn run(self, jobs: Vec<(usize, JobRecord)>) -> Result<(), CredentialError> {
        debug!(worker = self.id, jobs = jobs.len(), "Worker started");

        for (index, mut record) in jobs {
            if self.ctx.stop_requested() {
                debug!(worker = self.id, "Stop requested, not claiming more jobs");
                break;
            }

            let result = match record.status() {
                JobStatus::Pending => {
                    if self.ctx.budget_spent() {
                        continue;
                    }
                    self.dispatch(index, &mut record)
                }
                JobStatus::InProgress => {
                    debug!(
                        worker = self.id,
                        source_id = %record.source_id,
                        "Resuming poll of job started by an earlier run"
                    );
                    self.poll_until_done(index, &mut record)
                }
                _ => continue,
            };

            match result {
                Ok(outcome) => {
                    trace!(worker = self.id, source_id = %record.source_id, ?outcome, "Job released");
                    if outcome == JobOutcome::LeftInProgress {
                        break;
                    }
                }
                Err(e) => {
                    error!(
                        worker = self.id,
                        source_id = %record.source_id,
                        error = %e,
                        "Credential failure, aborting run"
                    );
                    self.ctx.abort.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        debug!(worker = self.id, "Worker finished");
        Ok(())
    }

    /// Start a pending job and poll it to completion
    fn dispatch(
        &self,
        index: usize,
        record: &mut JobRecord,
    ) -> Result<JobOutcome, CredentialError> {
        let job = JobDescriptor {
            source_id: &record.source_id,
            target: &record.target,
            source: self.ctx.source,
            destination: self.ctx.destination,
        };

        match self.ctx.coordinator.start(self.ctx.region, &job) {
            Ok(handle) => {
                self.ctx.dispatched.fetch_add(1, Ordering::SeqCst);
                debug!(
                    worker = self.id,
                    source_id = %record.source_id,
                    handle = %handle,
                    "Copy job started"
                );
                if !self.transition(record.start(handle)) {
                    return Ok(JobOutcome::LeftPending);
                }
                // Persist the handle before polling so a restart never starts it twice
                self.send(index, record);
                self.poll_until_done(index, record)
            }
            Err(CallError::Backend(e)) => {
                warn!(
                    worker = self.id,
                    source_id = %record.source_id,
                    error = %e,
                    "Failed to start copy job"
                );
                let message = format!("Failed to start copy job: {}", e);
                self.transition(record.fail(message.clone()));
                self.finish(index, record);
                Ok(JobOutcome::Failed { message })
            }
            Err(CallError::Credential(e)) => Err(e),
        }
    }

    /// Poll an in-progress job until it is terminal or the run stops
    fn poll_until_done(
        &self,
        index: usize,
        record: &mut JobRecord,
    ) -> Result<JobOutcome, CredentialError> {
        let Some(handle) = record.operation_handle().map(str::to_string) else {
            warn!(source_id = %record.source_id, "In-progress job has no operation handle");
            return Ok(JobOutcome::LeftInProgress);
        };

        loop {
            if !self.wait(self.ctx.poll_interval) {
                debug!(worker = self.id, source_id = %record.source_id, "Cancelled while polling");
                return Ok(JobOutcome::LeftInProgress);
            }

            let message = match self.ctx.coordinator.poll(self.ctx.region, &handle) {
                Ok(RemoteStatus::Running) => {
                    trace!(worker = self.id, handle = %handle, "Still running");
                    continue;
                }
                Ok(RemoteStatus::Completed) => {
                    self.transition(record.complete());
                    self.finish(index, record);
                    debug!(worker = self.id, source_id = %record.source_id, "Copy job completed");
                    return Ok(JobOutcome::Completed);
                }
                Ok(RemoteStatus::Failed(reason)) => {
                    reason.unwrap_or_else(|| "Copy job failed".to_string())
                }
                Err(CallError::Backend(e)) => format!("Status check failed: {}", e),
                Err(CallError::Credential(e)) => return Err(e),
            };

            warn!(
                worker = self.id,
                source_id = %record.source_id,
                error = %message,
                "Copy job failed"
            );
            self.transition(record.fail(message.clone()));
            self.finish(index, record);
            return Ok(JobOutcome::Failed { message });
        }
    }

    /// Sleep `interval` in slices; false if the run should stop
    fn wait(&self, interval: Duration) -> bool {
        if self.ctx.stop_requested() {
            return false;
        }
        let deadline = Instant::now() + interval;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
            if self.ctx.stop_requested() {
                return false;
            }
        }
        true
    }

    fn finish(&self, index: usize, record: &JobRecord) {
        self.send(index, record);
        self.ctx.record_finished(record);
    }

    fn send(&self, index: usize, record: &JobRecord) {
        let update = JobUpdate {
            index,
            record: record.clone(),
        };
        if self.updates.send(update).is_err() {
            warn!(worker = self.id, "Supervisor is gone, stopping");
            self.ctx.abort.store(true, Ordering::SeqCst);
        }
    }

    fn transition(&self, result: Result<(), TransitionError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(worker = self.id, error = %e, "Rejected job transition");
                false
            }
        }
    }
}
