//! Worker pool executor
//!
//! Drives every resumable job of a batch to a terminal state with a fixed
//! pool of worker threads:
//!
//! ```text
//!                  ┌──────────────┐
//!                  │    Batch     │  (only written by the supervisor)
//!                  └──────┬───────┘
//!         static round-robin partition of resumable indices
//!          ┌──────────────┼──────────────┐
//!          ▼              ▼              ▼
//!     ┌─────────┐    ┌─────────┐    ┌─────────┐
//!     │ mover-0 │    │ mover-1 │    │ mover-N │  start + poll through the
//!     └────┬────┘    └────┬────┘    └────┬────┘  CredentialCoordinator
//!          └──────────────┼──────────────┘
//!                         ▼  JobUpdate { index, record }
//!                  ┌──────────────┐
//!                  │  supervisor  │ ── apply ── checkpoint ──▶ StateStore
//!                  └──────────────┘
//! ```
//!
//! Each worker owns copies of the records in its partition, so no record is
//! ever touched by two threads. The supervisor (the calling thread) applies
//! updates in arrival order and saves the batch after each drained group.

mod worker;

use crate::backend::Backend;
use crate::credentials::CredentialCoordinator;
use crate::error::{MoverError, Result, StateResult, WorkerError};
use crate::job::{Batch, JobRecord, JobStatus};
use crate::state::StateStore;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use worker::{Worker, WorkerContext};

/// Skip reason recorded by dry runs
pub const DRY_RUN_REASON: &str = "Dry run mode";

/// Executor settings
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker threads (at least 1)
    pub workers: usize,

    /// Sleep between polls of one operation
    pub poll_interval: Duration,

    /// Mark pending jobs skipped instead of starting them
    pub dry_run: bool,

    /// Stop claiming new jobs after this much time
    pub max_runtime: Option<Duration>,

    /// Region override; the batch region is used when unset
    pub region: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_interval: Duration::from_secs(30),
            dry_run: false,
            max_runtime: None,
            region: None,
        }
    }
}

/// One record handed back by a worker
#[derive(Debug, Clone)]
pub struct JobUpdate {
    /// Position of the record in the batch
    pub index: usize,

    /// Worker's copy of the record after its latest transition
    pub record: JobRecord,
}

/// Receives progress from worker threads; must tolerate concurrent calls
pub trait ProgressSink: Sync {
    /// A job reached a terminal state
    fn report(&self, message: &str, completed: usize, total: usize);

    /// A job ended up FAILED
    fn job_failed(&self, _source_id: &str, _error: &str) {}
}

impl<F> ProgressSink for F
where
    F: Fn(&str, usize, usize) + Sync,
{
    fn report(&self, message: &str, completed: usize, total: usize) {
        self(message, completed, total)
    }
}

/// Summary of one executor run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Every record is terminal
    pub completed: bool,

    /// Cancellation was observed by at least one worker
    pub interrupted: bool,

    /// The runtime budget stopped new dispatches
    pub budget_exhausted: bool,

    /// Start requests accepted by the backend in this run
    pub dispatched: usize,

    /// Records that reached a terminal state in this run
    pub finished: usize,

    pub duration: Duration,
}

/// Runs a batch against a backend through a credential coordinator
pub struct Executor<'a, B: Backend> {
    config: ExecutorConfig,
    coordinator: &'a CredentialCoordinator<B>,
    store: Option<&'a StateStore>,
    progress: Option<&'a dyn ProgressSink>,
    cancel: Option<&'a (dyn Fn() -> bool + Sync)>,
}

impl<'a, B: Backend> Executor<'a, B> {
    pub fn new(config: ExecutorConfig, coordinator: &'a CredentialCoordinator<B>) -> Self {
        Self {
            config,
            coordinator,
            store: None,
            progress: None,
            cancel: None,
        }
    }

    /// Checkpoint the batch to `store` as jobs change state
    pub fn with_state_store(mut self, store: &'a StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Cancellation predicate, checked before each dispatch and around poll sleeps
    pub fn with_cancel(mut self, cancel: &'a (dyn Fn() -> bool + Sync)) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Run every resumable job of `batch`
    ///
    /// Per-job failures end up on the records. An `Err` means shared
    /// infrastructure failed (credentials, checkpointing, worker threads);
    /// it is returned only after all workers joined and every update they
    /// sent was applied to `batch`.
    pub fn run(&self, batch: &mut Batch) -> Result<RunOutcome> {
        let start = Instant::now();

        if self.config.dry_run {
            return Ok(self.dry_run(batch, start));
        }

        let indices = batch.resumable_indices();
        let total = batch.len();
        let region = self
            .config
            .region
            .clone()
            .unwrap_or_else(|| batch.region.clone());

        info!(
            batch_id = %batch.batch_id,
            route = %batch.route(),
            total,
            resumable = indices.len(),
            workers = self.config.workers,
            "Starting copy run"
        );

        batch.mark_started();
        self.checkpoint(batch)?;

        let assignments: Vec<Vec<(usize, JobRecord)>> = partition(&indices, self.config.workers)
            .into_iter()
            .map(|part| {
                part.into_iter()
                    .map(|index| (index, batch.records()[index].clone()))
                    .collect()
            })
            .collect();

        let source = batch.source.clone();
        let destination = batch.destination.clone();
        let already_terminal = batch.records().iter().filter(|r| r.is_terminal()).count();
        let ctx = WorkerContext {
            coordinator: self.coordinator,
            region: &region,
            source: &source,
            destination: &destination,
            poll_interval: self.config.poll_interval,
            deadline: self.config.max_runtime.map(|budget| start + budget),
            total,
            progress: self.progress,
            cancel: self.cancel,
            abort: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            budget_exhausted: AtomicBool::new(false),
            completed: AtomicUsize::new(already_terminal),
            finished: AtomicUsize::new(0),
            dispatched: AtomicUsize::new(0),
        };

        let mut failure: Option<MoverError> = None;

        thread::scope(|s| {
            let (tx, rx) = crossbeam_channel::unbounded::<JobUpdate>();
            let mut handles = Vec::with_capacity(assignments.len());

            for (id, jobs) in assignments.into_iter().enumerate() {
                let worker = Worker::new(id, &ctx, tx.clone());
                let spawned = thread::Builder::new()
                    .name(format!("mover-{}", id))
                    .spawn_scoped(s, move || worker.run(jobs));
                match spawned {
                    Ok(handle) => handles.push((id, handle)),
                    Err(e) => {
                        ctx.abort.store(true, Ordering::SeqCst);
                        failure.get_or_insert(
                            WorkerError::SpawnFailed {
                                id,
                                reason: e.to_string(),
                            }
                            .into(),
                        );
                        break;
                    }
                }
            }
            drop(tx);

            debug!(count = handles.len(), "Workers spawned");

            let mut checkpointing = true;
            while let Ok(update) = rx.recv() {
                apply_update(batch, update);
                for update in rx.try_iter() {
                    apply_update(batch, update);
                }
                if checkpointing {
                    if let Err(e) = self.checkpoint(batch) {
                        error!(error = %e, "Checkpoint failed, stopping run");
                        ctx.abort.store(true, Ordering::SeqCst);
                        failure.get_or_insert(e.into());
                        checkpointing = false;
                    }
                }
            }

            for (id, handle) in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        failure.get_or_insert(e.into());
                    }
                    Err(_) => {
                        ctx.abort.store(true, Ordering::SeqCst);
                        failure.get_or_insert(
                            WorkerError::Panicked {
                                id,
                                message: "Worker thread panicked".into(),
                            }
                            .into(),
                        );
                    }
                }
            }
        });

        if let Some(err) = failure {
            warn!(error = %err, "Copy run aborted");
            return Err(err);
        }

        batch.mark_completed_if_done();
        self.checkpoint(batch)?;

        let outcome = RunOutcome {
            completed: batch.is_complete(),
            interrupted: ctx.cancelled.load(Ordering::SeqCst),
            budget_exhausted: ctx.budget_exhausted.load(Ordering::SeqCst),
            dispatched: ctx.dispatched.load(Ordering::SeqCst),
            finished: ctx.finished.load(Ordering::SeqCst),
            duration: start.elapsed(),
        };

        info!(
            completed = batch.count_by_status(JobStatus::Completed),
            failed = batch.count_by_status(JobStatus::Failed),
            pending = batch.count_by_status(JobStatus::Pending),
            in_progress = batch.count_by_status(JobStatus::InProgress),
            duration_secs = outcome.duration.as_secs(),
            "Copy run finished"
        );

        Ok(outcome)
    }

    /// Mark every pending record skipped without touching the backend
    fn dry_run(&self, batch: &mut Batch, start: Instant) -> RunOutcome {
        let mut skipped = 0;
        for record in batch
            .records_mut()
            .iter_mut()
            .filter(|r| r.status() == JobStatus::Pending)
        {
            if record.skip(DRY_RUN_REASON).is_ok() {
                skipped += 1;
            }
        }
        batch.mark_completed_if_done();

        info!(skipped, "Dry run, no copy jobs started");
        if let Some(progress) = self.progress {
            progress.report("Dry run complete", batch.len(), batch.len());
        }

        RunOutcome {
            completed: batch.is_complete(),
            interrupted: false,
            budget_exhausted: false,
            dispatched: 0,
            finished: skipped,
            duration: start.elapsed(),
        }
    }

    fn checkpoint(&self, batch: &Batch) -> StateResult<()> {
        match self.store {
            Some(store) => store.save(batch),
            None => Ok(()),
        }
    }
}

/// Apply a worker's record to the batch; terminal records are never replaced
fn apply_update(batch: &mut Batch, update: JobUpdate) {
    match batch.records_mut().get_mut(update.index) {
        Some(slot) if !slot.is_terminal() => *slot = update.record,
        Some(slot) => warn!(
            source_id = %slot.source_id,
            status = %slot.status(),
            "Ignoring update for a terminal job"
        ),
        None => warn!(index = update.index, "Ignoring update for unknown job"),
    }
}

/// Deal `indices` round-robin over at most `workers` partitions
fn partition(indices: &[usize], workers: usize) -> Vec<Vec<usize>> {
    let count = workers.max(1).min(indices.len());
    let mut parts = vec![Vec::new(); count];
    for (n, &index) in indices.iter().enumerate() {
        parts[n % count].push(index);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RemoteStatus, StubBackend};
    use crate::credentials::{CredentialPolicy, NonInteractive, RetryPolicy};
    use crate::error::{BackendError, CredentialError};
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn coordinator(backend: StubBackend) -> CredentialCoordinator<StubBackend> {
        CredentialCoordinator::new(backend)
            .with_credential_policy(CredentialPolicy {
                auth_delays: vec![Duration::from_millis(1); 3],
                ..CredentialPolicy::default()
            })
            .with_prompt(NonInteractive)
    }

    fn config(workers: usize) -> ExecutorConfig {
        ExecutorConfig {
            workers,
            poll_interval: Duration::from_millis(1),
            ..ExecutorConfig::default()
        }
    }

    fn batch_of(n: usize) -> Batch {
        let mut batch = Batch::new("b-1", "src", "dst", "us-east-1");
        for i in 0..n {
            batch.add(JobRecord::new(format!("rp-{i}"), "vault-dst"));
        }
        batch
    }

    #[test]
    fn test_partition_round_robin() {
        assert_eq!(partition(&[0, 1, 2, 3, 4], 2), vec![vec![0, 2, 4], vec![1, 3]]);
        assert_eq!(partition(&[7, 9], 8), vec![vec![7], vec![9]]);
        assert!(partition(&[], 4).is_empty());
        assert_eq!(partition(&[1, 2], 0), vec![vec![1, 2]]);
    }

    #[test]
    fn test_apply_update_never_replaces_terminal() {
        let mut batch = batch_of(1);
        batch.records_mut()[0].skip("not copyable").unwrap();
        let before = batch.records()[0].clone();

        let mut late = JobRecord::new("rp-0", "vault-dst");
        late.start("op").unwrap();
        apply_update(&mut batch, JobUpdate { index: 0, record: late });
        apply_update(
            &mut batch,
            JobUpdate {
                index: 5,
                record: JobRecord::new("x", "y"),
            },
        );

        assert_eq!(batch.records()[0], before);
    }

    #[test]
    fn test_run_completes_batch() {
        let coord = coordinator(StubBackend::new().polls_before_done(2));
        let mut batch = batch_of(4);

        let outcome = Executor::new(config(2), &coord).run(&mut batch).unwrap();

        assert!(outcome.completed);
        assert!(!outcome.interrupted);
        assert_eq!(outcome.dispatched, 4);
        assert_eq!(outcome.finished, 4);
        assert_eq!(batch.count_by_status(JobStatus::Completed), 4);
        assert!(batch.started_at().is_some());
        assert!(batch.completed_at().is_some());
    }

    #[test]
    fn test_start_failure_marks_failed_and_continues() {
        let coord = coordinator(
            StubBackend::new().fail_start("rp-1", BackendError::fatal("vault is locked")),
        );
        let mut batch = batch_of(3);

        let outcome = Executor::new(config(1), &coord).run(&mut batch).unwrap();

        assert!(outcome.completed);
        let failed = batch.get("rp-1").unwrap();
        assert_eq!(failed.status(), JobStatus::Failed);
        assert!(failed.operation_handle().is_none());
        assert!(failed.error_message().unwrap().contains("vault is locked"));
        assert_eq!(batch.count_by_status(JobStatus::Completed), 2);
    }

    #[test]
    fn test_remote_failure_message_recorded() {
        let coord = coordinator(
            StubBackend::new().with_outcome("rp-0", RemoteStatus::Failed(Some("denied".into()))),
        );
        let mut batch = batch_of(1);
        Executor::new(config(1), &coord).run(&mut batch).unwrap();
        assert_eq!(batch.records()[0].error_message(), Some("denied"));
        assert!(batch.records()[0].completed_at().is_some());
    }

    #[test]
    fn test_fatal_poll_error_marks_failed() {
        let coord = coordinator(
            StubBackend::new().fail_poll("rp-1", BackendError::fatal("copy job not found")),
        );
        let mut batch = batch_of(3);

        let outcome = Executor::new(config(2), &coord).run(&mut batch).unwrap();

        assert!(outcome.completed);
        let failed = batch.get("rp-1").unwrap();
        assert_eq!(failed.status(), JobStatus::Failed);
        assert_eq!(failed.operation_handle(), Some("op-rp-1"));
        let message = failed.error_message().unwrap();
        assert!(message.starts_with("Status check failed"), "{message}");
        assert!(message.contains("copy job not found"));
        assert_eq!(batch.count_by_status(JobStatus::Completed), 2);
    }

    #[test]
    fn test_poll_retries_exhausted_marks_failed() {
        let coord = coordinator(StubBackend::new().fail_poll(
            "rp-0",
            BackendError::from_code("ThrottlingException", "Rate exceeded"),
        ))
        .with_retry_policy(RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..RetryPolicy::default()
        });
        let mut batch = batch_of(2);

        Executor::new(config(1), &coord).run(&mut batch).unwrap();

        let failed = batch.get("rp-0").unwrap();
        assert_eq!(failed.status(), JobStatus::Failed);
        assert!(failed
            .error_message()
            .unwrap()
            .starts_with("Status check failed"));
        // One poll call per retry attempt, and the job is never started again
        assert_eq!(coord.backend().start_calls("rp-0"), 1);
        assert_eq!(batch.get("rp-1").unwrap().status(), JobStatus::Completed);
        assert_eq!(coord.backend().poll_calls(), 3 + 1);
    }

    #[test]
    fn test_budget_expiring_mid_run_lets_in_flight_jobs_finish() {
        let coord = coordinator(StubBackend::new().polls_before_done(400));
        let mut batch = batch_of(4);
        let cfg = ExecutorConfig {
            max_runtime: Some(Duration::from_millis(250)),
            ..config(2)
        };

        let outcome = Executor::new(cfg, &coord).run(&mut batch).unwrap();

        assert!(outcome.budget_exhausted);
        assert!(!outcome.interrupted);
        assert!(!outcome.completed);
        assert_eq!(outcome.dispatched, 2);
        // Each worker finished the job it held when the budget ran out
        assert_eq!(batch.get("rp-0").unwrap().status(), JobStatus::Completed);
        assert_eq!(batch.get("rp-1").unwrap().status(), JobStatus::Completed);
        for id in ["rp-2", "rp-3"] {
            let record = batch.get(id).unwrap();
            assert_eq!(record.status(), JobStatus::Pending);
            assert!(record.operation_handle().is_none());
        }
        assert_eq!(coord.backend().total_start_calls(), 2);
    }

    #[test]
    fn test_dry_run_skips_everything() {
        let coord = coordinator(StubBackend::new());
        let mut batch = batch_of(3);
        let cfg = ExecutorConfig {
            dry_run: true,
            ..config(2)
        };

        let outcome = Executor::new(cfg, &coord).run(&mut batch).unwrap();

        assert!(outcome.completed);
        assert_eq!(batch.count_by_status(JobStatus::Skipped), 3);
        assert_eq!(batch.records()[0].error_message(), Some(DRY_RUN_REASON));
        assert_eq!(coord.backend().start_attempts(), 0);
        assert_eq!(coord.backend().connect_calls(), 0);
    }

    #[test]
    fn test_zero_budget_dispatches_nothing() {
        let coord = coordinator(StubBackend::new());
        let mut batch = batch_of(3);
        let cfg = ExecutorConfig {
            max_runtime: Some(Duration::ZERO),
            ..config(2)
        };

        let outcome = Executor::new(cfg, &coord).run(&mut batch).unwrap();

        assert!(outcome.budget_exhausted);
        assert!(!outcome.completed);
        assert_eq!(outcome.dispatched, 0);
        assert_eq!(batch.count_by_status(JobStatus::Pending), 3);
    }

    #[test]
    fn test_credential_failure_aborts_run() {
        let coord = coordinator(StubBackend::new().fail_auth_times(100));
        let mut batch = batch_of(4);

        let err = Executor::new(config(2), &coord).run(&mut batch).unwrap_err();

        assert!(matches!(
            err,
            MoverError::Credential(CredentialError::EscalationRequired { .. })
        ));
        assert_eq!(coord.backend().total_start_calls(), 0);
        assert_eq!(batch.count_by_status(JobStatus::Pending), 4);
    }

    #[test]
    fn test_checkpoint_failure_aborts_before_dispatch() {
        let dir = tempdir().unwrap();
        // A directory where the state file should be makes the rename fail
        let blocked = dir.path().join("state.json");
        std::fs::create_dir_all(blocked.join("occupied")).unwrap();
        let store = StateStore::new(&blocked);

        let coord = coordinator(StubBackend::new());
        let mut batch = batch_of(2);
        let err = Executor::new(config(1), &coord)
            .with_state_store(&store)
            .run(&mut batch)
            .unwrap_err();

        assert!(matches!(err, MoverError::State(_)));
        assert_eq!(coord.backend().start_attempts(), 0);
    }

    #[test]
    fn test_progress_sink_sees_every_job() {
        let coord = coordinator(StubBackend::new());
        let mut batch = batch_of(5);
        let calls = AtomicUsize::new(0);
        let last_total = AtomicUsize::new(0);
        let sink = |_: &str, _completed: usize, total: usize| {
            calls.fetch_add(1, Ordering::SeqCst);
            last_total.store(total, Ordering::SeqCst);
        };

        Executor::new(config(3), &coord)
            .with_progress(&sink)
            .run(&mut batch)
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(last_total.load(Ordering::SeqCst), 5);
    }
}
