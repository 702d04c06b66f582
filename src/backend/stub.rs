//! Deterministic in-process backend
//!
//! Used by the test suite and by `--stub-backend` dry-rehearsal runs. Every
//! behavior is scripted up front with the builder methods, and every call is
//! counted so tests can assert on dispatch and session behavior.

use super::{
    Backend, JobDescriptor, OperationHandle, PermissionCheck, RemoteStatus, CHECKED_PERMISSIONS,
};
use crate::error::BackendError;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Session handed out by the stub; `id` increases with every connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubSession {
    pub id: u64,
    pub region: String,
}

#[derive(Debug, Default)]
struct StubState {
    /// Permanent start failures by source id
    start_failures: HashMap<String, BackendError>,

    /// Accepted start calls by source id
    start_calls: HashMap<String, usize>,

    /// Poll failures by source id
    poll_failures: HashMap<String, BackendError>,

    /// Permissions reported as denied
    denied_permissions: HashSet<String>,

    /// Region of every connect, in call order
    connected_regions: Vec<String>,

    /// Handle -> (source id, polls so far)
    handles: HashMap<String, (String, usize)>,

    /// Terminal statuses handed out in poll order
    status_script: VecDeque<RemoteStatus>,

    /// Terminal status by source id
    outcomes: HashMap<String, RemoteStatus>,

    /// Next N calls are rejected as expired credentials
    auth_failures: usize,

    /// Next N calls are throttled
    transient_failures: usize,

    /// Calls made with this session are rejected as expired credentials
    expired_session: Option<u64>,
}

/// Scriptable backend stub
#[derive(Debug)]
pub struct StubBackend {
    state: Mutex<StubState>,
    polls_before_done: usize,
    start_delay: Duration,
    poll_delay: Duration,
    connects: AtomicU64,
    start_attempts: AtomicUsize,
    poll_calls: AtomicUsize,
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StubBackend {
    /// Every job completes on its first poll
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StubState::default()),
            polls_before_done: 0,
            start_delay: Duration::ZERO,
            poll_delay: Duration::ZERO,
            connects: AtomicU64::new(0),
            start_attempts: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
        }
    }

    /// Report RUNNING this many times before the terminal status
    pub fn polls_before_done(mut self, polls: usize) -> Self {
        self.polls_before_done = polls;
        self
    }

    /// Jobs never leave RUNNING
    pub fn never_finish(self) -> Self {
        self.polls_before_done(usize::MAX)
    }

    /// Terminal statuses handed out in the order polls reach them
    pub fn with_status_sequence(mut self, statuses: impl IntoIterator<Item = RemoteStatus>) -> Self {
        self.state.get_mut().status_script = statuses.into_iter().collect();
        self
    }

    /// Fixed terminal status for one source id
    pub fn with_outcome(mut self, source_id: &str, status: RemoteStatus) -> Self {
        self.state
            .get_mut()
            .outcomes
            .insert(source_id.to_string(), status);
        self
    }

    /// Every start for this source id fails with `error`
    pub fn fail_start(mut self, source_id: &str, error: BackendError) -> Self {
        self.state
            .get_mut()
            .start_failures
            .insert(source_id.to_string(), error);
        self
    }

    /// Every poll of this source id's operation fails with `error`
    pub fn fail_poll(mut self, source_id: &str, error: BackendError) -> Self {
        self.state
            .get_mut()
            .poll_failures
            .insert(source_id.to_string(), error);
        self
    }

    /// Report `permission` as denied by the permission check
    pub fn deny_permission(mut self, permission: &str) -> Self {
        self.state
            .get_mut()
            .denied_permissions
            .insert(permission.to_string());
        self
    }

    /// Reject the next `n` calls with an expired-token error
    pub fn fail_auth_times(mut self, n: usize) -> Self {
        self.state.get_mut().auth_failures = n;
        self
    }

    /// Throttle the next `n` calls
    pub fn fail_transient_times(mut self, n: usize) -> Self {
        self.state.get_mut().transient_failures = n;
        self
    }

    /// Every call made with the first session opened is rejected as expired
    pub fn expire_first_session(mut self) -> Self {
        self.state.get_mut().expired_session = Some(1);
        self
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    /// Accepted start calls for one source id
    pub fn start_calls(&self, source_id: &str) -> usize {
        self.state
            .lock()
            .start_calls
            .get(source_id)
            .copied()
            .unwrap_or(0)
    }

    /// Accepted start calls across all source ids
    pub fn total_start_calls(&self) -> usize {
        self.state.lock().start_calls.values().sum()
    }

    /// Start calls including rejected ones
    pub fn start_attempts(&self) -> usize {
        self.start_attempts.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Regions sessions were opened for, in call order
    pub fn connected_regions(&self) -> Vec<String> {
        self.state.lock().connected_regions.clone()
    }

    /// Scripted auth/transient rejection shared by start and poll
    fn check_rejections(state: &mut StubState, session: &StubSession) -> Result<(), BackendError> {
        if state.expired_session == Some(session.id) {
            return Err(expired_token());
        }
        if state.auth_failures > 0 {
            state.auth_failures -= 1;
            return Err(expired_token());
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(BackendError::from_code("ThrottlingException", "Rate exceeded"));
        }
        Ok(())
    }
}

fn expired_token() -> BackendError {
    BackendError::from_code(
        "ExpiredTokenException",
        "The security token included in the request is expired",
    )
}

impl Backend for StubBackend {
    type Session = StubSession;

    fn connect(&self, region: &str) -> Result<StubSession, BackendError> {
        let id = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.lock().connected_regions.push(region.to_string());
        Ok(StubSession {
            id,
            region: region.to_string(),
        })
    }

    fn start(
        &self,
        session: &StubSession,
        job: &JobDescriptor<'_>,
    ) -> Result<OperationHandle, BackendError> {
        self.start_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.start_delay.is_zero() {
            thread::sleep(self.start_delay);
        }

        let mut state = self.state.lock();
        Self::check_rejections(&mut state, session)?;

        *state
            .start_calls
            .entry(job.source_id.to_string())
            .or_insert(0) += 1;

        if let Some(err) = state.start_failures.get(job.source_id) {
            return Err(err.clone());
        }

        let handle = format!("op-{}", job.source_id);
        state
            .handles
            .insert(handle.clone(), (job.source_id.to_string(), 0));
        Ok(handle)
    }

    fn poll(
        &self,
        session: &StubSession,
        handle: &OperationHandle,
    ) -> Result<RemoteStatus, BackendError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        if !self.poll_delay.is_zero() {
            thread::sleep(self.poll_delay);
        }

        let mut state = self.state.lock();
        Self::check_rejections(&mut state, session)?;

        // Handles from a previous process are polled as if freshly started
        let (source_id, polls) = {
            let entry = state
                .handles
                .entry(handle.clone())
                .or_insert_with(|| {
                    let source = handle.strip_prefix("op-").unwrap_or(handle).to_string();
                    (source, 0)
                });
            entry.1 += 1;
            (entry.0.clone(), entry.1)
        };

        if let Some(err) = state.poll_failures.get(&source_id) {
            return Err(err.clone());
        }

        if polls <= self.polls_before_done {
            return Ok(RemoteStatus::Running);
        }

        if let Some(status) = state.outcomes.get(&source_id) {
            return Ok(status.clone());
        }
        Ok(state
            .status_script
            .pop_front()
            .unwrap_or(RemoteStatus::Completed))
    }

    fn check_permissions(
        &self,
        session: &StubSession,
        _source_vault: &str,
    ) -> Result<Vec<PermissionCheck>, BackendError> {
        let mut state = self.state.lock();
        Self::check_rejections(&mut state, session)?;

        Ok(CHECKED_PERMISSIONS
            .iter()
            .map(|&permission| {
                if state.denied_permissions.contains(permission) {
                    PermissionCheck::denied(permission, "AccessDeniedException: not authorized")
                } else {
                    PermissionCheck::granted(permission)
                }
            })
            .collect())
    }
}
