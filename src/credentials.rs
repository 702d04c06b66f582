//! Credential coordination for backend calls
//!
//! Every backend call made by a worker goes through [`CredentialCoordinator::call`],
//! which handles two independent failure classes:
//!
//! ```text
//!            ┌─────────────── refresh gate (refresh_lock) ───────────────┐
//!  worker ──▶│ session(region) ──▶ op(backend, session)                  │
//!            └───────────────────────────┬───────────────────────────────┘
//!                                        │
//!        ┌───────────────┬───────────────┼────────────────┐
//!        ▼               ▼               ▼                ▼
//!       Ok          Transient      Authorization        Fatal
//!   reset auth     sleep backoff   refresh(generation)  return
//!   failures       and retry       and retry
//! ```
//!
//! A refresh holds the global refresh lock for its whole duration, so every
//! other worker blocks at the gate until sessions are fresh again. The refresh
//! lock is always taken before the session map lock, never the reverse.
//!
//! Sessions carry a generation number. A worker that saw an authorization
//! failure on generation `g` skips its refresh if the generation moved while
//! it waited for the lock, so one expiry clears the sessions exactly once no
//! matter how many workers observed it.

use crate::backend::{Backend, JobDescriptor, OperationHandle, RemoteStatus};
use crate::error::{BackendError, CallError, CredentialError, ErrorClass};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Backoff for transient backend errors
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first call
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    pub initial_delay: Duration,

    /// Upper bound on any single delay
    pub max_delay: Duration,

    /// Growth factor between consecutive delays
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.max(0.0).powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Refresh behavior for authorization failures
#[derive(Debug, Clone)]
pub struct CredentialPolicy {
    /// Backoff after the 1st, 2nd, ... consecutive failure
    pub auth_delays: Vec<Duration>,

    /// Consecutive failures that trigger operator escalation
    pub max_auth_failures: u32,

    /// Attempts a single call may make before giving up
    pub max_auth_attempts: u32,
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self {
            auth_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
            max_auth_failures: 3,
            max_auth_attempts: 4,
        }
    }
}

impl CredentialPolicy {
    /// Backoff after `failures` consecutive failures; the last delay repeats
    pub fn auth_delay(&self, failures: u32) -> Duration {
        let index = failures.saturating_sub(1) as usize;
        self.auth_delays
            .get(index)
            .or_else(|| self.auth_delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// Blocking operator acknowledgment after repeated authorization failures
pub trait OperatorPrompt: Send + Sync {
    /// Block until the operator confirms credentials were refreshed
    fn acknowledge(&self, failures: u32) -> Result<(), CredentialError>;
}

/// How often a waiting prompt checks for cancellation
const PROMPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Prompt on the terminal and wait for Enter
///
/// Stdin is read on a helper thread. The prompt runs under the refresh lock,
/// so the cancel check is what lets Ctrl+C end the wait.
#[derive(Default)]
pub struct StdinPrompt {
    cancel: Option<Box<dyn Fn() -> bool + Send + Sync>>,
}

impl StdinPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop waiting as soon as `cancel` returns true
    pub fn with_cancel(mut self, cancel: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.cancel = Some(Box::new(cancel));
        self
    }
}

impl OperatorPrompt for StdinPrompt {
    fn acknowledge(&self, failures: u32) -> Result<(), CredentialError> {
        let mut stderr = io::stderr().lock();
        let _ = writeln!(
            stderr,
            "\nCredentials were rejected {failures} times in a row.\n\
             Refresh them (for example `aws sso login`), then press Enter to continue."
        );
        let _ = stderr.flush();
        drop(stderr);

        // A cancelled wait leaves this thread blocked on stdin until exit
        let (tx, rx) = bounded(1);
        thread::Builder::new()
            .name("credential-prompt".into())
            .spawn(move || {
                let mut line = String::new();
                let entered = matches!(io::stdin().lock().read_line(&mut line), Ok(n) if n > 0);
                let _ = tx.send(entered);
            })
            .map_err(|_| CredentialError::OperatorAborted)?;

        let never = || false;
        let cancel: &dyn Fn() -> bool = match &self.cancel {
            Some(cancel) => cancel.as_ref(),
            None => &never,
        };
        await_acknowledgement(&rx, cancel)?;
        info!("Operator confirmed credential refresh");
        Ok(())
    }
}

/// Wait for the operator's answer, giving up once `cancel` fires
///
/// End of input counts as a refusal.
fn await_acknowledgement(
    answers: &Receiver<bool>,
    cancel: &dyn Fn() -> bool,
) -> Result<(), CredentialError> {
    loop {
        if cancel() {
            warn!("Shutdown requested while waiting for credential refresh");
            return Err(CredentialError::OperatorAborted);
        }
        match answers.recv_timeout(PROMPT_POLL_INTERVAL) {
            Ok(true) => return Ok(()),
            Ok(false) | Err(RecvTimeoutError::Disconnected) => {
                return Err(CredentialError::OperatorAborted)
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

/// Fail instead of prompting; used when nobody is attached to the terminal
pub struct NonInteractive;

impl OperatorPrompt for NonInteractive {
    fn acknowledge(&self, failures: u32) -> Result<(), CredentialError> {
        Err(CredentialError::EscalationRequired { failures })
    }
}

/// Owns backend sessions and wraps every backend call
pub struct CredentialCoordinator<B: Backend> {
    backend: B,
    retry: RetryPolicy,
    policy: CredentialPolicy,
    prompt: Box<dyn OperatorPrompt>,

    /// Held for the whole duration of a refresh; briefly taken as a gate by every call
    refresh_lock: Mutex<()>,

    /// Cached session per region
    sessions: Mutex<HashMap<String, Arc<B::Session>>>,

    /// Bumped on every clear
    generation: AtomicU64,

    /// Consecutive authorization failures across all workers
    auth_failures: AtomicU32,

    sessions_cleared: AtomicU64,
}

impl<B: Backend> CredentialCoordinator<B> {
    /// Coordinator with default policies and an interactive prompt
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            retry: RetryPolicy::default(),
            policy: CredentialPolicy::default(),
            prompt: Box::new(StdinPrompt::new()),
            refresh_lock: Mutex::new(()),
            sessions: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            auth_failures: AtomicU32::new(0),
            sessions_cleared: AtomicU64::new(0),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_credential_policy(mut self, policy: CredentialPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_prompt(mut self, prompt: impl OperatorPrompt + 'static) -> Self {
        self.prompt = Box::new(prompt);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Number of times the session cache was dropped
    pub fn sessions_cleared(&self) -> u64 {
        self.sessions_cleared.load(Ordering::SeqCst)
    }

    /// Consecutive authorization failures not yet followed by a success
    pub fn consecutive_auth_failures(&self) -> u32 {
        self.auth_failures.load(Ordering::SeqCst)
    }

    /// Start a job through the coordinator
    pub fn start(
        &self,
        region: &str,
        job: &JobDescriptor<'_>,
    ) -> Result<OperationHandle, CallError> {
        self.call(region, |backend, session| backend.start(session, job))
    }

    /// Poll an operation through the coordinator
    pub fn poll(&self, region: &str, handle: &OperationHandle) -> Result<RemoteStatus, CallError> {
        self.call(region, |backend, session| backend.poll(session, handle))
    }

    /// Run one logical backend call with both retry policies applied
    pub fn call<T, F>(&self, region: &str, op: F) -> Result<T, CallError>
    where
        F: Fn(&B, &B::Session) -> Result<T, BackendError>,
    {
        let mut transient_attempts = 0u32;
        let mut auth_attempts = 0u32;

        loop {
            // Wait out any refresh in progress
            drop(self.refresh_lock.lock());

            let generation = self.generation.load(Ordering::SeqCst);
            let result = self
                .session(region)
                .and_then(|session| op(&self.backend, &session));

            let err = match result {
                Ok(value) => {
                    self.auth_failures.store(0, Ordering::SeqCst);
                    return Ok(value);
                }
                Err(err) => err,
            };

            match err.class() {
                ErrorClass::Authorization => {
                    auth_attempts += 1;
                    if auth_attempts >= self.policy.max_auth_attempts {
                        warn!(attempts = auth_attempts, error = %err, "Credentials still rejected, giving up");
                        return Err(CredentialError::Exhausted {
                            attempts: auth_attempts,
                            last: err,
                        }
                        .into());
                    }
                    warn!(region, code = err.code(), "Authorization failure, refreshing sessions");
                    self.refresh(generation)?;
                }
                ErrorClass::Transient => {
                    transient_attempts += 1;
                    if transient_attempts >= self.retry.max_attempts {
                        warn!(attempts = transient_attempts, error = %err, "Transient error persisted");
                        return Err(err.into());
                    }
                    let delay = self.retry.delay_for(transient_attempts);
                    warn!(
                        code = err.code(),
                        attempt = transient_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Transient backend error, retrying"
                    );
                    thread::sleep(delay);
                }
                ErrorClass::Fatal => return Err(err.into()),
            }
        }
    }

    /// Cached session for `region`, connecting on first use
    fn session(&self, region: &str) -> Result<Arc<B::Session>, BackendError> {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(region) {
            return Ok(Arc::clone(session));
        }
        let session = Arc::new(self.backend.connect(region)?);
        debug!(region, "Opened backend session");
        sessions.insert(region.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Refresh after an authorization failure seen on `observed` generation
    fn refresh(&self, observed: u64) -> Result<(), CredentialError> {
        let _guard = self.refresh_lock.lock();

        if self.generation.load(Ordering::SeqCst) != observed {
            debug!("Sessions already refreshed by another worker");
            return Ok(());
        }

        let failures = self.auth_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.policy.max_auth_failures {
            warn!(failures, "Repeated authorization failures, operator action needed");
            self.prompt.acknowledge(failures)?;
            self.auth_failures.store(0, Ordering::SeqCst);
            self.clear_sessions();
        } else {
            self.clear_sessions();
            let delay = self.policy.auth_delay(failures);
            info!(
                failures,
                delay_ms = delay.as_millis() as u64,
                "Backend sessions cleared, backing off before retry"
            );
            thread::sleep(delay);
        }
        Ok(())
    }

    /// Drop every cached session; caller holds the refresh lock
    fn clear_sessions(&self) {
        let mut sessions = self.sessions.lock();
        sessions.clear();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.sessions_cleared.fetch_add(1, Ordering::SeqCst);
    }
}
