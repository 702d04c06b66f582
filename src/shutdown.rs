//! Cooperative shutdown
//!
//! The signal handler does nothing but flip a flag. Workers observe the flag
//! through [`ShutdownCoordinator::checker`]; the main thread notices the
//! interrupted run, flushes state once with [`ShutdownCoordinator::flush_once`]
//! and exits.
//!
//! ```text
//!   ARMED ──signal / request()──▶ SHUTDOWN_REQUESTED
//!                                   (second signal exits immediately)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Exit status used after an interrupt
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Shutdown state; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Armed,
    ShutdownRequested,
}

/// Result of a flush attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Flushed,
    /// The callback failed; it is not retried
    Failed(String),
    /// An earlier call already ran the callback
    AlreadyFlushed,
}

#[derive(Debug, Default)]
struct Inner {
    state: AtomicU8,
    flushed: AtomicBool,
}

const ARMED: u8 = 0;
const REQUESTED: u8 = 1;

/// Shared shutdown flag plus the run-once flush guard
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route SIGINT/SIGTERM to this coordinator
    ///
    /// The first signal requests shutdown; a second one exits the process
    /// right away with status 130.
    pub fn install(&self) -> Result<(), ctrlc::Error> {
        let coordinator = self.clone();
        ctrlc::set_handler(move || {
            if coordinator.request() {
                eprintln!("\nInterrupted, finishing in-flight polls and saving state (press Ctrl+C again to exit now)");
            } else {
                eprintln!("\nExiting immediately");
                std::process::exit(INTERRUPTED_EXIT_CODE);
            }
        })
    }

    /// Request shutdown; returns false if it was already requested
    pub fn request(&self) -> bool {
        let first = self
            .inner
            .state
            .compare_exchange(ARMED, REQUESTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            info!("Shutdown requested");
        }
        first
    }

    pub fn state(&self) -> ShutdownState {
        match self.inner.state.load(Ordering::SeqCst) {
            ARMED => ShutdownState::Armed,
            _ => ShutdownState::ShutdownRequested,
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.state() == ShutdownState::ShutdownRequested
    }

    /// Cloneable predicate for the executor's cancellation check
    pub fn checker(&self) -> impl Fn() -> bool + Send + Sync + Clone + 'static {
        let inner = Arc::clone(&self.inner);
        move || inner.state.load(Ordering::SeqCst) != ARMED
    }

    /// Run `flush` unless some earlier call already did
    pub fn flush_once<F, E>(&self, flush: F) -> FlushOutcome
    where
        F: FnOnce() -> Result<(), E>,
        E: std::fmt::Display,
    {
        if self.inner.flushed.swap(true, Ordering::SeqCst) {
            warn!("State flush already attempted");
            return FlushOutcome::AlreadyFlushed;
        }
        match flush() {
            Ok(()) => {
                info!("State flushed");
                FlushOutcome::Flushed
            }
            Err(e) => {
                error!(error = %e, "State flush failed");
                FlushOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_request_is_one_way() {
        let shutdown = ShutdownCoordinator::new();
        assert_eq!(shutdown.state(), ShutdownState::Armed);
        assert!(!shutdown.is_shutdown_requested());

        assert!(shutdown.request());
        assert!(!shutdown.request());
        assert_eq!(shutdown.state(), ShutdownState::ShutdownRequested);
    }

    #[test]
    fn test_checker_sees_request_from_clone() {
        let shutdown = ShutdownCoordinator::new();
        let check = shutdown.checker();
        let other = shutdown.clone();
        assert!(!check());
        other.request();
        assert!(check());
    }

    #[test]
    fn test_flush_runs_once() {
        let shutdown = ShutdownCoordinator::new();
        let calls = Cell::new(0);

        let first = shutdown.flush_once(|| {
            calls.set(calls.get() + 1);
            Ok::<_, String>(())
        });
        let second = shutdown.flush_once(|| {
            calls.set(calls.get() + 1);
            Ok::<_, String>(())
        });

        assert_eq!(first, FlushOutcome::Flushed);
        assert_eq!(second, FlushOutcome::AlreadyFlushed);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_failed_flush_not_retried() {
        let shutdown = ShutdownCoordinator::new();
        let outcome = shutdown.flush_once(|| Err("disk full"));
        assert_eq!(outcome, FlushOutcome::Failed("disk full".into()));
        assert_eq!(
            shutdown.flush_once(|| Ok::<_, &str>(())),
            FlushOutcome::AlreadyFlushed
        );
    }
}
