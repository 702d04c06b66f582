//! Error types for vault-mover
//!
//! This module defines the error hierarchy used across the crate:
//! - Backend errors, classified as transient, authorization or fatal
//! - Credential coordination errors (refresh exhausted, escalation)
//! - Persisted state errors (I/O, unknown schema, malformed documents)
//! - Configuration and worker errors
//!
//! Per-job failures are not errors at this level. They are recorded on the
//! job record itself and reported through [`JobOutcome`].

use std::path::PathBuf;
use thiserror::Error;

/// Backend error codes that indicate expired or invalid credentials
const AUTHORIZATION_CODES: &[&str] = &[
    "ExpiredToken",
    "ExpiredTokenException",
    "InvalidClientTokenId",
    "UnrecognizedClientException",
];

/// Backend error codes that are expected to clear up on retry
const TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "ServiceUnavailable",
    "InternalError",
    "InternalFailure",
    "RequestTimeout",
    "RequestTimeoutException",
];

/// Top-level error type for vault-mover
#[derive(Error, Debug)]
pub enum MoverError {
    /// Backend call failed after all retries
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Credential refresh could not be completed
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Persisted state errors
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Worker/concurrency errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// I/O errors outside of the state file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Interrupted by signal
    #[error("Operation interrupted by signal")]
    Interrupted,
}

/// How the caller should react to a backend error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry locally with backoff
    Transient,
    /// Refresh credentials under the global refresh lock
    Authorization,
    /// Give up on this call
    Fatal,
}

/// Errors reported by the remote operation backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Rate limiting, temporary unavailability, timeouts
    #[error("transient backend error ({code}): {message}")]
    Transient { code: String, message: String },

    /// Expired or invalid credentials
    #[error("authorization rejected ({code}): {message}")]
    Authorization { code: String, message: String },

    /// Anything that will not get better by retrying
    #[error("backend error ({code}): {message}")]
    Fatal { code: String, message: String },
}

impl BackendError {
    /// Classify a backend error by its error code
    pub fn from_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let message = message.into();

        if AUTHORIZATION_CODES.contains(&code.as_str()) {
            BackendError::Authorization { code, message }
        } else if TRANSIENT_CODES.contains(&code.as_str()) {
            BackendError::Transient { code, message }
        } else {
            BackendError::Fatal { code, message }
        }
    }

    /// Build a fatal error that has no backend code
    pub fn fatal(message: impl Into<String>) -> Self {
        BackendError::Fatal {
            code: "Unknown".into(),
            message: message.into(),
        }
    }

    /// Error class of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            BackendError::Transient { .. } => ErrorClass::Transient,
            BackendError::Authorization { .. } => ErrorClass::Authorization,
            BackendError::Fatal { .. } => ErrorClass::Fatal,
        }
    }

    /// Backend error code
    pub fn code(&self) -> &str {
        match self {
            BackendError::Transient { code, .. }
            | BackendError::Authorization { code, .. }
            | BackendError::Fatal { code, .. } => code,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_authorization(&self) -> bool {
        self.class() == ErrorClass::Authorization
    }
}

/// Credential coordination errors
///
/// Every variant aborts the run: the credentials are shared by all workers,
/// so no other job can make progress either.
#[derive(Error, Debug, Clone)]
pub enum CredentialError {
    /// Authorization kept failing after every refresh attempt
    #[error("Credentials still rejected after {attempts} refresh attempts: {last}")]
    Exhausted { attempts: u32, last: BackendError },

    /// Operator intervention needed but no operator is attached
    #[error(
        "Credentials rejected {failures} times in a row; refresh them and resume the run"
    )]
    EscalationRequired { failures: u32 },

    /// Operator cancelled at the refresh prompt
    #[error("Credential refresh cancelled by operator")]
    OperatorAborted,
}

/// Either outcome of a coordinated backend call
#[derive(Error, Debug, Clone)]
pub enum CallError {
    /// Final classified backend error; only affects the job at hand
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Shared credential infrastructure failed
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

impl From<CallError> for MoverError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Backend(e) => MoverError::Backend(e),
            CallError::Credential(e) => MoverError::Credential(e),
        }
    }
}

/// Persisted state errors
#[derive(Error, Debug)]
pub enum StateError {
    /// State file could not be read or written
    #[error("State file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Schema version this build does not understand
    #[error("Unsupported state schema version '{version}' (supported: {supported})")]
    UnsupportedVersion { version: String, supported: String },

    /// Document could not be decoded
    #[error("Malformed state file '{path}': {reason}")]
    Malformed { path: PathBuf, reason: String },

    /// Batch could not be encoded
    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    /// State belongs to a different run
    #[error("State file is for {found}, not {expected}")]
    Mismatch { expected: String, found: String },
}

impl StateError {
    /// True for errors that mean the file contents cannot be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StateError::UnsupportedVersion { .. } | StateError::Malformed { .. }
        )
    }
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid worker count
    #[error("Invalid worker count {count}: must be between 1 and {max}")]
    InvalidWorkerCount { count: usize, max: usize },

    /// Invalid poll interval
    #[error("Invalid poll interval: must be at least one second")]
    InvalidPollInterval,

    /// Manifest missing or unreadable
    #[error("Invalid manifest '{path}': {reason}")]
    InvalidManifest { path: PathBuf, reason: String },

    /// Region name not recognized
    #[error("Invalid region '{0}'")]
    InvalidRegion(String),

    /// Service role is not an IAM role ARN
    #[error("Invalid role ARN '{0}'")]
    InvalidRoleArn(String),

    /// Mutually exclusive flags
    #[error("Cannot use --{0} and --{1} together")]
    Conflict(&'static str, &'static str),

    /// Missing required input
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// Worker thread errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Worker panicked
    #[error("Worker {id} panicked: {message}")]
    Panicked { id: usize, message: String },

    /// Worker thread could not be started
    #[error("Failed to start worker {id}: {reason}")]
    SpawnFailed { id: usize, reason: String },
}

/// Result type alias for MoverError
pub type Result<T> = std::result::Result<T, MoverError>;

/// Result type alias for StateError
pub type StateResult<T> = std::result::Result<T, StateError>;

/// How a single job ended up after a worker let go of it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Backend reported success
    Completed,

    /// Start or poll failed; the message is on the record
    Failed { message: String },

    /// Cancelled before dispatch
    LeftPending,

    /// Cancelled while polling; resumable from the stored handle
    LeftInProgress,
}
