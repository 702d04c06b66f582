//! Remote operation backend
//!
//! The backend accepts a start request for one job, hands back an opaque
//! operation handle, and reports the status of that handle when polled.
//!
//! ```text
//! ┌──────────────────────────┐   start(job)    ┌──────────────────┐
//! │  CredentialCoordinator   │ ──────────────▶ │     Backend      │
//! │  - owns sessions         │ ◀────────────── │  SdkBackend      │
//! │  - retries / refreshes   │   poll(handle)  │  StubBackend     │
//! └──────────────────────────┘                 └──────────────────┘
//! ```
//!
//! Workers never hold sessions. They go through the coordinator, which opens
//! sessions with [`Backend::connect`] and drops them all when credentials
//! expire.

mod sdk;
mod stub;

pub use sdk::{SdkBackend, SdkBackendConfig, SdkSession};
pub use stub::{StubBackend, StubSession};

use crate::error::BackendError;

/// Opaque backend operation identifier
pub type OperationHandle = String;

/// Everything the backend needs to start one copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDescriptor<'a> {
    /// Item being copied
    pub source_id: &'a str,
    /// Target location of the copy
    pub target: &'a str,
    /// Batch-level source identifier
    pub source: &'a str,
    /// Batch-level destination identifier
    pub destination: &'a str,
}

/// Status reported for a running operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Running,
    Completed,
    /// Failed, with the backend's status message if it gave one
    Failed(Option<String>),
}

impl RemoteStatus {
    /// Map a backend state string to a status
    ///
    /// Unknown states count as running: the poll loop keeps going until the
    /// backend reports something terminal.
    pub fn parse(state: &str, message: Option<String>) -> Self {
        match state.to_ascii_uppercase().as_str() {
            "COMPLETED" => RemoteStatus::Completed,
            "FAILED" | "ABORTED" | "PARTIAL" => RemoteStatus::Failed(message),
            _ => RemoteStatus::Running,
        }
    }
}

/// Result of checking one permission before a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionCheck {
    /// IAM action, e.g. `backup:ListBackupVaults`
    pub permission: &'static str,
    pub granted: bool,
    /// Backend message when the permission was denied
    pub error: Option<String>,
}

impl PermissionCheck {
    pub fn granted(permission: &'static str) -> Self {
        Self {
            permission,
            granted: true,
            error: None,
        }
    }

    pub fn denied(permission: &'static str, error: impl Into<String>) -> Self {
        Self {
            permission,
            granted: false,
            error: Some(error.into()),
        }
    }
}

/// Permissions checked before the first copy job starts
pub const CHECKED_PERMISSIONS: &[&str] = &["backup:ListBackupVaults", "backup:DescribeBackupVault"];

/// Backend error codes meaning the caller lacks a permission
pub(crate) const ACCESS_DENIED_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "UnauthorizedOperation",
];

/// A backend that can run copy operations
pub trait Backend: Send + Sync {
    /// Per-region session handle, owned by the credential coordinator
    type Session: Send + Sync;

    /// Open a session for a region
    fn connect(&self, region: &str) -> Result<Self::Session, BackendError>;

    /// Start a copy and return its operation handle
    fn start(
        &self,
        session: &Self::Session,
        job: &JobDescriptor<'_>,
    ) -> Result<OperationHandle, BackendError>;

    /// Report the current status of an operation
    fn poll(
        &self,
        session: &Self::Session,
        handle: &OperationHandle,
    ) -> Result<RemoteStatus, BackendError>;

    /// Check the caller may read `source_vault` and run copies out of it
    ///
    /// A denied permission is reported in the result, not as an error.
    /// Authorization errors are still returned so the coordinator refreshes.
    fn check_permissions(
        &self,
        session: &Self::Session,
        source_vault: &str,
    ) -> Result<Vec<PermissionCheck>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_status_parse() {
        assert_eq!(RemoteStatus::parse("COMPLETED", None), RemoteStatus::Completed);
        assert_eq!(RemoteStatus::parse("running", None), RemoteStatus::Running);
        assert_eq!(RemoteStatus::parse("CREATED", None), RemoteStatus::Running);
        assert_eq!(
            RemoteStatus::parse("FAILED", Some("vault locked".into())),
            RemoteStatus::Failed(Some("vault locked".into()))
        );
        assert_eq!(RemoteStatus::parse("ABORTED", None), RemoteStatus::Failed(None));
        assert_eq!(RemoteStatus::parse("SOMETHING_NEW", None), RemoteStatus::Running);
    }
}
