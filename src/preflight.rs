//! Permission check run before the first copy job starts
//!
//! A run with missing permissions would otherwise fail every job one by one.
//! The check goes through the credential coordinator like any other backend
//! call, so expired credentials are refreshed before anything is reported.

use crate::backend::{Backend, PermissionCheck};
use crate::credentials::CredentialCoordinator;
use crate::error::Result;
use tracing::{debug, info, warn};

/// Outcome of the permission check for one region
#[derive(Debug, Clone)]
pub struct PermissionReport {
    pub region: String,
    pub checks: Vec<PermissionCheck>,
}

impl PermissionReport {
    pub fn all_granted(&self) -> bool {
        self.checks.iter().all(|c| c.granted)
    }

    /// Checks that came back denied
    pub fn denied(&self) -> impl Iterator<Item = &PermissionCheck> {
        self.checks.iter().filter(|c| !c.granted)
    }
}

/// Check the permissions a copy out of `source_vault` needs in `region`
pub fn validate_permissions<B: Backend>(
    coordinator: &CredentialCoordinator<B>,
    region: &str,
    source_vault: &str,
) -> Result<PermissionReport> {
    info!(region, source_vault, "Validating IAM permissions");

    let checks = coordinator.call(region, |backend, session| {
        backend.check_permissions(session, source_vault)
    })?;

    for check in &checks {
        if check.granted {
            debug!(permission = check.permission, "Permission granted");
        } else {
            warn!(
                permission = check.permission,
                error = check.error.as_deref().unwrap_or(""),
                "Permission denied"
            );
        }
    }

    Ok(PermissionReport {
        region: region.to_string(),
        checks,
    })
}
