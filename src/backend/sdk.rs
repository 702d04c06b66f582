//! Backend adapter for the backup service, built on the AWS SDK
//!
//! One session per region holds the loaded SDK configuration and a backup
//! client:
//! - `connect`: load shared config for the region, then `GetCallerIdentity`
//! - `start`: `StartCopyJob`, returning the `CopyJobId`
//! - `poll`: `DescribeCopyJob`, mapping `CopyJob.State`
//!
//! Workers are plain threads, so every SDK future is driven to completion on
//! a runtime owned by the backend.

use super::{
    Backend, JobDescriptor, OperationHandle, PermissionCheck, RemoteStatus, ACCESS_DENIED_CODES,
};
use crate::error::BackendError;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::provider::error::CredentialsError;
use aws_sdk_backup::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, trace, warn};

/// Threads driving SDK futures; the workers do the waiting
const RUNTIME_THREADS: usize = 2;

/// Adapter configuration
#[derive(Debug, Clone)]
pub struct SdkBackendConfig {
    /// Named credentials profile; the default chain is used when unset
    pub profile: Option<String>,

    /// Service role the backup service assumes for the copy
    pub role_arn: String,
}

/// Loaded configuration and backup client for one region
#[derive(Debug, Clone)]
pub struct SdkSession {
    pub region: String,

    /// Caller identity ARN reported at connect time
    pub identity: String,

    client: aws_sdk_backup::Client,
}

/// Real backend adapter
pub struct SdkBackend {
    config: SdkBackendConfig,
    runtime: Runtime,
}

/// Where in the request lifecycle an SDK call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureKind {
    /// The service answered with an error
    Service,
    /// The request never got a response
    Transport,
    /// The request could not be built, credentials included
    Construction,
}

impl SdkBackend {
    pub fn new(config: SdkBackendConfig) -> crate::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(RUNTIME_THREADS)
            .thread_name("mover-sdk")
            .enable_all()
            .build()?;
        Ok(Self { config, runtime })
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

impl fmt::Debug for SdkBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdkBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Classify an SDK error by its service error code
fn classify<E, R>(err: &SdkError<E, R>) -> BackendError
where
    E: ProvideErrorMetadata + StdError + 'static,
    R: fmt::Debug + 'static,
{
    let kind = match err {
        SdkError::ServiceError(_) | SdkError::ResponseError(_) => FailureKind::Service,
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => FailureKind::Transport,
        _ => FailureKind::Construction,
    };
    let code = err.as_service_error().and_then(|e| e.code());
    let message = DisplayErrorContext(err).to_string();
    classify_failure(kind, code, message, err)
}

/// Map a failed call onto the transient / authorization / fatal classes
///
/// Credentials that cannot be resolved (an expired SSO token, a profile
/// without credentials) never reach the service, so they carry no error
/// code. They are found by walking the error's source chain instead.
pub(crate) fn classify_failure(
    kind: FailureKind,
    code: Option<&str>,
    message: String,
    source: &(dyn StdError + 'static),
) -> BackendError {
    if credentials_unavailable(source) {
        return BackendError::Authorization {
            code: "CredentialsUnavailable".into(),
            message,
        };
    }

    match (code, kind) {
        (Some(code), _) => BackendError::from_code(code, message),
        (None, FailureKind::Transport) => BackendError::Transient {
            code: "DispatchFailure".into(),
            message,
        },
        (None, FailureKind::Service) => BackendError::Fatal {
            code: "UnknownServiceError".into(),
            message,
        },
        (None, FailureKind::Construction) => BackendError::Fatal {
            code: "RequestConstruction".into(),
            message,
        },
    }
}

fn credentials_unavailable(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<CredentialsError>() {
            return true;
        }
        current = e.source();
    }
    false
}

/// Fold the outcome of one checking call into a permission result
pub(crate) fn permission_result(
    permission: &'static str,
    result: Result<(), BackendError>,
) -> Result<PermissionCheck, BackendError> {
    match result {
        Ok(()) => Ok(PermissionCheck::granted(permission)),
        Err(err) if ACCESS_DENIED_CODES.contains(&err.code()) => {
            Ok(PermissionCheck::denied(permission, err.to_string()))
        }
        // Left to the coordinator to refresh or retry
        Err(err) if err.is_authorization() || err.is_transient() => Err(err),
        // A missing vault or a bad parameter says nothing about permissions
        Err(err) => {
            warn!(permission, error = %err, "Permission check inconclusive, assuming granted");
            Ok(PermissionCheck::granted(permission))
        }
    }
}

impl Backend for SdkBackend {
    type Session = SdkSession;

    fn connect(&self, region: &str) -> Result<SdkSession, BackendError> {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));
        if let Some(profile) = &self.config.profile {
            loader = loader.profile_name(profile);
        }
        let shared = self.block_on(loader.load());

        let caller = self
            .block_on(aws_sdk_sts::Client::new(&shared).get_caller_identity().send())
            .map_err(|e| classify(&e))?;
        let identity = caller.arn().unwrap_or("unknown").to_string();
        debug!(region, identity = %identity, "Backend session opened");

        Ok(SdkSession {
            region: region.to_string(),
            identity,
            client: aws_sdk_backup::Client::new(&shared),
        })
    }

    fn start(
        &self,
        session: &SdkSession,
        job: &JobDescriptor<'_>,
    ) -> Result<OperationHandle, BackendError> {
        trace!(source_id = job.source_id, region = %session.region, "StartCopyJob");
        let out = self
            .block_on(
                session
                    .client
                    .start_copy_job()
                    .recovery_point_arn(job.source_id)
                    .source_backup_vault_name(job.source)
                    .destination_backup_vault_arn(job.target)
                    .iam_role_arn(&self.config.role_arn)
                    .send(),
            )
            .map_err(|e| classify(&e))?;

        out.copy_job_id()
            .map(str::to_string)
            .ok_or_else(|| BackendError::Fatal {
                code: "InvalidResponse".into(),
                message: "StartCopyJob returned no copy job id".into(),
            })
    }

    fn poll(
        &self,
        session: &SdkSession,
        handle: &OperationHandle,
    ) -> Result<RemoteStatus, BackendError> {
        let out = self
            .block_on(session.client.describe_copy_job().copy_job_id(handle).send())
            .map_err(|e| classify(&e))?;

        let job = out.copy_job().ok_or_else(|| BackendError::Fatal {
            code: "InvalidResponse".into(),
            message: format!("DescribeCopyJob returned no copy job for '{}'", handle),
        })?;
        let state = job.state().map(|s| s.as_str()).unwrap_or("UNKNOWN");
        Ok(RemoteStatus::parse(
            state,
            job.status_message().map(str::to_string),
        ))
    }

    fn check_permissions(
        &self,
        session: &SdkSession,
        source_vault: &str,
    ) -> Result<Vec<PermissionCheck>, BackendError> {
        let listed = self
            .block_on(session.client.list_backup_vaults().max_results(1).send())
            .map(|_| ())
            .map_err(|e| classify(&e));
        let described = self
            .block_on(
                session
                    .client
                    .describe_backup_vault()
                    .backup_vault_name(source_vault)
                    .send(),
            )
            .map(|_| ())
            .map_err(|e| classify(&e));

        Ok(vec![
            permission_result("backup:ListBackupVaults", listed)?,
            permission_result("backup:DescribeBackupVault", described)?,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use std::io;

    #[derive(Debug, thiserror::Error)]
    #[error("failed to resolve identity")]
    struct ResolveFailed(#[source] CredentialsError);

    fn other() -> io::Error {
        io::Error::other("request failed")
    }

    #[test]
    fn test_classify_expired_sso_token() {
        let expired = CredentialsError::provider_error("the SSO session has expired");
        let err = classify_failure(FailureKind::Construction, None, "expired".into(), &expired);
        assert_eq!(err.class(), ErrorClass::Authorization);
        assert_eq!(err.code(), "CredentialsUnavailable");

        let wrapped = ResolveFailed(CredentialsError::provider_error("Token has expired"));
        let err = classify_failure(FailureKind::Transport, None, "expired".into(), &wrapped);
        assert!(err.is_authorization());
    }

    #[test]
    fn test_classify_service_codes() {
        let err = classify_failure(
            FailureKind::Service,
            Some("ExpiredTokenException"),
            "The security token included in the request is expired".into(),
            &other(),
        );
        assert_eq!(err.class(), ErrorClass::Authorization);
        assert_eq!(err.code(), "ExpiredTokenException");

        let err = classify_failure(
            FailureKind::Service,
            Some("ThrottlingException"),
            "Rate exceeded".into(),
            &other(),
        );
        assert!(err.is_transient());

        let err = classify_failure(
            FailureKind::Service,
            Some("InvalidParameterValueException"),
            "bad arn".into(),
            &other(),
        );
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_classify_without_code() {
        let err = classify_failure(FailureKind::Transport, None, "timed out".into(), &other());
        assert!(err.is_transient());
        assert_eq!(err.code(), "DispatchFailure");

        let err = classify_failure(FailureKind::Service, None, "garbled".into(), &other());
        assert_eq!(err.class(), ErrorClass::Fatal);

        let err = classify_failure(FailureKind::Construction, None, "bad input".into(), &other());
        assert_eq!(err.code(), "RequestConstruction");
    }

    #[test]
    fn test_permission_result() {
        let granted = permission_result("backup:ListBackupVaults", Ok(())).unwrap();
        assert!(granted.granted);

        let denied = permission_result(
            "backup:ListBackupVaults",
            Err(BackendError::from_code("AccessDeniedException", "not allowed")),
        )
        .unwrap();
        assert!(!denied.granted);
        assert!(denied.error.unwrap().contains("not allowed"));

        let missing = permission_result(
            "backup:DescribeBackupVault",
            Err(BackendError::from_code("ResourceNotFoundException", "no such vault")),
        )
        .unwrap();
        assert!(missing.granted);

        let throttled = permission_result(
            "backup:DescribeBackupVault",
            Err(BackendError::from_code("ThrottlingException", "Rate exceeded")),
        );
        assert!(throttled.unwrap_err().is_transient());

        let expired = permission_result(
            "backup:DescribeBackupVault",
            Err(BackendError::from_code("ExpiredToken", "expired")),
        );
        assert!(expired.unwrap_err().is_authorization());
    }

    #[test]
    fn test_backend_builds_runtime() {
        let backend = SdkBackend::new(SdkBackendConfig {
            profile: None,
            role_arn: "arn:aws:iam::123456789012:role/backup".into(),
        })
        .unwrap();
        assert_eq!(backend.block_on(async { 7 }), 7);
    }
}
