//! vault-mover - Resumable bulk copy of backup recovery points
//!
//! Starts one remote copy job per item, polls every job to a terminal state
//! with a bounded pool of worker threads, and persists the batch after every
//! transition so an interrupted run picks up where it stopped.
//!
//! # Features
//!
//! - **Bounded Worker Pool**: A fixed number of worker threads, each owning a
//!   static slice of the batch. No job is ever started twice in one run.
//!
//! - **Credential Coordination**: Expired credentials pause every worker
//!   behind one refresh lock; sessions are cleared once per expiry and the
//!   operator is asked to step in after repeated failures.
//!
//! - **Crash-Resumable State**: The batch is written atomically to a JSON
//!   state file. Started jobs keep their operation handle, so a resumed run
//!   polls them instead of starting them again.
//!
//! - **Cooperative Shutdown**: Ctrl+C stops new dispatches, lets in-flight
//!   backend calls finish and flushes state once before exiting.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Backup service (via AWS SDK)                  │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ start-copy-job / describe-copy-job
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    CredentialCoordinator                        │
//! │   session cache ── refresh lock ── transient backoff            │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//! ┌─────────────────────────────┴───────────────────────────────────┐
//! │                        Executor                                 │
//! │  ┌─────────┐  ┌─────────┐  ┌─────────┐         ┌─────────┐      │
//! │  │ mover-0 │  │ mover-1 │  │ mover-2 │  ...    │ mover-N │      │
//! │  └────┬────┘  └────┬────┘  └────┬────┘         └────┬────┘      │
//! │       └────────────┴─────┬──────┴────────────────────┘          │
//! │                          ▼  JobUpdate (crossbeam channel)       │
//! │               ┌──────────────────────┐                          │
//! │               │      supervisor      │                          │
//! │               │  single Batch writer │                          │
//! │               └──────────┬───────────┘                          │
//! └──────────────────────────┼──────────────────────────────────────┘
//!                            ▼
//!                 ┌──────────────────────┐
//!                 │      StateStore      │
//!                 │ temp file + rename   │
//!                 └──────────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Start a run with 8 workers
//! vault-mover copy --source prod --destination arn:aws:backup:...:backup-vault:dr \
//!     --manifest items.json --role-arn arn:aws:iam::123456789012:role/backup -w 8
//!
//! # Continue after an interruption
//! vault-mover copy --source prod --destination arn:aws:backup:...:backup-vault:dr --resume \
//!     --role-arn arn:aws:iam::123456789012:role/backup
//! ```

pub mod backend;
pub mod config;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod job;
pub mod preflight;
pub mod progress;
pub mod report;
pub mod shutdown;
pub mod state;

pub use backend::{Backend, RemoteStatus, SdkBackend, StubBackend};
pub use config::{CliArgs, CopyConfig};
pub use credentials::{CredentialCoordinator, CredentialPolicy, RetryPolicy};
pub use error::{MoverError, Result};
pub use executor::{Executor, ExecutorConfig, RunOutcome};
pub use job::{Batch, JobRecord, JobStatus};
pub use shutdown::ShutdownCoordinator;
pub use state::StateStore;
