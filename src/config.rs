//! Configuration types for vault-mover
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Runtime configuration with validation
//! - Manifest loading (the list of items to copy)

use crate::backend::SdkBackendConfig;
use crate::error::ConfigError;
use crate::executor::ExecutorConfig;
use crate::job::{Batch, JobRecord};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use uuid::Uuid;

/// Maximum reasonable worker count
const MAX_WORKERS: usize = 256;

/// Default state file location
pub const DEFAULT_STATE_FILE: &str = ".vault-mover-state.json";

/// Region a new batch runs in when `--region` is not given
pub const DEFAULT_REGION: &str = "us-east-1";

/// Regex for region names (us-east-1, us-gov-west-1, ...)
static REGION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z]{2}(-gov)?-[a-z]+-\d+$").expect("Invalid region regex")
});

/// Regex for IAM role ARNs
static ROLE_ARN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^arn:aws[a-z-]*:iam::\d{12}:role/[\w+=,.@/-]+$").expect("Invalid role ARN regex")
});

/// Bulk copy of backup recovery points between vaults
#[derive(Parser, Debug, Clone)]
#[command(
    name = "vault-mover",
    version,
    about = "Bulk copy of backup recovery points between vaults",
    long_about = "Starts one copy job per manifest entry, polls every job to completion with a \
                  bounded worker pool, and keeps a state file so an interrupted run can be resumed.",
    after_help = "EXAMPLES:\n    \
        vault-mover copy --source prod-vault --destination arn:aws:backup:us-west-2:123456789012:backup-vault:dr \\\n        \
            --manifest items.json --role-arn arn:aws:iam::123456789012:role/backup -w 8\n    \
        vault-mover copy --source prod-vault --destination dr --manifest items.json --dry-run\n    \
        vault-mover copy --source prod-vault --destination dr --resume --role-arn ...\n    \
        vault-mover status\n    \
        vault-mover reset"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Copy every manifest entry, or resume a previous run
    Copy(CopyArgs),

    /// Show job counts from the state file
    Status {
        /// State file to read
        #[arg(long, default_value = DEFAULT_STATE_FILE, value_name = "FILE")]
        state_file: PathBuf,
    },

    /// Delete the state file so the next run starts fresh
    Reset {
        /// State file to delete
        #[arg(long, default_value = DEFAULT_STATE_FILE, value_name = "FILE")]
        state_file: PathBuf,
    },
}

/// Arguments of the `copy` subcommand
#[derive(Args, Debug, Clone)]
pub struct CopyArgs {
    /// Source backup vault name
    #[arg(long, value_name = "VAULT")]
    pub source: String,

    /// Destination backup vault ARN
    #[arg(long, value_name = "VAULT_ARN")]
    pub destination: String,

    /// Batch identifier (generated if not set)
    #[arg(long, value_name = "ID")]
    pub batch_id: Option<String>,

    /// Region the copy jobs run in [default: us-east-1, or the saved region on --resume]
    #[arg(long)]
    pub region: Option<String>,

    /// JSON manifest of items to copy (required unless resuming)
    #[arg(short = 'm', long, value_name = "FILE")]
    pub manifest: Option<PathBuf>,

    /// Number of concurrent workers
    #[arg(short = 'w', long, default_value_t = 1, value_name = "NUM")]
    pub workers: usize,

    /// Seconds between status polls of one job
    #[arg(long, default_value_t = 30, value_name = "SECS")]
    pub poll_interval: u64,

    /// State file for resuming
    #[arg(long, default_value = DEFAULT_STATE_FILE, value_name = "FILE")]
    pub state_file: PathBuf,

    /// Continue from an existing state file
    #[arg(long)]
    pub resume: bool,

    /// Delete any existing state file and start over
    #[arg(long)]
    pub reset: bool,

    /// Mark every item skipped without starting copy jobs
    #[arg(long)]
    pub dry_run: bool,

    /// Stop starting new jobs after this many seconds
    #[arg(long, value_name = "SECS")]
    pub max_runtime: Option<u64>,

    /// Fail instead of prompting when credentials keep expiring
    #[arg(long)]
    pub non_interactive: bool,

    /// Skip the IAM permission check before starting copy jobs
    #[arg(long)]
    pub skip_validation: bool,

    /// Named credentials profile
    #[arg(long, env = "AWS_PROFILE")]
    pub profile: Option<String>,

    /// IAM role the backup service assumes for the copy
    #[arg(long, env = "VAULT_MOVER_ROLE_ARN", value_name = "ARN")]
    pub role_arn: Option<String>,

    /// Write a JSON summary report to this file
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,

    /// Run against the in-process stub backend (rehearsal)
    #[arg(long, hide = true)]
    pub stub_backend: bool,
}

/// Which backend the run talks to
#[derive(Debug, Clone)]
pub enum BackendChoice {
    /// Real backup service through the SDK
    Sdk(SdkBackendConfig),

    /// Deterministic in-process stub
    Stub,
}

/// Validated `copy` configuration
#[derive(Debug, Clone)]
pub struct CopyConfig {
    pub source: String,
    pub destination: String,
    pub batch_id: String,

    /// Region named on the command line, if any
    pub region: Option<String>,

    /// Manifest for a fresh run
    pub manifest: Option<PathBuf>,

    pub state_file: PathBuf,
    pub resume: bool,
    pub reset: bool,
    pub non_interactive: bool,

    /// Check permissions before the first copy job starts
    pub validate_permissions: bool,

    /// Executor settings
    pub executor: ExecutorConfig,

    pub backend: BackendChoice,

    /// Summary report output
    pub report_path: Option<PathBuf>,

    /// Show progress indicator
    pub show_progress: bool,
}

impl CopyConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: CopyArgs, quiet: bool) -> Result<Self, ConfigError> {
        if args.resume && args.reset {
            return Err(ConfigError::Conflict("resume", "reset"));
        }

        // Validate worker count
        if args.workers == 0 || args.workers > MAX_WORKERS {
            return Err(ConfigError::InvalidWorkerCount {
                count: args.workers,
                max: MAX_WORKERS,
            });
        }

        if args.poll_interval == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }

        if let Some(region) = &args.region {
            if !REGION_REGEX.is_match(region) {
                return Err(ConfigError::InvalidRegion(region.clone()));
            }
        }

        if args.manifest.is_none() && !args.resume {
            return Err(ConfigError::MissingRequired(
                "--manifest (or --resume to continue a previous run)".into(),
            ));
        }

        let backend = if args.stub_backend {
            BackendChoice::Stub
        } else {
            let role_arn = match args.role_arn {
                Some(arn) if ROLE_ARN_REGEX.is_match(&arn) => arn,
                Some(arn) => return Err(ConfigError::InvalidRoleArn(arn)),
                // A dry run never starts a job, so no role is needed
                None if args.dry_run => String::new(),
                None => return Err(ConfigError::MissingRequired("--role-arn".into())),
            };
            BackendChoice::Sdk(SdkBackendConfig {
                profile: args.profile,
                role_arn,
            })
        };

        let batch_id = args.batch_id.unwrap_or_else(generate_batch_id);

        Ok(Self {
            executor: ExecutorConfig {
                workers: args.workers,
                poll_interval: Duration::from_secs(args.poll_interval),
                dry_run: args.dry_run,
                max_runtime: args.max_runtime.map(Duration::from_secs),
                // Only an explicit flag overrides the batch region
                region: args.region.clone(),
            },
            source: args.source,
            destination: args.destination,
            batch_id,
            region: args.region,
            manifest: args.manifest,
            state_file: args.state_file,
            resume: args.resume,
            reset: args.reset,
            non_interactive: args.non_interactive,
            validate_permissions: !args.skip_validation && !args.dry_run,
            backend,
            report_path: args.report,
            show_progress: !quiet,
        })
    }

    /// Load the manifest and build a fresh batch from it
    pub fn batch_from_manifest(&self) -> crate::Result<Batch> {
        let path = self.manifest.as_deref().ok_or_else(|| {
            ConfigError::MissingRequired("--manifest to start a new run".into())
        })?;
        let entries = load_manifest(path)?;
        Ok(self.new_batch(entries))
    }

    /// Fresh batch holding one pending record per manifest entry
    pub fn new_batch(&self, entries: Vec<ManifestEntry>) -> Batch {
        let region = self.region.as_deref().unwrap_or(DEFAULT_REGION);
        let mut batch = Batch::new(
            self.batch_id.clone(),
            self.source.clone(),
            self.destination.clone(),
            region,
        );
        for entry in entries {
            let record = JobRecord::new(entry.source_id, entry.target);
            batch.add(match entry.size_bytes {
                Some(size) => record.with_size(size),
                None => record,
            });
        }
        batch
    }
}

/// `<date>-<random>` batch identifier
fn generate_batch_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%d"), &random[..8])
}

/// One item to copy
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestEntry {
    /// Recovery point identifier
    pub source_id: String,

    /// Where the copy should land
    pub target: String,

    #[serde(default)]
    pub size_bytes: Option<u64>,
}

/// Read a JSON manifest: an array of `{source_id, target, size_bytes?}`
pub fn load_manifest(path: &Path) -> Result<Vec<ManifestEntry>, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidManifest {
        path: path.to_path_buf(),
        reason,
    };

    let text = fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
    let entries: Vec<ManifestEntry> =
        serde_json::from_str(&text).map_err(|e| invalid(e.to_string()))?;

    let mut seen = HashSet::new();
    for (n, entry) in entries.iter().enumerate() {
        if entry.source_id.trim().is_empty() {
            return Err(invalid(format!("entry {} has an empty source_id", n)));
        }
        if !seen.insert(entry.source_id.as_str()) {
            return Err(invalid(format!("duplicate source_id '{}'", entry.source_id)));
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const ROLE: &str = "arn:aws:iam::123456789012:role/backup-copy";

    fn parse(args: &[&str]) -> CopyArgs {
        let mut argv = vec!["vault-mover", "copy"];
        argv.extend_from_slice(args);
        match CliArgs::parse_from(argv).command {
            Command::Copy(copy) => copy,
            other => panic!("unexpected command {:?}", other),
        }
    }

    fn base() -> Vec<&'static str> {
        vec![
            "--source", "prod", "--destination", "dr", "--manifest", "items.json",
            "--role-arn", ROLE,
        ]
    }

    #[test]
    fn test_defaults() {
        let config = CopyConfig::from_args(parse(&base()), false).unwrap();
        assert_eq!(config.executor.workers, 1);
        assert_eq!(config.executor.poll_interval, Duration::from_secs(30));
        assert_eq!(config.region, None);
        assert_eq!(config.executor.region, None);
        assert!(config.validate_permissions);
        assert_eq!(config.state_file, PathBuf::from(DEFAULT_STATE_FILE));
        assert!(config.show_progress);
        assert!(matches!(config.backend, BackendChoice::Sdk(ref c) if c.role_arn == ROLE));
        assert_eq!(config.batch_id.len(), 17);
    }

    #[test]
    fn test_worker_count_bounds() {
        let mut args = base();
        args.extend(["--workers", "0"]);
        assert!(matches!(
            CopyConfig::from_args(parse(&args), false),
            Err(ConfigError::InvalidWorkerCount { count: 0, .. })
        ));

        let mut args = base();
        args.extend(["-w", "257"]);
        assert!(CopyConfig::from_args(parse(&args), false).is_err());

        let mut args = base();
        args.extend(["-w", "256"]);
        assert!(CopyConfig::from_args(parse(&args), false).is_ok());
    }

    #[test]
    fn test_resume_reset_conflict() {
        let mut args = base();
        args.extend(["--resume", "--reset"]);
        assert!(matches!(
            CopyConfig::from_args(parse(&args), false),
            Err(ConfigError::Conflict("resume", "reset"))
        ));
    }

    #[test]
    fn test_manifest_required_unless_resuming() {
        let args = parse(&["--source", "s", "--destination", "d", "--role-arn", ROLE]);
        assert!(matches!(
            CopyConfig::from_args(args, false),
            Err(ConfigError::MissingRequired(_))
        ));

        let args = parse(&[
            "--source", "s", "--destination", "d", "--role-arn", ROLE, "--resume",
        ]);
        assert!(CopyConfig::from_args(args, false).is_ok());
    }

    #[test]
    fn test_role_arn_rules() {
        let args = parse(&["--source", "s", "--destination", "d", "-m", "x.json"]);
        assert!(matches!(
            CopyConfig::from_args(args, false),
            Err(ConfigError::MissingRequired(_))
        ));

        let args = parse(&[
            "--source", "s", "--destination", "d", "-m", "x.json", "--role-arn", "backup",
        ]);
        assert!(matches!(
            CopyConfig::from_args(args, false),
            Err(ConfigError::InvalidRoleArn(_))
        ));

        let args = parse(&["--source", "s", "--destination", "d", "-m", "x.json", "--dry-run"]);
        assert!(CopyConfig::from_args(args, false).is_ok());

        let args = parse(&[
            "--source", "s", "--destination", "d", "-m", "x.json", "--stub-backend",
        ]);
        assert!(matches!(
            CopyConfig::from_args(args, true).unwrap().backend,
            BackendChoice::Stub
        ));
    }

    #[test]
    fn test_invalid_region_and_poll_interval() {
        let mut args = base();
        args.extend(["--region", "mars"]);
        assert!(matches!(
            CopyConfig::from_args(parse(&args), false),
            Err(ConfigError::InvalidRegion(_))
        ));

        let mut args = base();
        args.extend(["--poll-interval", "0"]);
        assert!(matches!(
            CopyConfig::from_args(parse(&args), false),
            Err(ConfigError::InvalidPollInterval)
        ));
    }

    #[test]
    fn test_status_and_reset_subcommands() {
        let args = CliArgs::parse_from(["vault-mover", "-q", "status", "--state-file", "s.json"]);
        assert!(args.quiet);
        assert!(matches!(args.command, Command::Status { ref state_file } if state_file == Path::new("s.json")));

        let args = CliArgs::parse_from(["vault-mover", "reset"]);
        assert!(matches!(args.command, Command::Reset { .. }));
    }

    #[test]
    fn test_load_manifest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("items.json");
        fs::write(
            &path,
            r#"[{"source_id": "rp-1", "target": "dr", "size_bytes": 2048},
                {"source_id": "rp-2", "target": "dr"}]"#,
        )
        .unwrap();

        let entries = load_manifest(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].size_bytes, Some(2048));

        let config = CopyConfig::from_args(parse(&base()), false).unwrap();
        let batch = config.new_batch(entries);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.source, "prod");
        assert_eq!(batch.region, DEFAULT_REGION);
        assert_eq!(batch.records()[0].size_bytes, Some(2048));
    }

    #[test]
    fn test_explicit_region_applies_to_new_batch_and_executor() {
        let mut args = base();
        args.extend(["--region", "eu-west-1"]);
        let config = CopyConfig::from_args(parse(&args), false).unwrap();
        assert_eq!(config.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.executor.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.new_batch(Vec::new()).region, "eu-west-1");
    }

    #[test]
    fn test_resume_without_region_keeps_batch_region() {
        let args = parse(&[
            "--source", "s", "--destination", "d", "--role-arn", ROLE, "--resume",
        ]);
        let config = CopyConfig::from_args(args, false).unwrap();
        assert_eq!(config.region, None);
        assert_eq!(config.executor.region, None);
    }

    #[test]
    fn test_skip_validation_and_dry_run_disable_permission_check() {
        let mut args = base();
        args.push("--skip-validation");
        assert!(!CopyConfig::from_args(parse(&args), false).unwrap().validate_permissions);

        let mut args = base();
        args.push("--dry-run");
        assert!(!CopyConfig::from_args(parse(&args), false).unwrap().validate_permissions);
    }

    #[test]
    fn test_batch_from_manifest_errors_are_config_errors() {
        let args = parse(&[
            "--source", "s", "--destination", "d", "--role-arn", ROLE, "--resume",
        ]);
        let config = CopyConfig::from_args(args, false).unwrap();
        assert!(matches!(
            config.batch_from_manifest(),
            Err(crate::MoverError::Config(ConfigError::MissingRequired(_)))
        ));

        let args = parse(&[
            "--source", "s", "--destination", "d", "--role-arn", ROLE, "-m",
            "/nonexistent/items.json",
        ]);
        let config = CopyConfig::from_args(args, false).unwrap();
        assert!(matches!(
            config.batch_from_manifest(),
            Err(crate::MoverError::Config(ConfigError::InvalidManifest { .. }))
        ));
    }

    #[test]
    fn test_manifest_rejects_duplicates_and_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("items.json");

        fs::write(
            &path,
            r#"[{"source_id": "rp-1", "target": "dr"}, {"source_id": "rp-1", "target": "dr"}]"#,
        )
        .unwrap();
        assert!(matches!(
            load_manifest(&path),
            Err(ConfigError::InvalidManifest { .. })
        ));

        fs::write(&path, "not json").unwrap();
        assert!(load_manifest(&path).is_err());
        assert!(load_manifest(&dir.path().join("missing.json")).is_err());
    }
}
