//! vault-mover - Resumable bulk copy of backup recovery points
//!
//! Entry point for the CLI application.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vault_mover::backend::{Backend, SdkBackend, StubBackend};
use vault_mover::config::{BackendChoice, CliArgs, Command, CopyConfig};
use vault_mover::credentials::{CredentialCoordinator, NonInteractive, StdinPrompt};
use vault_mover::error::MoverError;
use vault_mover::executor::Executor;
use vault_mover::job::Batch;
use vault_mover::preflight::validate_permissions;
use vault_mover::progress::{print_header, print_status, print_summary, ProgressReporter};
use vault_mover::report::SummaryReport;
use vault_mover::shutdown::{FlushOutcome, ShutdownCoordinator, INTERRUPTED_EXIT_CODE};
use vault_mover::state::StateStore;

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    match args.command {
        Command::Copy(copy) => {
            let config =
                CopyConfig::from_args(copy, args.quiet).context("Invalid configuration")?;
            run_copy(config)
        }
        Command::Status { state_file } => run_status(&state_file),
        Command::Reset { state_file } => run_reset(&state_file),
    }
}

/// Load or create the batch, then run it against the configured backend
fn run_copy(config: CopyConfig) -> Result<ExitCode> {
    let store = StateStore::new(&config.state_file);

    if config.reset && store.delete().context("Failed to delete state file")? {
        info!(path = %store.path().display(), "Previous state discarded");
    }

    let mut batch = load_or_create(&config, &store)?;

    if config.show_progress {
        print_header(
            &batch,
            config.executor.workers,
            store.path(),
            config.executor.dry_run,
        );
    }

    // Setup signal handler for graceful shutdown
    let shutdown = ShutdownCoordinator::new();
    shutdown
        .install()
        .context("Failed to set signal handler")?;

    match &config.backend {
        BackendChoice::Sdk(backend) => {
            let backend =
                SdkBackend::new(backend.clone()).context("Failed to start the SDK runtime")?;
            execute(&config, &store, &shutdown, &mut batch, backend)
        }
        BackendChoice::Stub => {
            warn!("Using the in-process stub backend, no copy jobs reach the backup service");
            execute(&config, &store, &shutdown, &mut batch, StubBackend::new())
        }
    }
}

/// Resume persisted state or build a fresh batch from the manifest
fn load_or_create(config: &CopyConfig, store: &StateStore) -> Result<Batch> {
    if config.resume {
        match store.load_for(&config.source, &config.destination, config.region.as_deref()) {
            Ok(Some(batch)) => {
                info!(
                    batch_id = %batch.batch_id,
                    jobs = batch.len(),
                    resumable = batch.resumable_indices().len(),
                    "Resuming previous run"
                );
                return Ok(batch);
            }
            Ok(None) if config.manifest.is_some() => {
                warn!(path = %store.path().display(), "No state file to resume, starting fresh");
            }
            Ok(None) => bail!(
                "No state file at '{}' to resume; pass --manifest to start a new run",
                store.path().display()
            ),
            Err(e) if e.is_corruption() => {
                return Err(e).with_context(|| {
                    format!(
                        "State file '{}' cannot be used; pass --reset to discard it",
                        store.path().display()
                    )
                });
            }
            Err(e) => return Err(e).context("Failed to load state"),
        }
    } else if store.exists() {
        bail!(
            "State file '{}' already exists; pass --resume to continue that run or --reset to start over",
            store.path().display()
        );
    }

    let batch = config
        .batch_from_manifest()
        .context("Failed to load manifest")?;
    info!(batch_id = %batch.batch_id, jobs = batch.len(), "Created new batch");
    Ok(batch)
}

fn execute<B: Backend>(
    config: &CopyConfig,
    store: &StateStore,
    shutdown: &ShutdownCoordinator,
    batch: &mut Batch,
    backend: B,
) -> Result<ExitCode> {
    let mut coordinator = CredentialCoordinator::new(backend);
    if config.non_interactive {
        coordinator = coordinator.with_prompt(NonInteractive);
    } else {
        coordinator = coordinator.with_prompt(StdinPrompt::new().with_cancel(shutdown.checker()));
    }

    if config.validate_permissions {
        check_permissions(&coordinator, batch)?;
    }

    let reporter = if config.show_progress {
        ProgressReporter::new(batch.len())
    } else {
        ProgressReporter::hidden(batch.len())
    };
    reporter.set_status(&format!(
        "Dispatching {} jobs with {} workers",
        batch.resumable_indices().len(),
        config.executor.workers
    ));
    let cancel = shutdown.checker();
    let dry_run = config.executor.dry_run;

    let mut executor = Executor::new(config.executor.clone(), &coordinator)
        .with_progress(&reporter)
        .with_cancel(&cancel);
    // Dry runs leave the state file alone
    if !dry_run {
        executor = executor.with_state_store(store);
    }

    let outcome = match executor.run(batch) {
        Ok(outcome) => outcome,
        Err(e) => {
            reporter.finish_and_clear();
            if !dry_run {
                flush_state(shutdown, store, batch);
            }
            return Err(e).context("Copy run aborted; resume with --resume once the cause is fixed");
        }
    };

    if outcome.completed {
        reporter.finish("Run completed");
    } else {
        reporter.finish("Run stopped");
    }

    let report = SummaryReport::from_batch(batch, outcome.duration, outcome.finished);
    print_summary(&report, store.path());

    if let Some(path) = &config.report_path {
        report
            .write_to(path)
            .with_context(|| format!("Failed to write report to '{}'", path.display()))?;
        info!(path = %path.display(), "Summary report written");
    }

    if outcome.interrupted {
        if !dry_run {
            flush_state(shutdown, store, batch);
        }
        eprintln!("{}; continue later with --resume", MoverError::Interrupted);
        return Ok(ExitCode::from(INTERRUPTED_EXIT_CODE as u8));
    }

    if outcome.budget_exhausted && !outcome.completed {
        info!(
            remaining = report.pending + report.in_progress,
            "Runtime budget reached; continue later with --resume"
        );
    }

    if report.failed > 0 {
        warn!(failed = report.failed, "Some copy jobs failed");
        return Ok(ExitCode::FAILURE);
    }

    Ok(ExitCode::SUCCESS)
}

/// Refuse to start copy jobs the caller has no permission to run
fn check_permissions<B: Backend>(
    coordinator: &CredentialCoordinator<B>,
    batch: &Batch,
) -> Result<()> {
    let report = validate_permissions(coordinator, &batch.region, &batch.source)
        .context("Permission validation could not complete")?;

    if !report.all_granted() {
        eprintln!("Missing required IAM permissions:");
        for check in report.denied() {
            eprintln!("  ✗ {}", check.permission);
            if let Some(error) = &check.error {
                eprintln!("    {}", error);
            }
        }
        bail!("Permission validation failed; pass --skip-validation to bypass");
    }

    info!(region = %report.region, "All required permissions validated");
    Ok(())
}

/// Best-effort final save on the way out
fn flush_state(shutdown: &ShutdownCoordinator, store: &StateStore, batch: &Batch) {
    match shutdown.flush_once(|| store.save(batch)) {
        FlushOutcome::Flushed => {
            info!(path = %store.path().display(), "State saved for resume");
        }
        FlushOutcome::Failed(reason) => {
            eprintln!(
                "Warning: could not save state ({}); the last saved state in '{}' is unchanged",
                reason,
                store.path().display()
            );
        }
        FlushOutcome::AlreadyFlushed => {}
    }
}

fn run_status(state_file: &Path) -> Result<ExitCode> {
    let store = StateStore::new(state_file);
    match store.load().context("Failed to read state file")? {
        Some(batch) => print_status(&batch, store.path()),
        None => println!("No state file at '{}'", store.path().display()),
    }
    Ok(ExitCode::SUCCESS)
}

fn run_reset(state_file: &Path) -> Result<ExitCode> {
    let store = StateStore::new(state_file);
    if store.delete().context("Failed to delete state file")? {
        println!("Deleted '{}'", store.path().display());
    } else {
        println!("No state file at '{}'", store.path().display());
    }
    Ok(ExitCode::SUCCESS)
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("vault_mover=debug,warn")
    } else {
        EnvFilter::new("vault_mover=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
