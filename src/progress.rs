//! Progress reporting for copy runs
//!
//! [`ProgressTracker`] keeps a rolling window of snapshots and derives
//! throughput and ETA from it. [`ProgressReporter`] feeds the tracker from
//! the executor and renders it with an indicatif spinner.

use crate::executor::ProgressSink;
use crate::job::{Batch, JobStatus};
use crate::report::SummaryReport;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Snapshots kept for throughput estimation
pub const DEFAULT_WINDOW_SIZE: usize = 10;

/// Minimum time between two rendered progress lines
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Point-in-time progress counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub at: Instant,
    pub completed: usize,
    pub total: usize,
    pub errors: usize,
}

#[derive(Debug)]
struct TrackerState {
    window: VecDeque<ProgressSnapshot>,
    completed: usize,
    errors: usize,
    last_refresh: Option<Instant>,
}

/// Throughput and ETA estimation over a rolling window
#[derive(Debug)]
pub struct ProgressTracker {
    total: usize,
    window_size: usize,
    refresh_interval: Duration,
    started: Instant,
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self::with_settings(total, DEFAULT_WINDOW_SIZE, DEFAULT_REFRESH_INTERVAL)
    }

    pub fn with_settings(total: usize, window_size: usize, refresh_interval: Duration) -> Self {
        Self::starting_at(total, window_size, refresh_interval, Instant::now())
    }

    /// Tracker whose clock starts at `now`
    pub fn starting_at(
        total: usize,
        window_size: usize,
        refresh_interval: Duration,
        now: Instant,
    ) -> Self {
        Self {
            total,
            window_size: window_size.max(2),
            refresh_interval,
            started: now,
            state: Mutex::new(TrackerState {
                window: VecDeque::with_capacity(window_size.max(2)),
                completed: 0,
                errors: 0,
                last_refresh: None,
            }),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn update(&self, completed: usize, errors: usize) {
        self.update_at(completed, errors, Instant::now());
    }

    /// Record counters observed at `at`
    ///
    /// Workers report concurrently, so a count lower than one already
    /// recorded is stale and dropped.
    pub fn update_at(&self, completed: usize, errors: usize, at: Instant) {
        let mut state = self.state.lock();
        if completed < state.completed {
            return;
        }
        state.completed = completed;
        state.errors = errors;
        state.window.push_back(ProgressSnapshot {
            at,
            completed,
            total: self.total,
            errors,
        });
        while state.window.len() > self.window_size {
            state.window.pop_front();
        }
    }

    /// Completed items per hour, if the window spans at least one second
    pub fn throughput(&self) -> Option<f64> {
        let state = self.state.lock();
        let (oldest, newest) = (state.window.front()?, state.window.back()?);
        let elapsed = newest.at.checked_duration_since(oldest.at)?.as_secs_f64();
        if elapsed < 1.0 {
            return None;
        }
        let done = newest.completed.saturating_sub(oldest.completed) as f64;
        Some(done / elapsed * 3600.0)
    }

    /// Estimated time to finish; undefined without a positive throughput
    pub fn eta(&self) -> Option<Duration> {
        let per_hour = self.throughput().filter(|rate| *rate > 0.0)?;
        let remaining = self.total.saturating_sub(self.state.lock().completed) as f64;
        Some(Duration::from_secs_f64(remaining * 3600.0 / per_hour))
    }

    /// Progress line if the refresh interval has passed since the last one
    pub fn maybe_refresh(&self) -> Option<String> {
        self.refresh_at(false, Instant::now())
    }

    /// Progress line, ignoring the rate limit when `force` is set
    pub fn refresh(&self, force: bool) -> Option<String> {
        self.refresh_at(force, Instant::now())
    }

    pub fn refresh_at(&self, force: bool, now: Instant) -> Option<String> {
        {
            let mut state = self.state.lock();
            let due = match state.last_refresh {
                Some(last) => now.saturating_duration_since(last) >= self.refresh_interval,
                None => true,
            };
            if !force && !due {
                return None;
            }
            state.last_refresh = Some(now);
        }
        Some(self.format_line_at(now))
    }

    pub fn format_line(&self) -> String {
        self.format_line_at(Instant::now())
    }

    /// `Progress: c/t (p%) | Rate: r/hour | ETA: e | Elapsed: d | errors: n`
    pub fn format_line_at(&self, now: Instant) -> String {
        let (completed, errors) = {
            let state = self.state.lock();
            (state.completed, state.errors)
        };
        let percent = if self.total > 0 {
            completed as f64 / self.total as f64 * 100.0
        } else {
            0.0
        };
        let rate = match self.throughput() {
            Some(rate) => format!("{:.1}/hour", rate),
            None => "calculating...".to_string(),
        };
        let eta = match self.eta() {
            Some(eta) => format_duration(eta),
            None => "unknown".to_string(),
        };
        let elapsed = format_duration(now.saturating_duration_since(self.started));

        format!(
            "Progress: {}/{} ({:.1}%) | Rate: {} | ETA: {} | Elapsed: {} | errors: {}",
            completed, self.total, percent, rate, eta, elapsed, errors
        )
    }
}

/// Human duration: `45s`, `3m 12s`, `2h 5m`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Progress reporter that renders run status
pub struct ProgressReporter {
    /// Spinner
    bar: ProgressBar,

    /// Rate and ETA estimation
    tracker: ProgressTracker,

    /// Failed jobs seen so far in this run
    errors: AtomicUsize,
}

impl ProgressReporter {
    /// Create a new progress reporter for `total` jobs
    pub fn new(total: usize) -> Self {
        let bar = ProgressBar::new_spinner();

        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .expect("Invalid progress template")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );

        bar.enable_steady_tick(Duration::from_millis(100));

        Self::with_bar(bar, total)
    }

    /// Reporter that draws nothing (quiet mode)
    pub fn hidden(total: usize) -> Self {
        Self::with_bar(ProgressBar::hidden(), total)
    }

    fn with_bar(bar: ProgressBar, total: usize) -> Self {
        let tracker = ProgressTracker::new(total);
        bar.set_message(tracker.format_line());
        Self {
            bar,
            tracker,
            errors: AtomicUsize::new(0),
        }
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    /// Set a status message
    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    /// Finish the progress display with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    /// Finish and clear the progress display
    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressSink for ProgressReporter {
    fn report(&self, _message: &str, completed: usize, total: usize) {
        self.tracker
            .update(completed, self.errors.load(Ordering::SeqCst));
        // The last job always renders, whatever the refresh interval says
        let line = if completed >= total {
            self.tracker.refresh(true)
        } else {
            self.tracker.maybe_refresh()
        };
        if let Some(line) = line {
            self.bar.set_message(line);
        }
    }

    fn job_failed(&self, source_id: &str, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {}: {}",
            style("failed").red().bold(),
            source_id,
            error
        ));
    }
}

/// Format a number with thousands separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| {
            chunk
                .iter()
                .rev()
                .map(|&b| b as char)
                .collect::<String>()
        })
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Print a header at the start of a run
pub fn print_header(batch: &Batch, workers: usize, state_path: &Path, dry_run: bool) {
    println!();
    println!(
        "{} {}",
        style("vault-mover").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Batch:").bold(), batch.batch_id);
    println!("  {} {}", style("Route:").bold(), batch.route());
    println!("  {} {}", style("Region:").bold(), batch.region);
    println!("  {} {}", style("Jobs:").bold(), format_number(batch.len() as u64));
    println!("  {} {}", style("Workers:").bold(), workers);
    println!("  {} {}", style("State:").bold(), state_path.display());
    if dry_run {
        println!("  {}", style("Dry run: no copy jobs will be started").yellow());
    }
    println!();
}

/// Print a summary of the run
pub fn print_summary(report: &SummaryReport, state_path: &Path) {
    let title = if report.is_success() {
        style("Copy Complete").green().bold()
    } else {
        style("Copy Finished With Open Jobs").yellow().bold()
    };

    println!();
    println!("{}", title);
    println!("{}", style("─".repeat(50)).dim());
    println!(
        "  {} {}",
        style("Completed:").bold(),
        format_number(report.completed as u64)
    );
    if report.skipped > 0 {
        println!(
            "  {} {}",
            style("Skipped:").bold(),
            format_number(report.skipped as u64)
        );
    }
    let open = report.pending + report.in_progress;
    if open > 0 {
        println!(
            "  {} {} ({} in progress)",
            style("Remaining:").yellow().bold(),
            format_number(open as u64),
            format_number(report.in_progress as u64)
        );
    }
    println!("  {} {:.2}%", style("Success rate:").bold(), report.success_rate);
    println!("  {} {}", style("Copied:").bold(), report.bytes_copied_human);
    match report.throughput_per_hour {
        Some(rate) => println!(
            "  {} {} ({:.1} jobs/hour)",
            style("Duration:").bold(),
            report.duration,
            rate
        ),
        None => println!("  {} {}", style("Duration:").bold(), report.duration),
    }
    if report.failed > 0 {
        println!(
            "  {} {}",
            style("Failed:").red().bold(),
            format_number(report.failed as u64)
        );
        for failure in &report.failures {
            println!("    {} {}", style(&failure.source_id).dim(), failure.error);
        }
    }
    println!("  {} {}", style("State:").bold(), state_path.display());
    println!();
}

/// Print job counts of a persisted batch
pub fn print_status(batch: &Batch, state_path: &Path) {
    println!();
    println!("{} {}", style("Batch").cyan().bold(), batch.batch_id);
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Route:").bold(), batch.route());
    println!("  {} {}", style("State:").bold(), state_path.display());
    for status in [
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Skipped,
    ] {
        println!(
            "  {:<12} {}",
            style(format!("{}:", status)).bold(),
            format_number(batch.count_by_status(status) as u64)
        );
    }
    println!("  {} {:.2}%", style("Success rate:").bold(), batch.success_rate());
    if let Some(started) = batch.started_at() {
        println!("  {} {}", style("Started:").bold(), started.to_rfc3339());
    }
    match batch.completed_at() {
        Some(done) => println!("  {} {}", style("Completed:").bold(), done.to_rfc3339()),
        None => println!("  {}", style("Not complete; continue with `copy --resume`").yellow()),
    }
    println!();
}
