//! Execution engines.
//!
//! This module provides the runtime that executes scheduled command
//! instances: a [`SerialEngine`] that runs a flat list strictly in order,
//! and a [`ParallelEngine`] that runs a
//! [`Schedule`](crate::scheduler::Schedule) on a bounded worker pool,
//! treating rounds as hard barriers. Both record per-instance timing and
//! apply the temporary-file retention policy.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::instance::CommandInstance;

pub mod parallel;
pub mod runner;
pub mod serial;

pub use parallel::ParallelEngine;
pub use runner::{ProcessOutput, ProcessRunner, ShellRunner};
pub use serial::SerialEngine;

/// Errors raised by the execution engines outside any single instance
#[derive(Error, Debug)]
pub enum EngineError {
    /// I/O failure while staging or launching a script
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A worker task panicked or was cancelled
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Lifecycle state of one command instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Not yet dispatched
    Pending,
    /// Currently executing
    Running,
    /// Process reported success
    Succeeded,
    /// Process reported failure or could not be launched
    Failed,
    /// Dry run: scheduling happened, execution was skipped
    Skipped,
}

/// Temporary-file retention policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeepTemps {
    /// Keep temp files only when the instance failed
    #[default]
    Fail,
    /// Always delete temp files
    Never,
    /// Never delete temp files
    Always,
}

impl FromStr for KeepTemps {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail" => Ok(Self::Fail),
            "never" => Ok(Self::Never),
            "always" => Ok(Self::Always),
            other => Err(format!(
                "invalid keep-temps policy '{other}', must be one of fail, never, always"
            )),
        }
    }
}

impl std::fmt::Display for KeepTemps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Fail => "fail",
            Self::Never => "never",
            Self::Always => "always",
        };
        write!(f, "{name}")
    }
}

/// Wall-clock timing of one executed instance
#[derive(Debug, Clone)]
pub struct TimeRecord {
    /// When execution started
    pub started_at: DateTime<Utc>,
    /// When execution finished
    pub finished_at: DateTime<Utc>,
    /// Elapsed monotonic duration
    pub duration: Duration,
}

/// The recorded outcome of one instance
#[derive(Debug)]
pub struct InstanceResult {
    /// Instance name
    pub name: String,
    /// The rendered script that was (or would have been) executed
    pub script: String,
    /// Terminal status
    pub status: RunStatus,
    /// Captured stdout
    pub output: Vec<u8>,
    /// Captured stderr, or the launch error text
    pub errors: Vec<u8>,
    /// Timing; `None` for skipped instances
    pub timing: Option<TimeRecord>,
}

/// Engine configuration shared by both engines
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Skip execution, marking every instance [`RunStatus::Skipped`]
    pub dry_run: bool,
    /// Temporary-file retention policy
    pub keep_temps: KeepTemps,
    /// Suppress captured output of successful instances
    pub quiet: bool,
    /// Worker pool size for the parallel engine
    pub workers: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            keep_temps: KeepTemps::default(),
            quiet: false,
            workers: num_cpus::get(),
        }
    }
}

impl RunOptions {
    /// Enable or disable dry-run mode
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set the retention policy
    pub fn with_keep_temps(mut self, keep_temps: KeepTemps) -> Self {
        self.keep_temps = keep_temps;
        self
    }

    /// Suppress output of successful instances
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Set the worker pool size
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

/// Aggregated results of one run
#[derive(Debug, Default)]
pub struct RunReport {
    /// Per-instance results; order within a queue is preserved
    pub results: Vec<InstanceResult>,
}

impl RunReport {
    /// Number of instances in the report
    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// Number of instances that succeeded
    pub fn succeeded(&self) -> usize {
        self.count(RunStatus::Succeeded)
    }

    /// Number of instances that failed
    pub fn failed(&self) -> usize {
        self.count(RunStatus::Failed)
    }

    /// Number of instances skipped by dry run
    pub fn skipped(&self) -> usize {
        self.count(RunStatus::Skipped)
    }

    /// True if no executed instance failed
    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }

    fn count(&self, status: RunStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

/// Run one instance to completion and apply the retention policy.
///
/// Shared by both engines; never fails — launch errors are recorded as a
/// [`RunStatus::Failed`] result so sibling instances keep running.
pub(crate) async fn execute_instance(
    runner: Arc<dyn ProcessRunner>,
    options: RunOptions,
    instance: CommandInstance,
) -> InstanceResult {
    info!(instance = %instance.name, cwd = ?instance.cwd, "**** {}", instance.name);
    for line in instance.script.lines() {
        info!("    {line}");
    }

    if options.dry_run {
        cleanup_temps(&instance, options.keep_temps, false);
        return InstanceResult {
            name: instance.name,
            script: instance.script,
            status: RunStatus::Skipped,
            output: Vec::new(),
            errors: Vec::new(),
            timing: None,
        };
    }

    let started_at = Utc::now();
    let start = Instant::now();
    debug!(instance = %instance.name, started_at = %started_at, "running");

    let outcome = runner.run(&instance.script, instance.cwd.as_deref()).await;

    let finished_at = Utc::now();
    let duration = start.elapsed();

    let (status, output, errors) = match outcome {
        Ok(out) => {
            let status = if out.success {
                RunStatus::Succeeded
            } else {
                RunStatus::Failed
            };
            (status, out.output, out.errors)
        }
        Err(err) => {
            error!(instance = %instance.name, error = %err, "failed to launch");
            (RunStatus::Failed, Vec::new(), err.to_string().into_bytes())
        }
    };

    match status {
        RunStatus::Succeeded => {
            info!(
                instance = %instance.name,
                duration_ms = duration.as_millis(),
                "SUCCEEDED"
            );
            if !options.quiet {
                log_streams(&instance.name, &output, &errors, false);
            }
        }
        _ => {
            error!(
                instance = %instance.name,
                duration_ms = duration.as_millis(),
                "FAILED"
            );
            log_streams(&instance.name, &output, &errors, true);
        }
    }

    cleanup_temps(&instance, options.keep_temps, status == RunStatus::Failed);

    InstanceResult {
        name: instance.name,
        script: instance.script,
        status,
        output,
        errors,
        timing: Some(TimeRecord {
            started_at,
            finished_at,
            duration,
        }),
    }
}

fn log_streams(name: &str, output: &[u8], errors: &[u8], failed: bool) {
    let stdout = String::from_utf8_lossy(output);
    let stderr = String::from_utf8_lossy(errors);
    if failed {
        if !stdout.is_empty() {
            error!(instance = %name, "stdout:\n{stdout}");
        }
        if !stderr.is_empty() {
            error!(instance = %name, "stderr:\n{stderr}");
        }
    } else {
        if !stdout.is_empty() {
            info!(instance = %name, "stdout:\n{stdout}");
        }
        if !stderr.is_empty() {
            info!(instance = %name, "stderr:\n{stderr}");
        }
    }
}

/// Apply the retention policy to an instance's temporary files
pub(crate) fn cleanup_temps(instance: &CommandInstance, policy: KeepTemps, failed: bool) {
    let delete = match policy {
        KeepTemps::Always => false,
        KeepTemps::Never => true,
        KeepTemps::Fail => !failed,
    };
    if !delete {
        return;
    }
    for (attr, path) in &instance.assignment.temp_files {
        if path.exists() {
            match std::fs::remove_file(path) {
                Ok(()) => info!(instance = %instance.name, attr, path = %path.display(), "deleting temporary file"),
                Err(err) => warn!(instance = %instance.name, path = %path.display(), error = %err, "could not delete temporary file"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_temps_parses_policy_names() {
        assert_eq!(KeepTemps::from_str("fail").unwrap(), KeepTemps::Fail);
        assert_eq!(KeepTemps::from_str("never").unwrap(), KeepTemps::Never);
        assert_eq!(KeepTemps::from_str("always").unwrap(), KeepTemps::Always);
        assert!(KeepTemps::from_str("sometimes").is_err());
    }

    #[test]
    fn report_counts_by_status() {
        let result = |status| InstanceResult {
            name: "t#0".to_string(),
            script: "true".to_string(),
            status,
            output: Vec::new(),
            errors: Vec::new(),
            timing: None,
        };
        let report = RunReport {
            results: vec![
                result(RunStatus::Succeeded),
                result(RunStatus::Failed),
                result(RunStatus::Succeeded),
                result(RunStatus::Skipped),
            ],
        };
        assert_eq!(report.total(), 4);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 1);
        assert!(!report.all_succeeded());
    }
}
