//! Serial execution: one instance at a time, strictly in input order.

use std::sync::Arc;

use tracing::{info, instrument};

use super::{execute_instance, InstanceResult, ProcessRunner, RunOptions, RunReport, ShellRunner};
use crate::instance::CommandInstance;

/// Runs instances strictly one after another.
///
/// Serial execution never violates semaphore constraints, so it takes a
/// flat instance list rather than a schedule.
pub struct SerialEngine {
    runner: Arc<dyn ProcessRunner>,
    options: RunOptions,
}

impl SerialEngine {
    /// An engine over the given process runner
    pub fn new(runner: Arc<dyn ProcessRunner>, options: RunOptions) -> Self {
        Self { runner, options }
    }

    /// An engine running scripts through [`ShellRunner`]
    pub fn shell(options: RunOptions) -> Self {
        Self::new(Arc::new(ShellRunner::new()), options)
    }

    /// Execute every instance in order, collecting per-instance results
    #[instrument(skip(self, instances), fields(count = instances.len()))]
    pub async fn run_all(&self, instances: Vec<CommandInstance>) -> RunReport {
        let mut results: Vec<InstanceResult> = Vec::with_capacity(instances.len());
        for instance in instances {
            results.push(
                execute_instance(self.runner.clone(), self.options.clone(), instance).await,
            );
        }
        let report = RunReport { results };
        info!(
            total = report.total(),
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped(),
            "serial run finished"
        );
        report
    }
}
