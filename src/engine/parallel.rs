//! Parallel execution on a bounded worker pool.
//!
//! The unconstrained phase runs every instance concurrently, bounded only
//! by the pool. Each leveled round then dispatches its queues as
//! independent serial units; the round is a hard barrier — no queue of
//! round `k+1` starts before every queue of round `k` has finished.

use std::sync::Arc;

use tokio::sync::Semaphore as WorkerPool;
use tracing::{debug, info, instrument};

use super::{execute_instance, InstanceResult, ProcessRunner, RunOptions, RunReport, ShellRunner};
use crate::engine::EngineError;
use crate::scheduler::Schedule;

/// Runs a schedule on a worker pool, respecting round barriers
pub struct ParallelEngine {
    runner: Arc<dyn ProcessRunner>,
    options: RunOptions,
}

impl ParallelEngine {
    /// An engine over the given process runner
    pub fn new(runner: Arc<dyn ProcessRunner>, options: RunOptions) -> Self {
        Self { runner, options }
    }

    /// An engine running scripts through [`ShellRunner`]
    pub fn shell(options: RunOptions) -> Self {
        Self::new(Arc::new(ShellRunner::new()), options)
    }

    /// Execute the schedule, aggregating every instance result.
    ///
    /// Order between instances from different queues or rounds is not
    /// guaranteed; order within a queue is.
    #[instrument(skip(self, schedule), fields(instances = schedule.instance_count()))]
    pub async fn run(&self, schedule: Schedule) -> Result<RunReport, EngineError> {
        let workers = self.options.workers.max(1);
        let pool = Arc::new(WorkerPool::new(workers));
        let mut results: Vec<InstanceResult> = Vec::with_capacity(schedule.instance_count());

        // Unconstrained phase: every instance is its own unit of dispatch.
        if !schedule.unconstrained.is_empty() {
            debug!(
                count = schedule.unconstrained.len(),
                workers, "running unconstrained phase"
            );
            let mut handles = Vec::with_capacity(schedule.unconstrained.len());
            for instance in schedule.unconstrained {
                let pool = pool.clone();
                let runner = self.runner.clone();
                let options = self.options.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = pool.acquire_owned().await.expect("worker pool closed");
                    execute_instance(runner, options, instance).await
                }));
            }
            for joined in futures::future::join_all(handles).await {
                results.push(joined?);
            }
        }

        // Leveled rounds: one queue per unit of dispatch, barrier per round.
        for round in schedule.rounds {
            debug!(
                level = round.level,
                queues = round.queues.len(),
                "starting round"
            );
            let mut handles = Vec::with_capacity(round.queues.len());
            for queue in round.queues {
                let pool = pool.clone();
                let runner = self.runner.clone();
                let options = self.options.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = pool.acquire_owned().await.expect("worker pool closed");
                    let mut out = Vec::with_capacity(queue.instances.len());
                    for instance in queue.instances {
                        out.push(execute_instance(runner.clone(), options.clone(), instance).await);
                    }
                    out
                }));
            }
            // the barrier: every queue of this round joins before the next
            // round is released
            for joined in futures::future::join_all(handles).await {
                results.extend(joined?);
            }
            debug!(level = round.level, "round finished");
        }

        let report = RunReport { results };
        info!(
            total = report.total(),
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped(),
            "parallel run finished"
        );
        Ok(report)
    }
}
