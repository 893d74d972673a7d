//! Worker pool executing step tasks
//!
//! Workers pull [`StepTask`]s from the shared receiver, run the registered
//! handler and report the outcome back to the [`Sequencer`]. Retryable
//! failures are re-run here, with a fixed delay, up to the policy's ceiling;
//! the sequencer only ever hears about the final outcome of a task.

use crate::config::QueueConfig;
use crate::error::{PipelineError, StepError, StepResult};
use crate::progress::ProgressSink;
use crate::steps::{StepContext, StepRegistry};
use crate::workflow::queue::TaskReceiver;
use crate::workflow::sequencer::{AdvanceOutcome, Sequencer};
use crate::workflow::types::StepTask;
use async_trait::async_trait;
use runstage_common::types::ProgressRecord;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_SECS: u64 = 5;

/// Fixed-delay retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
        }
    }
}

impl From<&QueueConfig> for RetryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: Duration::from_secs(config.retry_delay_secs),
        }
    }
}

/// Forwards a step's progress to its workflow record
pub struct WorkflowProgress {
    sequencer: Arc<Sequencer>,
    workflow_id: Uuid,
    step_index: usize,
}

#[async_trait]
impl ProgressSink for WorkflowProgress {
    async fn report(&self, record: ProgressRecord) -> anyhow::Result<()> {
        debug!(
            workflow_id = %self.workflow_id,
            name = %record.name,
            done = record.done,
            total = ?record.total,
            "Step progress"
        );
        self.sequencer
            .record_progress(self.workflow_id, self.step_index, record)
            .await?;
        Ok(())
    }
}

pub struct WorkerPool {
    sequencer: Arc<Sequencer>,
    registry: Arc<StepRegistry>,
    policy: RetryPolicy,
    workers: usize,
}

impl WorkerPool {
    pub fn new(
        sequencer: Arc<Sequencer>,
        registry: Arc<StepRegistry>,
        policy: RetryPolicy,
        workers: usize,
    ) -> Self {
        Self {
            sequencer,
            registry,
            policy,
            workers: workers.max(1),
        }
    }

    /// Start the workers
    ///
    /// A worker finishes the task it is running before it observes
    /// `shutdown`.
    pub fn spawn(self: Arc<Self>, receiver: TaskReceiver, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|worker| {
                let pool = self.clone();
                let receiver = receiver.clone();
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    info!(worker, "Worker started");
                    loop {
                        let task = tokio::select! {
                            _ = shutdown.cancelled() => break,
                            task = receiver.recv() => task,
                        };
                        match task {
                            Some(task) => pool.process(task).await,
                            None => break,
                        }
                    }
                    info!(worker, "Worker stopped");
                })
            })
            .collect()
    }

    /// Run one task to its final outcome and report it to the sequencer
    pub async fn process(&self, task: StepTask) {
        let span = tracing::info_span!(
            "step",
            workflow_id = %task.workflow_id,
            step = %task.step,
            step_index = task.step_index,
            id = %task.correlation_id,
        );

        async {
            match self.run_with_retries(&task).await {
                Ok(output) => {
                    match self
                        .sequencer
                        .advance(task.workflow_id, task.step_index, output)
                        .await
                    {
                        Ok(AdvanceOutcome::Dispatched(next)) => info!(%next, "Step succeeded"),
                        Ok(outcome) => info!(?outcome, "Step succeeded"),
                        Err(e) => error!(error = %e, "Could not advance workflow"),
                    }
                },
                Err(err) => {
                    let err = err.into_inner();
                    if let Err(e) = self
                        .sequencer
                        .fail(task.workflow_id, task.step_index, &err)
                        .await
                    {
                        error!(error = %e, "Could not record step failure");
                    }
                },
            }
        }
        .instrument(span)
        .await
    }

    async fn run_with_retries(&self, task: &StepTask) -> StepResult {
        let handler = self
            .registry
            .get(task.step)
            .ok_or_else(|| StepError::Fatal(PipelineError::UnknownStep(task.step.to_string())))?;

        let progress: Arc<dyn ProgressSink> = Arc::new(WorkflowProgress {
            sequencer: self.sequencer.clone(),
            workflow_id: task.workflow_id,
            step_index: task.step_index,
        });

        let mut attempt = 1;
        loop {
            let ctx = StepContext {
                workflow_id: Some(task.workflow_id),
                step_index: task.step_index,
                correlation_id: task.correlation_id.clone(),
                input: task.input.clone(),
                attempt,
                progress: progress.clone(),
            };

            let handler = handler.clone();
            let result = match tokio::spawn(async move { handler.run(ctx).await }).await {
                Ok(result) => result,
                Err(join) => Err(StepError::Fatal(PipelineError::Aborted(join.to_string()))),
            };

            match result {
                Err(StepError::Retryable(e)) if attempt <= self.policy.max_retries => {
                    warn!(
                        attempt,
                        max_retries = self.policy.max_retries,
                        delay_secs = self.policy.delay.as_secs(),
                        error = %e,
                        "Step failed, retrying"
                    );
                    tokio::time::sleep(self.policy.delay).await;
                    attempt += 1;
                },
                Err(e) => {
                    error!(attempt, retryable = e.is_retryable(), error = %e, "Step failed");
                    return Err(e);
                },
                Ok(output) => return Ok(output),
            }
        }
    }
}
