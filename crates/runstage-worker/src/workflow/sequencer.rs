//! Workflow sequencer
//!
//! Owns every workflow state transition. A workflow runs its steps strictly
//! one after another: the task for step N+1 is only enqueued from
//! [`Sequencer::advance`], which the worker pool calls after step N has
//! succeeded. A step that fails for good parks the workflow at that index
//! until an operator retries it.
//!
//! Transitions are read-modify-write cycles on the store and are serialized
//! through one lock, so a completion racing a pause or a retry always sees a
//! consistent record.

use crate::error::{PipelineError, PipelineResult};
use crate::steps::{StepKind, StepRegistry};
use crate::workflow::queue::TaskQueue;
use crate::workflow::store::WorkflowStore;
use crate::workflow::types::{StepTask, Workflow, WorkflowStatus};
use runstage_common::types::ProgressRecord;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// What [`Sequencer::advance`] did with a step completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The next step was enqueued
    Dispatched(StepKind),
    /// Recorded, but the workflow is paused
    Parked,
    /// That was the last step
    Completed,
    /// Stale or duplicate completion
    Ignored,
}

pub struct Sequencer {
    store: Arc<dyn WorkflowStore>,
    queue: Arc<dyn TaskQueue>,
    registry: Arc<StepRegistry>,
    transitions: Mutex<()>,
}

impl Sequencer {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        queue: Arc<dyn TaskQueue>,
        registry: Arc<StepRegistry>,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            transitions: Mutex::new(()),
        }
    }

    /// Create a workflow from step names; every name must resolve to a
    /// registered handler
    pub async fn create<S: AsRef<str>>(&self, steps: &[S]) -> PipelineResult<Uuid> {
        if steps.is_empty() {
            return Err(PipelineError::Validation(
                "A workflow needs at least one step".to_string(),
            ));
        }

        let kinds = steps
            .iter()
            .map(|name| self.registry.resolve(name.as_ref()))
            .collect::<PipelineResult<Vec<_>>>()?;

        let workflow = Workflow::new(kinds);
        self.store.insert(&workflow).await?;

        debug!(workflow_id = %workflow.id, steps = ?workflow.steps, "Workflow created");
        Ok(workflow.id)
    }

    /// Attach the batch/dataset id every step of the workflow will receive
    pub async fn bind(&self, id: Uuid, correlation_id: impl Into<String>) -> PipelineResult<Workflow> {
        let _guard = self.transitions.lock().await;
        let mut workflow = self.load(id).await?;

        if workflow.status != WorkflowStatus::Created {
            return Err(PipelineError::Workflow(format!(
                "Workflow {id} is {} and can no longer be bound",
                workflow.status
            )));
        }

        workflow.correlation_id = Some(correlation_id.into());
        workflow.touch();
        self.store.update(&workflow).await?;
        Ok(workflow)
    }

    /// Dispatch the first step
    #[instrument(skip(self))]
    pub async fn start(&self, id: Uuid) -> PipelineResult<Workflow> {
        let _guard = self.transitions.lock().await;
        let mut workflow = self.load(id).await?;

        if workflow.status != WorkflowStatus::Created {
            return Err(PipelineError::Workflow(format!(
                "Workflow {id} is {} and cannot be started",
                workflow.status
            )));
        }

        workflow.status = WorkflowStatus::Running;
        workflow.current_step = 0;
        let step = self.dispatch(&mut workflow, None).await?;

        info!(workflow_id = %id, %step, "Workflow started");
        Ok(workflow)
    }

    /// Record the success of `step_index` and move on
    #[instrument(skip(self, output))]
    pub async fn advance(
        &self,
        id: Uuid,
        step_index: usize,
        output: Value,
    ) -> PipelineResult<AdvanceOutcome> {
        let _guard = self.transitions.lock().await;
        let mut workflow = self.load(id).await?;

        if !workflow.in_flight || workflow.current_step != step_index {
            warn!(
                workflow_id = %id,
                step_index,
                current_step = workflow.current_step,
                in_flight = workflow.in_flight,
                "Ignoring stale step completion"
            );
            return Ok(AdvanceOutcome::Ignored);
        }

        workflow.in_flight = false;
        workflow.last_error = None;
        workflow.progress = None;
        workflow.last_output = Some(output.clone());
        workflow.current_step += 1;

        if workflow.current_step >= workflow.steps.len() {
            workflow.status = WorkflowStatus::Completed;
            workflow.touch();
            self.store.update(&workflow).await?;
            info!(workflow_id = %id, "Workflow completed");
            return Ok(AdvanceOutcome::Completed);
        }

        if workflow.status == WorkflowStatus::Paused {
            workflow.touch();
            self.store.update(&workflow).await?;
            info!(workflow_id = %id, next_step = workflow.current_step, "Workflow paused, next step held");
            return Ok(AdvanceOutcome::Parked);
        }

        let step = self.dispatch(&mut workflow, Some(output)).await?;
        Ok(AdvanceOutcome::Dispatched(step))
    }

    /// Park the workflow at `step_index` with the failure as last event
    ///
    /// Returns `false` for a stale report about a step that is no longer in
    /// flight.
    #[instrument(skip(self, error))]
    pub async fn fail(&self, id: Uuid, step_index: usize, error: &PipelineError) -> PipelineResult<bool> {
        let _guard = self.transitions.lock().await;
        let mut workflow = self.load(id).await?;

        if !workflow.in_flight || workflow.current_step != step_index {
            warn!(workflow_id = %id, step_index, "Ignoring stale step failure");
            return Ok(false);
        }

        workflow.status = WorkflowStatus::Failed;
        workflow.in_flight = false;
        workflow.last_error = Some(error.to_string());
        workflow.touch();
        self.store.update(&workflow).await?;

        warn!(
            workflow_id = %id,
            step = ?workflow.current(),
            step_index,
            error = %error,
            "Workflow halted"
        );
        Ok(true)
    }

    pub async fn pause(&self, id: Uuid) -> PipelineResult<Workflow> {
        let _guard = self.transitions.lock().await;
        let mut workflow = self.load(id).await?;

        if workflow.status != WorkflowStatus::Running {
            return Err(PipelineError::Workflow(format!(
                "Workflow {id} is {} and cannot be paused",
                workflow.status
            )));
        }

        workflow.status = WorkflowStatus::Paused;
        workflow.touch();
        self.store.update(&workflow).await?;
        info!(workflow_id = %id, "Workflow paused");
        Ok(workflow)
    }

    /// Resume a paused workflow, dispatching the current step unless it is
    /// still running
    pub async fn resume(&self, id: Uuid) -> PipelineResult<Workflow> {
        let _guard = self.transitions.lock().await;
        let mut workflow = self.load(id).await?;

        if workflow.status != WorkflowStatus::Paused {
            return Err(PipelineError::Workflow(format!(
                "Workflow {id} is {} and cannot be resumed",
                workflow.status
            )));
        }

        workflow.status = WorkflowStatus::Running;
        if workflow.in_flight {
            workflow.touch();
            self.store.update(&workflow).await?;
        } else {
            let input = workflow.last_output.clone();
            self.dispatch(&mut workflow, input).await?;
        }

        info!(workflow_id = %id, "Workflow resumed");
        Ok(workflow)
    }

    /// Re-dispatch the step a failed workflow is parked at
    pub async fn retry(&self, id: Uuid) -> PipelineResult<Workflow> {
        let _guard = self.transitions.lock().await;
        let mut workflow = self.load(id).await?;

        if workflow.status != WorkflowStatus::Failed {
            return Err(PipelineError::Workflow(format!(
                "Workflow {id} is {} and has nothing to retry",
                workflow.status
            )));
        }

        workflow.status = WorkflowStatus::Running;
        workflow.last_error = None;
        let input = workflow.last_output.clone();
        let step = self.dispatch(&mut workflow, input).await?;

        info!(workflow_id = %id, %step, "Workflow step retried");
        Ok(workflow)
    }

    pub async fn delete(&self, id: Uuid) -> PipelineResult<()> {
        let _guard = self.transitions.lock().await;
        if self.store.delete(id).await? {
            debug!(workflow_id = %id, "Workflow deleted");
            Ok(())
        } else {
            Err(PipelineError::WorkflowNotFound(id))
        }
    }

    pub async fn get(&self, id: Uuid) -> PipelineResult<Workflow> {
        self.load(id).await
    }

    pub async fn list(&self, status: Option<WorkflowStatus>) -> PipelineResult<Vec<Workflow>> {
        match status {
            Some(status) => self.store.list_by_status(status).await,
            None => self.store.list().await,
        }
    }

    /// Store the latest progress of the step currently in flight
    pub async fn record_progress(
        &self,
        id: Uuid,
        step_index: usize,
        record: ProgressRecord,
    ) -> PipelineResult<()> {
        let _guard = self.transitions.lock().await;
        let mut workflow = self.load(id).await?;

        if workflow.in_flight && workflow.current_step == step_index {
            workflow.progress = Some(record);
            workflow.touch();
            self.store.update(&workflow).await?;
        }
        Ok(())
    }

    /// Re-dispatch the current step of every running workflow
    ///
    /// Queued tasks do not survive a restart, so a running workflow found in
    /// the store at startup gets its current step again (at-least-once). A
    /// paused workflow whose step was in flight loses that task too; it is
    /// marked idle so that `resume` dispatches the step again. Returns the
    /// number of running workflows re-dispatched.
    pub async fn recover(&self) -> PipelineResult<usize> {
        let paused = self.store.list_by_status(WorkflowStatus::Paused).await?;
        for stale in paused.into_iter().filter(|w| w.in_flight) {
            let _guard = self.transitions.lock().await;
            let Some(mut workflow) = self.store.get(stale.id).await? else {
                continue;
            };
            if workflow.status != WorkflowStatus::Paused || !workflow.in_flight {
                continue;
            }

            workflow.in_flight = false;
            workflow.progress = None;
            workflow.touch();
            self.store.update(&workflow).await?;
            info!(
                workflow_id = %workflow.id,
                step_index = workflow.current_step,
                "Paused workflow lost its task, step held for resume"
            );
        }

        let running = self.store.list_by_status(WorkflowStatus::Running).await?;
        let mut recovered = 0;

        for stale in running {
            let _guard = self.transitions.lock().await;
            let Some(mut workflow) = self.store.get(stale.id).await? else {
                continue;
            };
            if workflow.status != WorkflowStatus::Running {
                continue;
            }

            let input = workflow.last_output.clone();
            match self.dispatch(&mut workflow, input).await {
                Ok(step) => {
                    info!(workflow_id = %workflow.id, %step, "Recovered running workflow");
                    recovered += 1;
                },
                Err(e) => warn!(workflow_id = %workflow.id, error = %e, "Could not recover workflow"),
            }
        }

        Ok(recovered)
    }

    async fn load(&self, id: Uuid) -> PipelineResult<Workflow> {
        self.store
            .get(id)
            .await?
            .ok_or(PipelineError::WorkflowNotFound(id))
    }

    /// Persist `workflow` with its current step in flight, then enqueue it.
    /// A queue failure parks the workflow as failed.
    async fn dispatch(&self, workflow: &mut Workflow, input: Option<Value>) -> PipelineResult<StepKind> {
        let step = workflow.current().ok_or_else(|| {
            PipelineError::Workflow(format!("Workflow {} has no step to dispatch", workflow.id))
        })?;
        let correlation_id = workflow.correlation_id.clone().ok_or_else(|| {
            PipelineError::Workflow(format!("Workflow {} is not bound to a batch", workflow.id))
        })?;

        workflow.in_flight = true;
        workflow.progress = None;
        workflow.touch();
        self.store.update(workflow).await?;

        let task = StepTask {
            workflow_id: workflow.id,
            step_index: workflow.current_step,
            step,
            correlation_id,
            input,
        };

        if let Err(e) = self.queue.enqueue(task).await {
            workflow.in_flight = false;
            workflow.status = WorkflowStatus::Failed;
            workflow.last_error = Some(e.to_string());
            workflow.touch();
            self.store.update(workflow).await?;
            return Err(e);
        }

        debug!(workflow_id = %workflow.id, %step, step_index = workflow.current_step, "Step dispatched");
        Ok(step)
    }
}
