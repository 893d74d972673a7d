//! Validate: check the staged copy against what inspect recorded

use crate::blocking::run_blocking;
use crate::error::{PipelineError, PipelineResult, StepResult};
use crate::steps::inspect::file_census;
use crate::steps::{step_output, StepContext, StepDeps, StepHandler, StepKind};
use async_trait::async_trait;
use runstage_common::types::{Batch, DatasetState};
use serde_json::json;
use tracing::{info, instrument};

/// Check a batch's staged directory; returns the number of files found
pub async fn validate_staged(batch: &Batch) -> PipelineResult<u64> {
    let stage_path = batch
        .stage_path
        .clone()
        .ok_or_else(|| PipelineError::Validation(format!("Batch {} has not been staged", batch.name)))?;

    if !stage_path.is_dir() {
        return Err(PipelineError::Validation(format!(
            "Staged directory {} does not exist",
            stage_path.display()
        )));
    }

    let census = run_blocking(move || file_census(&stage_path)).await?;

    if let Some(expected) = batch.num_files {
        if census.num_files != expected {
            return Err(PipelineError::Validation(format!(
                "Staged copy of {} has {} files, origin had {}",
                batch.name, census.num_files, expected
            )));
        }
    }

    Ok(census.num_files)
}

/// The `validate` step
pub struct ValidateStep {
    deps: StepDeps,
}

impl ValidateStep {
    pub fn new(deps: StepDeps) -> Self {
        Self { deps }
    }

    async fn execute(&self, ctx: &StepContext) -> PipelineResult<serde_json::Value> {
        let batch = self.deps.api.get_batch(&ctx.correlation_id).await?;
        let num_files = validate_staged(&batch).await?;

        self.deps
            .api
            .add_state_to_dataset(&ctx.correlation_id, DatasetState::Validated)
            .await?;

        info!(num_files, "Staged batch validated");
        Ok(step_output(&ctx.correlation_id, json!({ "num_files": num_files })))
    }
}

#[async_trait]
impl StepHandler for ValidateStep {
    fn kind(&self) -> StepKind {
        StepKind::Validate
    }

    #[instrument(skip_all, fields(id = %ctx.correlation_id, attempt = ctx.attempt))]
    async fn run(&self, ctx: StepContext) -> StepResult {
        Ok(self.execute(&ctx).await?)
    }
}
