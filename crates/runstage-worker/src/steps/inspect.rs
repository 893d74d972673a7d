//! Inspect: measure a batch's origin directory

use crate::blocking::run_blocking;
use crate::error::{PipelineError, PipelineResult, StepResult};
use crate::steps::{step_output, StepContext, StepDeps, StepHandler, StepKind};
use async_trait::async_trait;
use runstage_common::process::total_size;
use runstage_common::types::DatasetState;
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use tracing::{info, instrument};

/// Regular files under a directory and their apparent size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileCensus {
    pub num_files: u64,
    pub size: u64,
}

/// Count regular files without following symlinks
pub fn file_census(dir: &Path) -> PipelineResult<FileCensus> {
    let mut census = FileCensus::default();
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry.map_err(|e| PipelineError::Io(std::io::Error::other(e)))?;
        if entry.file_type().is_file() {
            census.num_files += 1;
            census.size += entry
                .metadata()
                .map_err(|e| PipelineError::Io(std::io::Error::other(e)))?
                .len();
        }
    }
    Ok(census)
}

/// The `inspect` step
pub struct InspectStep {
    deps: StepDeps,
}

impl InspectStep {
    pub fn new(deps: StepDeps) -> Self {
        Self { deps }
    }

    async fn execute(&self, ctx: &StepContext) -> PipelineResult<serde_json::Value> {
        let batch = self.deps.api.get_batch(&ctx.correlation_id).await?;
        let origin = batch.origin_path.clone();

        if !origin.is_dir() {
            return Err(PipelineError::Validation(format!(
                "Origin {} is not a directory",
                origin.display()
            )));
        }

        let du_size = total_size(&origin).await?;
        let census = run_blocking(move || file_census(&origin)).await?;

        self.deps
            .api
            .update_batch(
                &ctx.correlation_id,
                json!({
                    "du_size": du_size,
                    "size": census.size,
                    "num_files": census.num_files,
                }),
            )
            .await?;
        self.deps
            .api
            .add_state_to_dataset(&ctx.correlation_id, DatasetState::Inspected)
            .await?;

        info!(du_size, num_files = census.num_files, "Batch inspected");
        Ok(step_output(
            &ctx.correlation_id,
            json!({ "du_size": du_size, "size": census.size, "num_files": census.num_files }),
        ))
    }
}

#[async_trait]
impl StepHandler for InspectStep {
    fn kind(&self) -> StepKind {
        StepKind::Inspect
    }

    #[instrument(skip_all, fields(id = %ctx.correlation_id, attempt = ctx.attempt))]
    async fn run(&self, ctx: StepContext) -> StepResult {
        Ok(self.execute(&ctx).await?)
    }
}
