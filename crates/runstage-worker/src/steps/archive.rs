//! Archive: tar a batch's origin directory and upload it to remote storage

use crate::blocking::run_blocking;
use crate::error::{PipelineError, PipelineResult, StepResult};
use crate::progress::{file_progress, track_progress};
use crate::steps::{step_output, StepContext, StepDeps, StepHandler, StepKind};
use async_trait::async_trait;
use runstage_common::checksum::{compute_file_checksum, digests_match};
use runstage_common::types::{ChecksumAlgorithm, DatasetState};
use serde_json::json;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

/// Remote key for a batch archive, e.g. `archive/run42.tar`
pub fn archive_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{name}.tar")
    } else {
        format!("{prefix}/{name}.tar")
    }
}

/// Write `origin` into a tar at `target`, under a top-level directory `name`
pub fn create_archive(origin: &Path, name: &str, target: &Path) -> PipelineResult<()> {
    let file = File::create(target)?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    builder.append_dir_all(name, origin)?;
    builder.into_inner()?.sync_all()?;
    Ok(())
}

/// The `archive` step
pub struct ArchiveStep {
    deps: StepDeps,
}

impl ArchiveStep {
    pub fn new(deps: StepDeps) -> Self {
        Self { deps }
    }

    async fn execute(&self, ctx: &StepContext) -> PipelineResult<serde_json::Value> {
        let config = &self.deps.config;
        let batch = self.deps.api.get_batch(&ctx.correlation_id).await?;

        if !batch.origin_path.is_dir() {
            return Err(PipelineError::Validation(format!(
                "Origin {} is not a directory",
                batch.origin_path.display()
            )));
        }

        tokio::fs::create_dir_all(&config.paths.scratch).await?;
        let tar_path: PathBuf = config.paths.scratch.join(format!("{}.tar", batch.name));
        if tokio::fs::try_exists(&tar_path).await? {
            tokio::fs::remove_file(&tar_path).await?;
        }

        let (origin, name, target) =
            (batch.origin_path.clone(), batch.name.clone(), tar_path.clone());
        let (sink, watched) = (ctx.progress.clone(), tar_path.clone());
        track_progress(
            config.progress_interval(),
            move || file_progress(sink.clone(), watched.clone(), batch.du_size, "archive"),
            run_blocking(move || create_archive(&origin, &name, &target)),
        )
        .await?;

        let hashed = tar_path.clone();
        let local_digest =
            run_blocking(move || Ok(compute_file_checksum(&hashed, ChecksumAlgorithm::Md5)?))
                .await?;

        let key = archive_key(&config.paths.archive_prefix, &batch.name);
        let stored = self.deps.storage.put(&tar_path, &key).await?;

        let remote_digest = self.deps.storage.get_hash(&stored).await?;
        if !digests_match(&local_digest, &remote_digest) {
            return Err(PipelineError::Integrity {
                path: tar_path,
                expected: local_digest,
                actual: remote_digest,
            });
        }

        self.deps
            .api
            .update_batch(
                &ctx.correlation_id,
                json!({ "archive_path": stored, "md5": local_digest }),
            )
            .await?;

        tokio::fs::remove_file(&tar_path).await?;
        self.deps
            .api
            .add_state_to_dataset(&ctx.correlation_id, DatasetState::Archived)
            .await?;

        info!(key = %stored, md5 = %local_digest, "Batch archived");
        Ok(step_output(
            &ctx.correlation_id,
            json!({ "archive_path": stored, "md5": local_digest }),
        ))
    }
}

#[async_trait]
impl StepHandler for ArchiveStep {
    fn kind(&self) -> StepKind {
        StepKind::Archive
    }

    #[instrument(skip_all, fields(id = %ctx.correlation_id, attempt = ctx.attempt))]
    async fn run(&self, ctx: StepContext) -> StepResult {
        Ok(self.execute(&ctx).await?)
    }
}
