//! Staging: fetch a dataset archive into scratch, verify it against the
//! remote digest, and extract it under the staging root for its type.
//!
//! The procedure is safe to re-enter from the top after any failure:
//!
//! 1. the remote digest is the reference;
//! 2. a scratch copy that is a readable tar archive with a matching digest is
//!    reused without fetching;
//! 3. anything else in the scratch slot is deleted and the archive is fetched
//!    again, with a progress poller watching the growing file;
//! 4. a digest mismatch after the fetch is an integrity error and the bad
//!    copy is left in place for inspection (the next attempt deletes it);
//! 5. the archive is extracted into a hidden sibling of the staging
//!    directory, which must then hold a top-level directory named after the
//!    dataset;
//! 6. an existing staging directory with the dataset's name is removed and
//!    the fresh extraction renamed into its place;
//! 7. the scratch copy is deleted.
//!
//! A rejected or interrupted extraction never touches the previous staging
//! directory.
//!
//! Two attempts for the same dataset must never run at the same time. That
//! exclusion belongs to the task queue; nothing here locks.

use crate::blocking::run_blocking;
use crate::error::{PipelineError, PipelineResult, StepResult};
use crate::progress::{dir_progress, file_progress, track_progress, ProgressSink};
use crate::steps::{step_output, StepContext, StepDeps, StepHandler, StepKind};
use crate::storage::{key_file_name, RemoteStorage};
use async_trait::async_trait;
use runstage_common::checksum::{compute_file_checksum, digests_match};
use runstage_common::process::available_space;
use runstage_common::size::format_size;
use runstage_common::types::{ChecksumAlgorithm, Dataset, DatasetState};
use serde::Serialize;
use serde_json::json;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Where staging reads and writes
#[derive(Debug, Clone)]
pub struct StageLayout {
    pub scratch_dir: PathBuf,
    pub stage_root: PathBuf,
    /// Bytes that must stay free on the scratch filesystem besides the archive
    pub scratch_reserve: u64,
    pub progress_interval: Duration,
}

impl StageLayout {
    pub fn scratch_path(&self, dataset_name: &str) -> PathBuf {
        self.scratch_dir.join(format!("{dataset_name}.tar"))
    }

    pub fn stage_path(&self, dataset_name: &str) -> PathBuf {
        self.stage_root.join(dataset_name)
    }

    /// Where an extraction lands before it is renamed into the stage path
    pub fn partial_path(&self, dataset_name: &str) -> PathBuf {
        self.stage_root.join(format!(".{dataset_name}.partial"))
    }

    /// The file remote storage writes while fetching `archive_path`
    pub fn fetch_path(&self, archive_path: &str) -> PathBuf {
        self.scratch_dir.join(key_file_name(archive_path))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageOutcome {
    pub stage_path: PathBuf,
    /// The scratch copy was reused and no fetch happened
    pub reused: bool,
}

/// Stage one dataset
#[instrument(skip_all, fields(dataset = %dataset.name, archive = %dataset.archive_path))]
pub async fn stage_dataset(
    storage: &dyn RemoteStorage,
    dataset: &Dataset,
    layout: &StageLayout,
    progress: Arc<dyn ProgressSink>,
) -> PipelineResult<StageOutcome> {
    let remote_digest = storage.get_hash(&dataset.archive_path).await?;
    let scratch_path = layout.scratch_path(&dataset.name);
    tokio::fs::create_dir_all(&layout.scratch_dir).await?;

    let reused = scratch_copy_matches(&scratch_path, &remote_digest).await?;
    if reused {
        info!(scratch = %scratch_path.display(), "Reusing verified scratch copy");
    } else {
        fetch_archive(storage, dataset, layout, &scratch_path, progress.clone()).await?;

        let local_digest = md5_of(&scratch_path).await?;
        if !digests_match(&local_digest, &remote_digest) {
            warn!(
                scratch = %scratch_path.display(),
                expected = %remote_digest,
                actual = %local_digest,
                "Fetched archive does not match remote digest"
            );
            return Err(PipelineError::Integrity {
                path: scratch_path,
                expected: remote_digest,
                actual: local_digest,
            });
        }
    }

    let partial = layout.partial_path(&dataset.name);
    remove_dir_if_present(&partial).await?;
    tokio::fs::create_dir_all(&partial).await?;

    let archive_size = tokio::fs::metadata(&scratch_path).await?.len();
    let (archive, dest) = (scratch_path.clone(), partial.clone());
    let (sink, watched) = (progress, partial.clone());
    let extracted = track_progress(
        layout.progress_interval,
        move || dir_progress(sink.clone(), watched.clone(), Some(archive_size), "extract"),
        run_blocking(move || extract_archive(&archive, &dest)),
    )
    .await;

    let staged = match extracted {
        Ok(()) => swap_into_place(&partial, &dataset.name, layout, &scratch_path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = remove_dir_if_present(&partial).await {
        warn!(partial = %partial.display(), error = %e, "Could not clean up partial extraction");
    }
    let stage_path = staged?;

    tokio::fs::remove_file(&scratch_path).await?;
    info!(stage_path = %stage_path.display(), reused, "Dataset staged");

    Ok(StageOutcome { stage_path, reused })
}

/// Move the dataset's directory out of `partial`, replacing any previous
/// extraction
async fn swap_into_place(
    partial: &Path,
    name: &str,
    layout: &StageLayout,
    archive: &Path,
) -> PipelineResult<PathBuf> {
    let extracted = partial.join(name);
    if !extracted.is_dir() {
        return Err(PipelineError::Validation(format!(
            "Archive {} has no top-level directory named {name}",
            archive.display()
        )));
    }

    let stage_path = layout.stage_path(name);
    if tokio::fs::try_exists(&stage_path).await? {
        info!(stage_path = %stage_path.display(), "Removing previous extraction");
        tokio::fs::remove_dir_all(&stage_path).await?;
    }
    tokio::fs::rename(&extracted, &stage_path).await?;
    Ok(stage_path)
}

/// Delete whatever occupies the scratch slot and download the archive into it
async fn fetch_archive(
    storage: &dyn RemoteStorage,
    dataset: &Dataset,
    layout: &StageLayout,
    scratch_path: &Path,
    progress: Arc<dyn ProgressSink>,
) -> PipelineResult<()> {
    remove_if_present(scratch_path).await?;

    let remote_size = storage.get_size(&dataset.archive_path).await?;
    ensure_scratch_space(&layout.scratch_dir, remote_size, layout.scratch_reserve).await?;

    info!(size = %format_size(remote_size), "Fetching archive into scratch");
    let (sink, watched) = (progress, layout.fetch_path(&dataset.archive_path));
    let fetched = track_progress(
        layout.progress_interval,
        move || file_progress(sink.clone(), watched.clone(), Some(remote_size), "remote_get"),
        storage.get(&dataset.archive_path, &layout.scratch_dir),
    )
    .await?;

    if fetched != scratch_path {
        debug!(from = %fetched.display(), to = %scratch_path.display(), "Renaming fetched archive");
        tokio::fs::rename(&fetched, scratch_path).await?;
    }

    Ok(())
}

async fn ensure_scratch_space(dir: &Path, size: u64, reserve: u64) -> PipelineResult<()> {
    let available = available_space(dir).await?;
    let required = size.saturating_add(reserve);

    if available < required {
        return Err(PipelineError::InsufficientSpace {
            path: dir.to_path_buf(),
            required,
            available,
        });
    }
    Ok(())
}

/// True when `path` holds a readable tar archive whose MD5 equals `expected`
async fn scratch_copy_matches(path: &Path, expected: &str) -> PipelineResult<bool> {
    let path = path.to_path_buf();
    let expected = expected.to_string();

    run_blocking(move || {
        if !path.is_file() || !is_tar_archive(&path) {
            return Ok(false);
        }
        let local = compute_file_checksum(&path, ChecksumAlgorithm::Md5)?;
        Ok(digests_match(&local, &expected))
    })
    .await
}

async fn md5_of(path: &Path) -> PipelineResult<String> {
    let path = path.to_path_buf();
    run_blocking(move || Ok(compute_file_checksum(&path, ChecksumAlgorithm::Md5)?)).await
}

async fn remove_if_present(path: &Path) -> PipelineResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Removed stale scratch file");
            Ok(())
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn remove_dir_if_present(path: &Path) -> PipelineResult<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whether the file starts with a well-formed tar header
pub fn is_tar_archive(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let mut archive = tar::Archive::new(file);
    let first = archive.entries().ok().and_then(|mut entries| entries.next());
    matches!(first, Some(Ok(_)))
}

/// Unpack `archive` into `dest`. Entries escaping `dest` are skipped by `tar`.
pub fn extract_archive(archive: &Path, dest: &Path) -> PipelineResult<()> {
    let file = File::open(archive)?;
    let mut archive = tar::Archive::new(file);
    archive.set_preserve_mtime(true);
    archive.unpack(dest)?;
    Ok(())
}

/// The `stage` step
pub struct StageStep {
    deps: StepDeps,
}

impl StageStep {
    pub fn new(deps: StepDeps) -> Self {
        Self { deps }
    }

    async fn execute(&self, ctx: &StepContext) -> PipelineResult<serde_json::Value> {
        let config = &self.deps.config;
        let dataset = self.deps.api.get_dataset(&ctx.correlation_id).await?;

        let stage_root = config.stage_root(&dataset.dataset_type).ok_or_else(|| {
            PipelineError::Config(format!(
                "No staging root configured for dataset type {}",
                dataset.dataset_type
            ))
        })?;

        let layout = StageLayout {
            scratch_dir: config.paths.scratch.clone(),
            stage_root: stage_root.to_path_buf(),
            scratch_reserve: config.scratch_reserve_bytes(),
            progress_interval: config.progress_interval(),
        };

        let outcome = stage_dataset(
            self.deps.storage.as_ref(),
            &dataset,
            &layout,
            ctx.progress.clone(),
        )
        .await?;

        self.deps
            .api
            .update_batch(&ctx.correlation_id, json!({ "stage_path": outcome.stage_path }))
            .await?;
        self.deps
            .api
            .add_state_to_dataset(&ctx.correlation_id, DatasetState::Staged)
            .await?;

        Ok(step_output(
            &ctx.correlation_id,
            json!({ "stage_path": outcome.stage_path, "reused": outcome.reused }),
        ))
    }
}

#[async_trait]
impl StepHandler for StageStep {
    fn kind(&self) -> StepKind {
        StepKind::Stage
    }

    #[instrument(skip_all, fields(id = %ctx.correlation_id, attempt = ctx.attempt))]
    async fn run(&self, ctx: StepContext) -> StepResult {
        Ok(self.execute(&ctx).await?)
    }
}
