//! Report: run the QC tools over a staged batch and keep the aggregate report
//!
//! The per-file quality tool runs once over every matching input (it
//! parallelises internally), the aggregate tool then summarises its output.
//! Everything in the QC directory except the aggregate report is removed
//! afterwards. A run whose tools exit cleanly but leave no report behind is
//! not an error; it is simply not persisted.

use crate::blocking::run_blocking;
use crate::config::ReportConfig;
use crate::error::{PipelineError, PipelineResult, StepResult};
use crate::progress::{dir_progress, track_progress};
use crate::steps::{step_output, StepContext, StepDeps, StepHandler, StepKind};
use async_trait::async_trait;
use runstage_common::process::execute;
use runstage_common::types::DatasetState;
use serde_json::json;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Result of one report run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOutcome {
    pub report_id: String,
    /// Present only when the aggregate report exists after the run
    pub report_path: Option<PathBuf>,
}

/// QC directory of a batch: `<qc root>/<batch name>/qc`
pub fn qc_dir(qc_root: &Path, batch_name: &str) -> PathBuf {
    qc_root.join(batch_name).join("qc")
}

/// Files under `dir` whose name ends with `suffix`, sorted
pub fn find_inputs(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    let mut inputs: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(suffix))
        .map(walkdir::DirEntry::into_path)
        .collect();
    inputs.sort();
    inputs
}

/// Remove everything in `dir` except the file named `keep`
pub fn cleanup_qc_dir(dir: &Path, keep: &str) -> PipelineResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name() == keep {
            continue;
        }
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Run both tools for one batch
///
/// `report_id` is reused when given, so regenerating a report keeps its
/// identifier.
#[instrument(skip(config))]
pub async fn create_report(
    config: &ReportConfig,
    batch_dir: &Path,
    qc_dir: &Path,
    report_id: Option<String>,
) -> PipelineResult<ReportOutcome> {
    let report_id = report_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    tokio::fs::create_dir_all(qc_dir).await?;

    let (dir, suffix) = (batch_dir.to_path_buf(), config.input_suffix.clone());
    let inputs = run_blocking(move || Ok(find_inputs(&dir, &suffix))).await?;

    if inputs.is_empty() {
        warn!(batch_dir = %batch_dir.display(), suffix = %config.input_suffix, "No inputs for quality tool");
    } else {
        let mut args: Vec<OsString> =
            vec!["-t".into(), config.quality_threads.to_string().into()];
        args.extend(inputs.iter().map(|p| p.as_os_str().to_os_string()));
        args.push("-o".into());
        args.push(qc_dir.as_os_str().to_os_string());

        info!(files = inputs.len(), tool = %config.quality_tool, "Running quality tool");
        execute(&config.quality_tool, args, None).await?;
    }

    info!(tool = %config.aggregate_tool, "Running aggregate tool");
    execute(
        &config.aggregate_tool,
        [qc_dir.as_os_str(), OsStr::new("-o"), qc_dir.as_os_str()],
        None,
    )
    .await?;

    let (dir, keep) = (qc_dir.to_path_buf(), config.report_file_name.clone());
    run_blocking(move || cleanup_qc_dir(&dir, &keep)).await?;

    let report_file = qc_dir.join(&config.report_file_name);
    let report_path = tokio::fs::try_exists(&report_file)
        .await?
        .then_some(report_file);

    Ok(ReportOutcome {
        report_id,
        report_path,
    })
}

/// The `report` step
pub struct ReportStep {
    deps: StepDeps,
}

impl ReportStep {
    pub fn new(deps: StepDeps) -> Self {
        Self { deps }
    }

    async fn execute(&self, ctx: &StepContext) -> PipelineResult<serde_json::Value> {
        let config = &self.deps.config;
        let batch = self.deps.api.get_batch(&ctx.correlation_id).await?;
        let batch_dir = batch.stage_path.clone().ok_or_else(|| {
            PipelineError::Validation(format!("Batch {} has not been staged", batch.name))
        })?;

        let qc = qc_dir(&config.paths.qc, &batch.name);
        let (sink, watched) = (ctx.progress.clone(), qc.clone());
        let outcome = track_progress(
            config.progress_interval(),
            move || dir_progress(sink.clone(), watched.clone(), None, "report"),
            create_report(&config.report, &batch_dir, &qc, batch.report_id.clone()),
        )
        .await?;

        let Some(report_path) = outcome.report_path else {
            warn!(qc_dir = %qc.display(), "Tools finished without producing a report; nothing persisted");
            return Ok(step_output(
                &ctx.correlation_id,
                json!({ "report_id": null, "reported": false }),
            ));
        };

        self.deps
            .api
            .update_batch(&ctx.correlation_id, json!({ "report_id": outcome.report_id }))
            .await?;
        self.deps
            .api
            .upload_report(&ctx.correlation_id, &report_path)
            .await?;
        self.deps
            .api
            .add_state_to_dataset(&ctx.correlation_id, DatasetState::Reported)
            .await?;

        info!(report_id = %outcome.report_id, "Report persisted");
        Ok(step_output(
            &ctx.correlation_id,
            json!({ "report_id": outcome.report_id, "reported": true }),
        ))
    }
}

#[async_trait]
impl StepHandler for ReportStep {
    fn kind(&self) -> StepKind {
        StepKind::Report
    }

    #[instrument(skip_all, fields(id = %ctx.correlation_id, attempt = ctx.attempt))]
    async fn run(&self, ctx: StepContext) -> StepResult {
        Ok(self.execute(&ctx).await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_qc_dir_layout() {
        assert_eq!(
            qc_dir(Path::new("/qc"), "run42"),
            PathBuf::from("/qc/run42/qc")
        );
    }

    #[test]
    fn test_cleanup_keeps_only_report() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fastqc1.html"), b"a").unwrap();
        std::fs::write(dir.path().join("fastqc1.zip"), b"b").unwrap();
        std::fs::write(dir.path().join("multiqc_report.html"), b"c").unwrap();
        std::fs::create_dir_all(dir.path().join("multiqc_data/nested")).unwrap();

        cleanup_qc_dir(dir.path(), "multiqc_report.html").unwrap();

        let remaining: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(remaining, vec!["multiqc_report.html".to_string()]);
    }

    #[test]
    fn test_find_inputs_filters_by_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("lane2")).unwrap();
        std::fs::write(dir.path().join("lane2/b.fastq.gz"), b"").unwrap();
        std::fs::write(dir.path().join("a.fastq.gz"), b"").unwrap();
        std::fs::write(dir.path().join("a.fastq"), b"").unwrap();

        let inputs = find_inputs(dir.path(), ".fastq.gz");
        assert_eq!(
            inputs,
            vec![dir.path().join("a.fastq.gz"), dir.path().join("lane2/b.fastq.gz")]
        );
    }
}
