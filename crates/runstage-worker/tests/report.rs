//! Report step tests with stand-in QC tools
//!
//! The quality and aggregate tools are replaced by small shell scripts that
//! write the files the real tools would.
#![cfg(unix)]

mod common;

use common::{batch, make_run_dir, standalone, MemoryStorage, RecordingApi, TestEnv};
use runstage_common::types::DatasetState;
use runstage_worker::error::{PipelineError, StepError};
use runstage_worker::steps::report::{create_report, qc_dir};
use runstage_worker::steps::{ReportStep, StepHandler};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const QUALITY_TOOL: &str = r#"#!/bin/sh
for last; do :; done
echo "$@" > "$last/quality.args"
touch "$last/fastqc1.html" "$last/fastqc1.zip"
"#;

const AGGREGATE_TOOL: &str = r#"#!/bin/sh
mkdir -p "$3/multiqc_data"
touch "$3/multiqc_data/multiqc.log"
echo "<html>report</html>" > "$3/multiqc_report.html"
"#;

const SILENT_AGGREGATE_TOOL: &str = r#"#!/bin/sh
mkdir -p "$3/multiqc_data"
"#;

const FAILING_TOOL: &str = r#"#!/bin/sh
echo "out of memory" >&2
exit 3
"#;

fn script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

fn env_with_tools(aggregate: &str) -> TestEnv {
    let mut env = TestEnv::new();
    let tools = env.path().join("tools");
    std::fs::create_dir_all(&tools).unwrap();
    env.config.report.quality_tool = script(&tools, "fastqc", QUALITY_TOOL);
    env.config.report.aggregate_tool = script(&tools, "multiqc", aggregate);
    env
}

fn staged_batch(env: &TestEnv, api: &RecordingApi) -> PathBuf {
    let staged = make_run_dir(&env.stage_root(), "run42");
    let mut record = batch("b-1", "run42", &env.path().join("origin/run42"));
    record.stage_path = Some(staged.clone());
    api.add_batch(record);
    staged
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_report_keeps_only_aggregate_report() {
    let env = env_with_tools(AGGREGATE_TOOL);
    let api = RecordingApi::new();
    let staged = staged_batch(&env, &api);
    let qc = qc_dir(&env.config.paths.qc, "run42");

    let outcome = create_report(&env.config.report, &staged, &qc, None).await.unwrap();

    assert_eq!(outcome.report_path, Some(qc.join("multiqc_report.html")));
    assert_eq!(file_names(&qc), vec!["multiqc_report.html".to_string()]);
    assert!(uuid::Uuid::parse_str(&outcome.report_id).is_ok());
}

#[tokio::test]
async fn test_report_id_is_reused() {
    let env = env_with_tools(AGGREGATE_TOOL);
    let api = RecordingApi::new();
    let staged = staged_batch(&env, &api);
    let qc = qc_dir(&env.config.paths.qc, "run42");

    let outcome = create_report(&env.config.report, &staged, &qc, Some("rep-7".into()))
        .await
        .unwrap();
    assert_eq!(outcome.report_id, "rep-7");
}

#[tokio::test]
async fn test_report_step_persists_report() {
    let env = env_with_tools(AGGREGATE_TOOL);
    let api = Arc::new(RecordingApi::new());
    staged_batch(&env, &api);

    let step = ReportStep::new(env.deps(api.clone(), Arc::new(MemoryStorage::new())));
    let output = step.run(standalone("b-1")).await.unwrap();

    assert_eq!(output["reported"], true);
    let report_id = output["report_id"].as_str().unwrap().to_string();
    assert_eq!(api.batch("b-1").report_id, Some(report_id));

    let uploads = api.uploads.lock().unwrap().clone();
    assert_eq!(
        uploads,
        vec![(
            "b-1".to_string(),
            qc_dir(&env.config.paths.qc, "run42").join("multiqc_report.html")
        )]
    );
    assert_eq!(api.states_for("b-1"), vec![DatasetState::Reported]);
}

#[tokio::test]
async fn test_missing_report_is_not_persisted() {
    let env = env_with_tools(SILENT_AGGREGATE_TOOL);
    let api = Arc::new(RecordingApi::new());
    staged_batch(&env, &api);

    let step = ReportStep::new(env.deps(api.clone(), Arc::new(MemoryStorage::new())));
    let output = step.run(standalone("b-1")).await.unwrap();

    assert_eq!(output["reported"], false);
    assert_eq!(api.write_count(), 0);
    assert!(file_names(&qc_dir(&env.config.paths.qc, "run42")).is_empty());
}

#[tokio::test]
async fn test_tool_failure_is_retryable_with_output() {
    let env = env_with_tools(FAILING_TOOL);
    let api = Arc::new(RecordingApi::new());
    staged_batch(&env, &api);

    let step = ReportStep::new(env.deps(api.clone(), Arc::new(MemoryStorage::new())));
    let err = step.run(standalone("b-1")).await.unwrap_err();

    assert!(err.is_retryable());
    assert!(err.to_string().contains("out of memory"));
    assert_eq!(api.write_count(), 0);
}

#[tokio::test]
async fn test_unstaged_batch_is_rejected() {
    let env = env_with_tools(AGGREGATE_TOOL);
    let api = Arc::new(RecordingApi::new());
    api.add_batch(batch("b-1", "run42", &env.path().join("origin/run42")));

    let step = ReportStep::new(env.deps(api, Arc::new(MemoryStorage::new())));
    let err = step.run(standalone("b-1")).await.unwrap_err();
    assert!(matches!(err, StepError::Fatal(PipelineError::Validation(_))));
}
