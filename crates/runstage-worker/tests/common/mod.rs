//! Common test utilities for runstage worker integration tests
//!
//! In-memory stand-ins for the external collaborators:
//!
//! - [`MemoryStorage`]: remote storage holding objects in a map, counting
//!   downloads and optionally corrupting some of them
//! - [`RecordingApi`]: external API keeping batches and datasets in memory and
//!   recording every write
//! - [`RecordingQueue`]: task queue that only remembers what was enqueued
//!
//! plus a [`TestEnv`] laying out scratch, staging and QC roots in a temp dir.

#![allow(dead_code)]

use async_trait::async_trait;
use runstage_common::checksum::compute_checksum;
use runstage_common::merge::merge;
use runstage_common::types::{Batch, ChecksumAlgorithm, Dataset, DatasetState, NewBatch};
use runstage_worker::api::PipelineApi;
use runstage_worker::config::Config;
use runstage_worker::error::{PipelineError, PipelineResult};
use runstage_worker::progress::NullProgress;
use runstage_worker::steps::{StepContext, StepDeps};
use runstage_worker::storage::{key_file_name, RemoteStorage};
use runstage_worker::workflow::{StepTask, TaskQueue};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ============================================================================
// Remote storage
// ============================================================================

#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    gets: AtomicUsize,
    corrupt_gets: AtomicUsize,
    fail_hash: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    /// Number of downloads so far
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// The next `n` downloads write truncated bytes
    pub fn corrupt_next_gets(&self, n: usize) {
        self.corrupt_gets.store(n, Ordering::SeqCst);
    }

    /// The next `n` hash lookups fail
    pub fn fail_next_hashes(&self, n: usize) {
        self.fail_hash.store(n, Ordering::SeqCst);
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn lookup(&self, key: &str) -> PipelineResult<Vec<u8>> {
        self.object(key)
            .ok_or_else(|| PipelineError::Storage(format!("No such object: {key}")))
    }
}

pub fn md5_hex(bytes: &[u8]) -> String {
    compute_checksum(&mut &bytes[..], ChecksumAlgorithm::Md5).unwrap()
}

#[async_trait]
impl RemoteStorage for MemoryStorage {
    async fn get_hash(&self, path: &str) -> PipelineResult<String> {
        if Self::take(&self.fail_hash) {
            return Err(PipelineError::Storage("hash endpoint unavailable".into()));
        }
        Ok(md5_hex(&self.lookup(path)?))
    }

    async fn get_size(&self, path: &str) -> PipelineResult<u64> {
        Ok(self.lookup(path)?.len() as u64)
    }

    async fn get(&self, source: &str, target_dir: &Path) -> PipelineResult<PathBuf> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let mut bytes = self.lookup(source)?;
        if Self::take(&self.corrupt_gets) {
            bytes.truncate(bytes.len() / 2);
        }

        let target = target_dir.join(key_file_name(source));
        tokio::fs::write(&target, bytes).await?;
        Ok(target)
    }

    async fn put(&self, local: &Path, destination: &str) -> PipelineResult<String> {
        let bytes = tokio::fs::read(local).await?;
        self.insert(destination, bytes);
        Ok(destination.to_string())
    }
}

// ============================================================================
// External API
// ============================================================================

#[derive(Default)]
pub struct RecordingApi {
    batches: Mutex<HashMap<String, Batch>>,
    datasets: Mutex<HashMap<String, Dataset>>,
    pub updates: Mutex<Vec<(String, Value)>>,
    pub states: Mutex<Vec<(String, DatasetState)>>,
    pub uploads: Mutex<Vec<(String, PathBuf)>>,
    pub created: Mutex<Vec<NewBatch>>,
    fail_creates: AtomicUsize,
    next_id: AtomicUsize,
}

impl RecordingApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_batch(&self, batch: Batch) {
        self.batches.lock().unwrap().insert(batch.id.clone(), batch);
    }

    pub fn add_dataset(&self, dataset: Dataset) {
        self.datasets.lock().unwrap().insert(dataset.id.clone(), dataset);
    }

    pub fn batch(&self, id: &str) -> Batch {
        self.batches.lock().unwrap().get(id).cloned().unwrap()
    }

    /// The next `n` `create_batch` calls fail with a 503
    pub fn fail_next_creates(&self, n: usize) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    pub fn states_for(&self, id: &str) -> Vec<DatasetState> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, _)| i == id)
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn write_count(&self) -> usize {
        self.updates.lock().unwrap().len()
            + self.states.lock().unwrap().len()
            + self.uploads.lock().unwrap().len()
    }

    fn not_found(what: &str, id: &str) -> PipelineError {
        PipelineError::Api {
            status: 404,
            message: format!("{what} {id} not found"),
        }
    }
}

#[async_trait]
impl PipelineApi for RecordingApi {
    async fn get_batch(&self, id: &str) -> PipelineResult<Batch> {
        self.batches
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Self::not_found("Batch", id))
    }

    /// Explicit datasets win; otherwise an archived batch doubles as one
    async fn get_dataset(&self, id: &str) -> PipelineResult<Dataset> {
        if let Some(dataset) = self.datasets.lock().unwrap().get(id).cloned() {
            return Ok(dataset);
        }

        let batches = self.batches.lock().unwrap();
        batches
            .get(id)
            .and_then(|b| b.archive_path.clone().map(|archive| dataset(id, &b.name, &archive)))
            .ok_or_else(|| Self::not_found("Dataset", id))
    }

    async fn update_batch(&self, id: &str, fields: Value) -> PipelineResult<()> {
        let mut batches = self.batches.lock().unwrap();
        let batch = batches.get_mut(id).ok_or_else(|| Self::not_found("Batch", id))?;

        let mut value = serde_json::to_value(&*batch)?;
        merge(&mut value, fields.clone());
        *batch = serde_json::from_value(value)?;

        self.updates.lock().unwrap().push((id.to_string(), fields));
        Ok(())
    }

    async fn add_state_to_dataset(&self, id: &str, state: DatasetState) -> PipelineResult<()> {
        self.states.lock().unwrap().push((id.to_string(), state));
        Ok(())
    }

    async fn upload_report(&self, id: &str, report: &Path) -> PipelineResult<()> {
        self.uploads
            .lock()
            .unwrap()
            .push((id.to_string(), report.to_path_buf()));
        Ok(())
    }

    async fn create_batch(&self, batch: &NewBatch) -> PipelineResult<Batch> {
        if MemoryStorage::take(&self.fail_creates) {
            return Err(PipelineError::Api {
                status: 503,
                message: "service unavailable".into(),
            });
        }

        let id = format!("b-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let created = Batch {
            id: id.clone(),
            name: batch.name.clone(),
            origin_path: batch.origin_path.clone(),
            workflow_id: Some(batch.workflow_id.clone()),
            stage_path: None,
            report_id: None,
            archive_path: None,
            du_size: None,
            num_files: None,
            state: None,
        };

        self.created.lock().unwrap().push(batch.clone());
        self.add_batch(created.clone());
        Ok(created)
    }

    async fn get_all_batches(&self) -> PipelineResult<Vec<Batch>> {
        Ok(self.batches.lock().unwrap().values().cloned().collect())
    }
}

// ============================================================================
// Task queue
// ============================================================================

#[derive(Default)]
pub struct RecordingQueue {
    pub tasks: Mutex<Vec<StepTask>>,
    fail_enqueues: AtomicUsize,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Reject the next `n` enqueues with a queue error
    pub fn fail_next_enqueues(&self, n: usize) {
        self.fail_enqueues.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, task: StepTask) -> PipelineResult<()> {
        if MemoryStorage::take(&self.fail_enqueues) {
            return Err(PipelineError::Queue("broker unavailable".to_string()));
        }
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }
}

// ============================================================================
// Filesystem layout
// ============================================================================

/// Temp directory with scratch, staging and QC roots plus a matching config
pub struct TestEnv {
    pub root: TempDir,
    pub config: Config,
}

impl TestEnv {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.paths.scratch = root.path().join("scratch");
        config.paths.stage_roots = [("raw_data".to_string(), root.path().join("stage"))].into();
        config.paths.qc = root.path().join("qc");
        config.paths.scratch_reserve = "0".to_string();
        config.queue.progress_interval_secs = 1;
        Self { root, config }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn stage_root(&self) -> PathBuf {
        self.path().join("stage")
    }

    pub fn scratch(&self) -> PathBuf {
        self.path().join("scratch")
    }

    pub fn deps(&self, api: Arc<RecordingApi>, storage: Arc<MemoryStorage>) -> StepDeps {
        StepDeps {
            api,
            storage,
            config: Arc::new(self.config.clone()),
        }
    }
}

/// A run directory `<parent>/<name>` with a couple of lanes of reads
pub fn make_run_dir(parent: &Path, name: &str) -> PathBuf {
    let run = parent.join(name);
    std::fs::create_dir_all(run.join("lane1")).unwrap();
    std::fs::create_dir_all(run.join("lane2")).unwrap();
    std::fs::write(run.join("lane1/s1_R1.fastq.gz"), b"@r1\nACGT\n+\nIIII\n").unwrap();
    std::fs::write(run.join("lane2/s1_R1.fastq.gz"), b"@r2\nTTGA\n+\nIIII\n").unwrap();
    std::fs::write(run.join("SampleSheet.csv"), b"Sample_ID\ns1\n").unwrap();
    run
}

/// Tar archive bytes with a single top-level directory `name`
pub fn run_tar_bytes(name: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
    let src = tempfile::tempdir().unwrap();
    for (rel, content) in files {
        let path = src.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    let out = tempfile::NamedTempFile::new().unwrap();
    let mut builder = tar::Builder::new(File::create(out.path()).unwrap());
    builder.append_dir_all(name, src.path()).unwrap();
    builder.finish().unwrap();
    drop(builder);
    std::fs::read(out.path()).unwrap()
}

pub fn dataset(id: &str, name: &str, archive_path: &str) -> Dataset {
    Dataset {
        id: id.to_string(),
        name: name.to_string(),
        dataset_type: "raw_data".to_string(),
        archive_path: archive_path.to_string(),
    }
}

pub fn batch(id: &str, name: &str, origin_path: &Path) -> Batch {
    Batch {
        id: id.to_string(),
        name: name.to_string(),
        origin_path: origin_path.to_path_buf(),
        workflow_id: None,
        stage_path: None,
        report_id: None,
        archive_path: None,
        du_size: None,
        num_files: None,
        state: None,
    }
}

pub fn standalone(id: &str) -> StepContext {
    StepContext::standalone(id, Arc::new(NullProgress))
}

/// Relative paths and contents of every file under `dir`, sorted
pub fn snapshot(dir: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<_> = walkdir::WalkDir::new(dir)
        .into_iter()
        .map(Result::unwrap)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(dir).unwrap().to_string_lossy().into_owned();
            (rel, std::fs::read(e.path()).unwrap())
        })
        .collect();
    files.sort();
    files
}
