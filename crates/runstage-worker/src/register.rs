//! Registration scanner
//!
//! Watches the configured source directories for new sequencing runs. A new
//! directory first becomes a candidate; once nothing under it has been
//! modified for the recency window it is registered: a workflow is created,
//! a batch record pointing at it is persisted through the external API and
//! the workflow is started.
//!
//! The scanner's bookkeeping lives in an explicit [`RegistrationState`]. Its
//! `completed` set is seeded from the batches the API already knows, so a
//! restart never registers a directory twice.

use crate::api::PipelineApi;
use crate::blocking::run_blocking;
use crate::config::RegistrationConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::steps::StepKind;
use crate::workflow::Sequencer;
use runstage_common::types::{Batch, NewBatch};
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Steps every registered batch goes through
pub const REGISTRATION_STEPS: [StepKind; 4] = [
    StepKind::Inspect,
    StepKind::Archive,
    StepKind::Stage,
    StepKind::Validate,
];

/// Paths the scanner knows about
///
/// A path is never in both `completed` and `candidates`.
#[derive(Debug, Default, Clone)]
pub struct RegistrationState {
    completed: HashSet<PathBuf>,
    /// Candidate directory and when it was first seen
    candidates: BTreeMap<PathBuf, SystemTime>,
    rejects: HashSet<PathBuf>,
}

impl RegistrationState {
    pub fn new(completed: impl IntoIterator<Item = PathBuf>, rejects: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            completed: completed.into_iter().collect(),
            candidates: BTreeMap::new(),
            rejects: rejects.into_iter().collect(),
        }
    }

    pub fn is_completed(&self, path: &Path) -> bool {
        self.completed.contains(path)
    }

    pub fn is_candidate(&self, path: &Path) -> bool {
        self.candidates.contains_key(path)
    }

    /// Rejects match either the full path or the directory name
    pub fn is_rejected(&self, path: &Path) -> bool {
        self.rejects.contains(path)
            || path
                .file_name()
                .is_some_and(|name| self.rejects.contains(Path::new(name)))
    }

    pub fn candidates(&self) -> impl Iterator<Item = &Path> {
        self.candidates.keys().map(PathBuf::as_path)
    }

    pub fn has_candidates(&self) -> bool {
        !self.candidates.is_empty()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Add a newly seen directory; returns `false` if it is already known or
    /// rejected
    pub fn add_candidate(&mut self, path: PathBuf, seen_at: SystemTime) -> bool {
        if self.is_completed(&path) || self.is_candidate(&path) || self.is_rejected(&path) {
            return false;
        }
        self.candidates.insert(path, seen_at);
        true
    }

    fn complete(&mut self, path: &Path) {
        self.candidates.remove(path);
        self.completed.insert(path.to_path_buf());
    }

    fn drop_candidate(&mut self, path: &Path) {
        self.candidates.remove(path);
    }
}

/// Whether anything under `dir` was modified less than `threshold` ago
///
/// An empty directory has no modification time of its own to go by; `floor`
/// (when the scanner first saw it) stands in for it.
pub fn has_recent_activity(dir: &Path, threshold: Duration, floor: SystemTime) -> io::Result<bool> {
    if !dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", dir.display()),
        ));
    }

    let mut latest: Option<SystemTime> = None;
    for entry in walkdir::WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let modified = entry.metadata().map_err(io::Error::from)?.modified()?;
        latest = Some(latest.map_or(modified, |l| l.max(modified)));
    }

    let latest = latest.unwrap_or(floor);
    Ok(match SystemTime::now().duration_since(latest) {
        Ok(elapsed) => elapsed < threshold,
        // modified in the future
        Err(_) => true,
    })
}

/// Whether a failed activity check means the candidate itself is gone,
/// rather than some file inside it removed during the walk
fn candidate_vanished(dir: &Path, error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::NotFound && !dir.is_dir()
}

/// Directories directly under `source_dirs`, resolved
pub fn list_source_subdirs(source_dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for source in source_dirs {
        let entries = match std::fs::read_dir(source) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(source = %source.display(), error = %e, "Cannot read source directory");
                continue;
            },
        };

        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if path.is_dir() {
                found.push(path.canonicalize().unwrap_or(path));
            }
        }
    }
    found.sort();
    found
}

pub struct Registration {
    api: Arc<dyn PipelineApi>,
    sequencer: Arc<Sequencer>,
    config: RegistrationConfig,
}

impl Registration {
    pub fn new(api: Arc<dyn PipelineApi>, sequencer: Arc<Sequencer>, config: RegistrationConfig) -> Self {
        Self {
            api,
            sequencer,
            config,
        }
    }

    /// Initial state: every origin path the API already has counts as completed
    pub async fn load_state(&self) -> PipelineResult<RegistrationState> {
        let completed = self
            .api
            .get_all_batches()
            .await?
            .into_iter()
            .map(|batch| batch.origin_path);

        let state = RegistrationState::new(completed, self.config.rejects.iter().cloned());
        info!(completed = state.completed_count(), "Registration state loaded");
        Ok(state)
    }

    /// Add every unknown directory under the source directories as a candidate
    pub async fn scan(&self, state: &mut RegistrationState) -> PipelineResult<usize> {
        let sources = self.source_dirs();
        let found = run_blocking(move || Ok(list_source_subdirs(&sources))).await?;

        let now = SystemTime::now();
        let added = found
            .into_iter()
            .filter(|path| state.add_candidate(path.clone(), now))
            .inspect(|path| debug!(path = %path.display(), "New candidate"))
            .count();

        if added > 0 {
            info!(added, "Scan found new candidates");
        }
        Ok(added)
    }

    /// Register every candidate that has settled; returns how many were
    /// registered
    ///
    /// A candidate that cannot be evaluated or registered stays a candidate
    /// (unless it vanished) and does not stop the others.
    pub async fn check_candidates(&self, state: &mut RegistrationState) -> usize {
        let threshold = Duration::from_secs(self.config.recency_threshold_secs);
        let pending: Vec<(PathBuf, SystemTime)> = state
            .candidates
            .iter()
            .map(|(path, seen)| (path.clone(), *seen))
            .collect();

        let mut registered = Vec::new();
        let mut vanished = Vec::new();

        for (path, first_seen) in pending {
            let dir = path.clone();
            let recent = tokio::task::spawn_blocking(move || has_recent_activity(&dir, threshold, first_seen)).await;

            match recent {
                Ok(Ok(true)) => debug!(path = %path.display(), "Candidate still active"),
                Ok(Ok(false)) => match self.register_candidate(&path).await {
                    Ok(batch) => {
                        info!(path = %path.display(), batch_id = %batch.id, "Batch registered");
                        registered.push(path);
                    },
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "Registration failed, will retry");
                    },
                },
                Ok(Err(e)) if candidate_vanished(&path, &e) => {
                    warn!(path = %path.display(), "Candidate disappeared");
                    vanished.push(path);
                },
                Ok(Err(e)) => warn!(path = %path.display(), error = %e, "Cannot evaluate candidate"),
                Err(e) => warn!(path = %path.display(), error = %e, "Candidate check aborted"),
            }
        }

        for path in &registered {
            state.complete(path);
        }
        for path in &vanished {
            state.drop_candidate(path);
        }
        registered.len()
    }

    /// Create and start the workflow for one settled directory
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn register_candidate(&self, path: &Path) -> PipelineResult<Batch> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PipelineError::Validation(format!("{} has no directory name", path.display())))?;

        let steps: Vec<&str> = REGISTRATION_STEPS.iter().map(StepKind::as_str).collect();
        let workflow_id = self.sequencer.create(&steps).await?;

        let new_batch = NewBatch {
            name,
            origin_path: path.to_path_buf(),
            workflow_id: workflow_id.to_string(),
        };

        let batch = match self.api.create_batch(&new_batch).await {
            Ok(batch) => batch,
            Err(e) => {
                self.discard_workflow(workflow_id).await;
                return Err(e);
            },
        };

        // The batch record exists from here on; registering the path again
        // would duplicate it, so a workflow that fails to start is left for
        // the operator.
        if let Err(e) = self.start_workflow(workflow_id, &batch.id).await {
            error!(
                %workflow_id,
                batch_id = %batch.id,
                error = %e,
                "Batch registered but its workflow did not start"
            );
        }
        Ok(batch)
    }

    async fn start_workflow(&self, workflow_id: Uuid, batch_id: &str) -> PipelineResult<()> {
        self.sequencer.bind(workflow_id, batch_id).await?;
        self.sequencer.start(workflow_id).await?;
        Ok(())
    }

    /// Scan loop; runs until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> PipelineResult<()> {
        let mut state = self.load_state().await?;
        let wait = Duration::from_secs(self.config.wait_between_scans_secs);
        info!(
            sources = ?self.config.source_dirs,
            wait_secs = wait.as_secs(),
            "Registration scanner started"
        );

        loop {
            if state.has_candidates() {
                self.check_candidates(&mut state).await;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {},
            }

            if !state.has_candidates() {
                if let Err(e) = self.scan(&mut state).await {
                    error!(error = %e, "Scan failed");
                }
            }
        }

        info!("Registration scanner stopped");
        Ok(())
    }

    fn source_dirs(&self) -> Vec<PathBuf> {
        self.config
            .source_dirs
            .iter()
            .map(|dir| dir.canonicalize().unwrap_or_else(|_| dir.clone()))
            .collect()
    }

    async fn discard_workflow(&self, workflow_id: Uuid) {
        if let Err(e) = self.sequencer.delete(workflow_id).await {
            warn!(%workflow_id, error = %e, "Could not discard unregistered workflow");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_state_never_holds_completed_candidates() {
        let mut state = RegistrationState::new(
            [PathBuf::from("/data/run41")],
            [PathBuf::from("scratch"), PathBuf::from("/data/tmp")],
        );
        let now = SystemTime::now();

        assert!(!state.add_candidate(PathBuf::from("/data/run41"), now));
        assert!(!state.add_candidate(PathBuf::from("/data/scratch"), now));
        assert!(!state.add_candidate(PathBuf::from("/data/tmp"), now));
        assert!(state.add_candidate(PathBuf::from("/data/run42"), now));
        assert!(!state.add_candidate(PathBuf::from("/data/run42"), now));

        state.complete(Path::new("/data/run42"));
        assert!(state.is_completed(Path::new("/data/run42")));
        assert!(!state.is_candidate(Path::new("/data/run42")));
        assert!(!state.add_candidate(PathBuf::from("/data/run42"), now));
    }

    #[test]
    fn test_fresh_file_is_recent_activity() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("RTAComplete.txt"), b"").unwrap();

        let floor = SystemTime::now();
        assert!(has_recent_activity(dir.path(), Duration::from_secs(3600), floor).unwrap());
        assert!(!has_recent_activity(dir.path(), Duration::ZERO, floor).unwrap());
    }

    #[test]
    fn test_empty_dir_uses_floor() {
        let dir = tempfile::tempdir().unwrap();
        let threshold = Duration::from_secs(3600);

        assert!(has_recent_activity(dir.path(), threshold, SystemTime::now()).unwrap());

        let long_ago = SystemTime::now() - Duration::from_secs(7200);
        assert!(!has_recent_activity(dir.path(), threshold, long_ago).unwrap());
    }

    #[test]
    fn test_missing_dir_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = has_recent_activity(&dir.path().join("gone"), Duration::ZERO, SystemTime::now())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_file_removed_mid_walk_keeps_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let not_found = io::Error::new(io::ErrorKind::NotFound, "lane1/s1_R1.fastq.gz");

        assert!(!candidate_vanished(dir.path(), &not_found));
        assert!(candidate_vanished(&dir.path().join("gone"), &not_found));

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(!candidate_vanished(&dir.path().join("gone"), &denied));
    }

    #[test]
    fn test_list_source_subdirs_skips_files() {
        let source = tempfile::tempdir().unwrap();
        std::fs::create_dir(source.path().join("run42")).unwrap();
        std::fs::create_dir(source.path().join("run41")).unwrap();
        std::fs::write(source.path().join("notes.txt"), b"").unwrap();

        let root = source.path().canonicalize().unwrap();
        let found = list_source_subdirs(&[source.path().to_path_buf(), PathBuf::from("/nonexistent/source")]);
        assert_eq!(found, vec![root.join("run41"), root.join("run42")]);
    }
}
