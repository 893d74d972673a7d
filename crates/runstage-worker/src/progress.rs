//! Progress reporting for long-running steps
//!
//! A [`ProgressTracker`] is a background poller tied to the lifetime of the
//! operation it observes. It is started before a transfer, extraction or tool
//! run and is stopped on every exit path: explicitly through
//! [`ProgressTracker::stop`], or by `Drop` when the surrounding future errors
//! out or is cancelled.
//!
//! Polls only read filesystem metadata. A failing (or panicking) poll is
//! logged and the poller keeps going; it never affects the observed work.

use async_trait::async_trait;
use futures::FutureExt;
use runstage_common::types::ProgressRecord;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receiver of progress records for one running step
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, record: ProgressRecord) -> anyhow::Result<()>;
}

/// Discards every record
pub struct NullProgress;

#[async_trait]
impl ProgressSink for NullProgress {
    async fn report(&self, _record: ProgressRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes records to the log; used when a step runs outside a workflow
pub struct LogProgress;

#[async_trait]
impl ProgressSink for LogProgress {
    async fn report(&self, record: ProgressRecord) -> anyhow::Result<()> {
        info!(
            name = %record.name,
            done = record.done,
            total = ?record.total,
            percent_done = ?record.percent_done,
            "Progress"
        );
        Ok(())
    }
}

/// Handle to a running poller
pub struct ProgressTracker {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProgressTracker {
    /// Spawn a poller calling `poll` every `interval`, first after one interval
    pub fn start<F, Fut>(interval: Duration, mut poll: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match AssertUnwindSafe(poll()).catch_unwind().await {
                            Ok(Ok(())) => {},
                            Ok(Err(e)) => warn!(error = %e, "Progress poll failed"),
                            Err(_) => warn!("Progress poll panicked"),
                        }
                    }
                }
            }
            debug!("Progress poller stopped");
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Signal the poller and wait for it to exit
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Progress poller did not shut down cleanly");
            }
        }
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Run `work` with a poller alongside it
pub async fn track_progress<F, Fut, W, T>(interval: Duration, poll: F, work: W) -> T
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    W: Future<Output = T>,
{
    let tracker = ProgressTracker::start(interval, poll);
    let output = work.await;
    tracker.stop().await;
    output
}

/// Report the size of a (possibly not yet created) file against `total`
pub async fn file_progress(
    sink: Arc<dyn ProgressSink>,
    path: PathBuf,
    total: Option<u64>,
    name: &'static str,
) -> anyhow::Result<()> {
    let done = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };

    sink.report(ProgressRecord::bytes(name, done, total)).await
}

/// Report the apparent size of everything under `dir` against `total`
pub async fn dir_progress(
    sink: Arc<dyn ProgressSink>,
    dir: PathBuf,
    total: Option<u64>,
    name: &'static str,
) -> anyhow::Result<()> {
    let done = tokio::task::spawn_blocking(move || apparent_size(&dir)).await?;
    sink.report(ProgressRecord::bytes(name, done, total)).await
}

/// Sum of regular file sizes under `dir`; unreadable entries are skipped
pub fn apparent_size(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}
