//! Bridge for synchronous filesystem work (tar, hashing, directory walks)

use crate::error::{PipelineError, PipelineResult};

/// Run `work` on the blocking pool. A panic inside `work` becomes a fatal
/// [`PipelineError::Io`].
pub async fn run_blocking<F, T>(work: F) -> PipelineResult<T>
where
    F: FnOnce() -> PipelineResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PipelineError::Io(std::io::Error::other(e)))?
}
