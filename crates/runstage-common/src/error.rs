//! Error types for runstage utilities

use thiserror::Error;

/// Result type alias for runstage utility operations
pub type Result<T> = std::result::Result<T, RunstageError>;

/// Error raised by the leaf utilities (checksums, processes, sizes)
#[derive(Error, Debug)]
pub enum RunstageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A child process exited unsuccessfully. Both output streams are kept
    /// so the failure carries its own diagnostics.
    #[error("Command `{command}` failed with status {status:?}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    Command {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl RunstageError {
    /// Whether repeating the failed operation may succeed.
    ///
    /// Tool failures are retryable; local I/O, configuration and parse
    /// failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RunstageError::Command { .. })
    }
}
