//! Pipeline error types
//!
//! Every failure a step can hit is a [`PipelineError`]. Whether it is worth
//! repeating the step is decided here, in one place, by
//! [`PipelineError::is_retryable`]; step handlers wrap their errors into a
//! [`StepError`] and the worker pool owns the retry loop.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use runstage_common::RunstageError;
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for pipeline operations
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Output of one step execution, passed as input to the next step
pub type StepResult = std::result::Result<serde_json::Value, StepError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// The external API answered with a non-success status
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote storage error: {0}")]
    Storage(String),

    /// Local copy does not match the remote reference digest
    #[error("Integrity error for {}: expected {expected}, got {actual}", path.display())]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "Insufficient space in {}: {required} bytes required, {available} available",
        path.display()
    )]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// A lifecycle operation that is not allowed in the workflow's current status
    #[error("Invalid workflow transition: {0}")]
    Workflow(String),

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Task queue error: {0}")]
    Queue(String),

    /// The step's task panicked or was cancelled
    #[error("Step task aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Common(#[from] RunstageError),
}

impl PipelineError {
    /// Whether re-running the whole step may succeed.
    ///
    /// Remote calls, integrity mismatches and external tool failures are
    /// retryable. Local filesystem, configuration and validation failures are
    /// surfaced to the operator unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Api { .. }
            | PipelineError::Http(_)
            | PipelineError::Storage(_)
            | PipelineError::Integrity { .. }
            | PipelineError::Database(_) => true,
            PipelineError::Common(inner) => inner.is_retryable(),
            PipelineError::Io(_)
            | PipelineError::Serialization(_)
            | PipelineError::Config(_)
            | PipelineError::InsufficientSpace { .. }
            | PipelineError::Validation(_)
            | PipelineError::WorkflowNotFound(_)
            | PipelineError::Workflow(_)
            | PipelineError::UnknownStep(_)
            | PipelineError::Queue(_)
            | PipelineError::Aborted(_) => false,
        }
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        PipelineError::Storage(err.to_string())
    }
}

/// Typed outcome of a failed step
#[derive(Error, Debug)]
pub enum StepError {
    #[error("{0}")]
    Retryable(PipelineError),

    #[error("{0}")]
    Fatal(PipelineError),
}

impl StepError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Retryable(_))
    }

    pub fn into_inner(self) -> PipelineError {
        match self {
            StepError::Retryable(err) | StepError::Fatal(err) => err,
        }
    }
}

impl From<PipelineError> for StepError {
    fn from(err: PipelineError) -> Self {
        if err.is_retryable() {
            StepError::Retryable(err)
        } else {
            StepError::Fatal(err)
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = match self {
            PipelineError::WorkflowNotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::Workflow(_) => StatusCode::CONFLICT,
            PipelineError::UnknownStep(_) | PipelineError::Validation(_) => {
                StatusCode::BAD_REQUEST
            },
            ref other => {
                tracing::error!(error = %other, "Workflow API request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            },
        };

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}
