//! Runstage Worker Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Moves sequencing runs from the instrument's source directories through
//! the staging pipeline.
//!
//! # Overview
//!
//! - **Registration**: [`register::Registration`] turns settled source
//!   directories into batches with a running workflow
//! - **Workflows**: [`workflow::Sequencer`] dispatches the steps of a workflow
//!   strictly in order; [`workflow::WorkerPool`] runs them with retries
//! - **Steps**: inspect, archive, stage, validate and report handlers in
//!   [`steps`]
//! - **Progress**: [`progress::ProgressTracker`] polls long transfers and
//!   tool runs in the background
//! - **Collaborators**: the external [`api::PipelineApi`] holding batch and
//!   dataset records, and [`storage::RemoteStorage`] holding archives
//! - **Control API**: axum routes to inspect, pause, resume and retry
//!   workflows
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use runstage_worker::steps::{StepDeps, StepRegistry};
//! use runstage_worker::workflow::{LocalQueue, MemoryWorkflowStore, Sequencer};
//!
//! # async fn example(deps: StepDeps) -> runstage_worker::error::PipelineResult<()> {
//! let registry = Arc::new(StepRegistry::standard(deps));
//! let (queue, _receiver) = LocalQueue::new();
//! let sequencer = Sequencer::new(
//!     Arc::new(MemoryWorkflowStore::new()),
//!     Arc::new(queue),
//!     registry,
//! );
//! let id = sequencer.create(&["inspect", "archive", "stage", "validate"]).await?;
//! sequencer.bind(id, "batch-1").await?;
//! sequencer.start(id).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod blocking;
pub mod config;
pub mod error;
pub mod progress;
pub mod register;
pub mod steps;
pub mod storage;
pub mod workflow;

// Re-export commonly used types
pub use config::Config;
pub use error::{PipelineError, PipelineResult, StepError, StepResult};
