//! External API holding batch and dataset records
//!
//! Steps receive only a correlation id and fetch everything else through
//! [`PipelineApi`]. Every failure is reported as a retryable
//! [`PipelineError`](crate::error::PipelineError).

pub mod client;
pub mod endpoints;

pub use client::HttpPipelineApi;

use crate::error::PipelineResult;
use async_trait::async_trait;
use runstage_common::types::{Batch, Dataset, DatasetState, NewBatch};
use serde_json::Value;
use std::path::Path;

#[async_trait]
pub trait PipelineApi: Send + Sync {
    async fn get_batch(&self, id: &str) -> PipelineResult<Batch>;

    async fn get_dataset(&self, id: &str) -> PipelineResult<Dataset>;

    /// Partial update; only the fields present in `fields` change
    async fn update_batch(&self, id: &str, fields: Value) -> PipelineResult<()>;

    async fn add_state_to_dataset(&self, id: &str, state: DatasetState) -> PipelineResult<()>;

    async fn upload_report(&self, id: &str, report: &Path) -> PipelineResult<()>;

    async fn create_batch(&self, batch: &NewBatch) -> PipelineResult<Batch>;

    async fn get_all_batches(&self) -> PipelineResult<Vec<Batch>>;
}
