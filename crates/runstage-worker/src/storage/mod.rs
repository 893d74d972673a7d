//! Remote archive storage
//!
//! The remote store is the reference for archive integrity: its reported
//! digest is trusted without reading the object back.

pub mod config;
pub mod s3;

pub use s3::S3RemoteStorage;

use crate::error::PipelineResult;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Object metadata key holding the uploaded file's MD5
pub const MD5_METADATA_KEY: &str = "md5";

/// Idempotent, safely retryable archive store
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Hex MD5 digest of the object at `path`
    async fn get_hash(&self, path: &str) -> PipelineResult<String>;

    async fn get_size(&self, path: &str) -> PipelineResult<u64>;

    /// Download `source` into `target_dir`, keeping its file name
    ///
    /// Returns the local path written to.
    async fn get(&self, source: &str, target_dir: &Path) -> PipelineResult<PathBuf>;

    /// Upload `local` to `destination`, returning the stored key
    async fn put(&self, local: &Path, destination: &str) -> PipelineResult<String>;
}

/// Last path segment of an object key
pub fn key_file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
