use crate::blocking::run_blocking;
use crate::error::{PipelineError, PipelineResult};
use crate::storage::{config::StorageConfig, key_file_name, RemoteStorage, MD5_METADATA_KEY};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{BehaviorVersion, Credentials, Region},
    primitives::ByteStream,
    Client,
};
use runstage_common::checksum::compute_file_checksum;
use runstage_common::types::ChecksumAlgorithm;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

/// S3-compatible [`RemoteStorage`]
#[derive(Clone)]
pub struct S3RemoteStorage {
    client: Client,
    bucket: String,
}

impl S3RemoteStorage {
    pub fn new(config: &StorageConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "runstage-storage",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        info!(bucket = %config.bucket, "Remote storage client initialized");

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Turn an ETag into a digest. Multipart ETags (`<hash>-<parts>`) are not
/// content digests and are rejected.
fn etag_digest(etag: &str) -> Option<String> {
    let trimmed = etag.trim_matches('"');
    (!trimmed.is_empty() && !trimmed.contains('-')).then(|| trimmed.to_lowercase())
}

#[async_trait]
impl RemoteStorage for S3RemoteStorage {
    #[instrument(skip(self))]
    async fn get_hash(&self, path: &str) -> PipelineResult<String> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(PipelineError::storage)?;

        if let Some(digest) = head.metadata().and_then(|m| m.get(MD5_METADATA_KEY)) {
            return Ok(digest.to_lowercase());
        }

        head.e_tag().and_then(etag_digest).ok_or_else(|| {
            PipelineError::Storage(format!("No content digest available for {path}"))
        })
    }

    #[instrument(skip(self))]
    async fn get_size(&self, path: &str) -> PipelineResult<u64> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(PipelineError::storage)?;

        head.content_length()
            .and_then(|len| u64::try_from(len).ok())
            .ok_or_else(|| PipelineError::Storage(format!("No content length for {path}")))
    }

    #[instrument(skip(self))]
    async fn get(&self, source: &str, target_dir: &Path) -> PipelineResult<PathBuf> {
        let target = target_dir.join(key_file_name(source));
        debug!(bucket = %self.bucket, target = %target.display(), "Downloading object");

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(source)
            .send()
            .await
            .map_err(PipelineError::storage)?;

        let mut body = response.body;
        let mut file = tokio::fs::File::create(&target).await?;
        let mut written: u64 = 0;

        while let Some(chunk) = body.try_next().await.map_err(PipelineError::storage)? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        info!(bytes = written, target = %target.display(), "Download complete");
        Ok(target)
    }

    #[instrument(skip(self))]
    async fn put(&self, local: &Path, destination: &str) -> PipelineResult<String> {
        let path = local.to_path_buf();
        let digest =
            run_blocking(move || Ok(compute_file_checksum(&path, ChecksumAlgorithm::Md5)?))
                .await?;

        let body = ByteStream::from_path(local)
            .await
            .map_err(PipelineError::storage)?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(destination)
            .metadata(MD5_METADATA_KEY, &digest)
            .body(body)
            .send()
            .await
            .map_err(PipelineError::storage)?;

        info!(bucket = %self.bucket, key = destination, md5 = %digest, "Upload complete");
        Ok(destination.to_string())
    }
}
