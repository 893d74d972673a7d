use serde::{Deserialize, Serialize};

pub const DEFAULT_S3_REGION: &str = "us-east-1";
pub const DEFAULT_S3_BUCKET: &str = "runstage-archive";

/// Connection settings for the S3-compatible archive store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: DEFAULT_S3_REGION.to_string(),
            bucket: DEFAULT_S3_BUCKET.to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: false,
        }
    }
}

impl StorageConfig {
    /// Apply `S3_*` overrides (falling back to the standard `AWS_*` key names)
    pub fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup("S3_ENDPOINT") {
            self.endpoint = Some(endpoint);
        }
        if let Some(region) = lookup("S3_REGION").or_else(|| lookup("AWS_REGION")) {
            self.region = region;
        }
        if let Some(bucket) = lookup("S3_BUCKET") {
            self.bucket = bucket;
        }
        if let Some(key) = lookup("S3_ACCESS_KEY").or_else(|| lookup("AWS_ACCESS_KEY_ID")) {
            self.access_key = key;
        }
        if let Some(secret) =
            lookup("S3_SECRET_KEY").or_else(|| lookup("AWS_SECRET_ACCESS_KEY"))
        {
            self.secret_key = secret;
        }
        if let Some(path_style) = lookup("S3_PATH_STYLE").and_then(|v| v.parse().ok()) {
            self.path_style = path_style;
        }
    }

    /// MinIO-style local endpoint with path-style addressing
    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            bucket: bucket.into(),
            path_style: true,
            ..Self::default()
        }
    }

    /// Copy safe to print: credentials are masked
    pub fn redacted(&self) -> Self {
        Self {
            access_key: "***".to_string(),
            secret_key: "***".to_string(),
            ..self.clone()
        }
    }
}
