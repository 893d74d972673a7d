//! Configuration management
//!
//! Layering, lowest precedence first:
//! 1. [`Config::default`]
//! 2. an optional TOML file named by `RUNSTAGE_CONFIG`, deep-merged over the
//!    defaults (tables merge key by key, everything else replaces)
//! 3. environment variables (`RUNSTAGE_*`, `S3_*`, `DATABASE_URL`), with a
//!    `.env` file loaded first when present

use crate::storage::config::StorageConfig;
use anyhow::Context;
use runstage_common::{merge::merge, size::parse_size};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// Environment variable naming the TOML configuration file.
pub const CONFIG_PATH_ENV: &str = "RUNSTAGE_CONFIG";

pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 8700;

pub const DEFAULT_API_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 60;

pub const DEFAULT_SCRATCH_DIR: &str = "/tmp/runstage/scratch";
pub const DEFAULT_QC_DIR: &str = "/tmp/runstage/qc";
pub const DEFAULT_STAGE_TYPE: &str = "raw_data";
pub const DEFAULT_STAGE_DIR: &str = "/tmp/runstage/stage/raw_data";
pub const DEFAULT_ARCHIVE_PREFIX: &str = "archive";

/// Headroom kept free on the scratch filesystem on top of the archive size.
pub const DEFAULT_SCRATCH_RESERVE: &str = "10G";

/// A directory with any file modified within this window is still being written.
pub const DEFAULT_RECENCY_THRESHOLD_SECS: u64 = 3600;
pub const DEFAULT_WAIT_BETWEEN_SCANS_SECS: u64 = 300;

pub const DEFAULT_QUALITY_TOOL: &str = "fastqc";
pub const DEFAULT_QUALITY_THREADS: u32 = 8;
pub const DEFAULT_AGGREGATE_TOOL: &str = "multiqc";
pub const DEFAULT_INPUT_SUFFIX: &str = ".fastq.gz";
pub const DEFAULT_REPORT_FILE_NAME: &str = "multiqc_report.html";

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;
pub const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 5;

// ============================================================================
// Sections
// ============================================================================

/// Worker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub paths: PathsConfig,
    pub registration: RegistrationConfig,
    pub report: ReportConfig,
    pub queue: QueueConfig,
    pub server: ServerConfig,

    /// Workflows are kept in PostgreSQL when set, in memory otherwise
    pub database_url: Option<String>,
}

/// External API the batch and dataset records live in
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub url: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Transient archives, one `<name>.tar` per dataset
    pub scratch: PathBuf,

    /// Staging root per dataset type (lowercase type name -> directory)
    pub stage_roots: BTreeMap<String, PathBuf>,

    /// QC output root, one `<batch>/qc` directory per batch
    pub qc: PathBuf,

    /// Key prefix archives are uploaded under
    pub archive_prefix: String,

    /// Human size, e.g. "10G"
    pub scratch_reserve: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub enabled: bool,
    pub source_dirs: Vec<PathBuf>,
    pub rejects: Vec<PathBuf>,
    pub recency_threshold_secs: u64,
    pub wait_between_scans_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub quality_tool: String,
    pub quality_threads: u32,
    pub aggregate_tool: String,
    pub input_suffix: String,
    pub report_file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub progress_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_API_URL.to_string(),
            token: None,
            timeout_secs: DEFAULT_API_TIMEOUT_SECS,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            scratch: PathBuf::from(DEFAULT_SCRATCH_DIR),
            stage_roots: BTreeMap::from([(
                DEFAULT_STAGE_TYPE.to_string(),
                PathBuf::from(DEFAULT_STAGE_DIR),
            )]),
            qc: PathBuf::from(DEFAULT_QC_DIR),
            archive_prefix: DEFAULT_ARCHIVE_PREFIX.to_string(),
            scratch_reserve: DEFAULT_SCRATCH_RESERVE.to_string(),
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            source_dirs: Vec::new(),
            rejects: Vec::new(),
            recency_threshold_secs: DEFAULT_RECENCY_THRESHOLD_SECS,
            wait_between_scans_secs: DEFAULT_WAIT_BETWEEN_SCANS_SECS,
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            quality_tool: DEFAULT_QUALITY_TOOL.to_string(),
            quality_threads: DEFAULT_QUALITY_THREADS,
            aggregate_tool: DEFAULT_AGGREGATE_TOOL.to_string(),
            input_suffix: DEFAULT_INPUT_SUFFIX.to_string(),
            report_file_name: DEFAULT_REPORT_FILE_NAME.to_string(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            progress_interval_secs: DEFAULT_PROGRESS_INTERVAL_SECS,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_SERVER_HOST.to_string(),
            port: DEFAULT_SERVER_PORT,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl Config {
    /// Load configuration from defaults, the optional TOML file and environment
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let file = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        let mut config = Self::from_file(file.as_deref())?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Defaults with the TOML file at `path` merged over them
    pub fn from_file(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut value = serde_json::to_value(Self::default())?;

        if let Some(path) = path {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let mut table: toml::Value = toml::from_str(&text)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            lowercase_stage_root_keys(&mut table);
            merge(&mut value, serde_json::to_value(table)?);
        }

        serde_json::from_value(value).context("Invalid configuration")
    }

    /// Override fields from environment-style variables
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(url) = lookup("RUNSTAGE_API_URL") {
            self.api.url = url;
        }
        if let Some(token) = lookup("RUNSTAGE_API_TOKEN") {
            self.api.token = Some(token);
        }

        if let Some(dir) = lookup("RUNSTAGE_SCRATCH_DIR") {
            self.paths.scratch = PathBuf::from(dir);
        }
        if let Some(roots) = lookup("RUNSTAGE_STAGE_ROOTS") {
            self.paths.stage_roots = parse_stage_roots(&roots)?;
        }
        if let Some(dir) = lookup("RUNSTAGE_QC_DIR") {
            self.paths.qc = PathBuf::from(dir);
        }
        if let Some(prefix) = lookup("RUNSTAGE_ARCHIVE_PREFIX") {
            self.paths.archive_prefix = prefix;
        }
        if let Some(reserve) = lookup("RUNSTAGE_SCRATCH_RESERVE") {
            self.paths.scratch_reserve = reserve;
        }

        if let Some(dirs) = lookup("RUNSTAGE_SOURCE_DIRS") {
            self.registration.source_dirs = split_list(&dirs).map(PathBuf::from).collect();
        }
        if let Some(rejects) = lookup("RUNSTAGE_REJECTS") {
            self.registration.rejects = split_list(&rejects).map(PathBuf::from).collect();
        }
        parse_var(&lookup, "RUNSTAGE_REGISTRATION_ENABLED", &mut self.registration.enabled)?;

        parse_var(&lookup, "RUNSTAGE_WORKERS", &mut self.queue.workers)?;
        parse_var(&lookup, "RUNSTAGE_MAX_RETRIES", &mut self.queue.max_retries)?;
        parse_var(&lookup, "RUNSTAGE_RETRY_DELAY_SECS", &mut self.queue.retry_delay_secs)?;

        if let Some(host) = lookup("RUNSTAGE_HOST") {
            self.server.host = host;
        }
        parse_var(&lookup, "RUNSTAGE_PORT", &mut self.server.port)?;

        if let Some(url) = lookup("DATABASE_URL").filter(|u| !u.trim().is_empty()) {
            self.database_url = Some(url);
        }

        self.storage.apply_env(&lookup);
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api.url.trim().is_empty() {
            anyhow::bail!("API url cannot be empty");
        }

        if self.paths.stage_roots.is_empty() {
            anyhow::bail!("At least one staging root must be configured");
        }

        parse_size(&self.paths.scratch_reserve).with_context(|| {
            format!("Invalid scratch reserve {:?}", self.paths.scratch_reserve)
        })?;

        if self.queue.workers == 0 {
            anyhow::bail!("Worker count must be greater than 0");
        }

        if self.report.quality_threads == 0 {
            anyhow::bail!("Quality tool thread count must be greater than 0");
        }

        if self.report.report_file_name.trim().is_empty() {
            anyhow::bail!("Report file name cannot be empty");
        }

        if self.registration.enabled && self.registration.source_dirs.is_empty() {
            tracing::warn!("Registration is enabled but no source directories are configured");
        }

        Ok(())
    }

    /// Staging root for a dataset type; types are matched case-insensitively
    pub fn stage_root(&self, dataset_type: &str) -> Option<&Path> {
        self.paths
            .stage_roots
            .get(&dataset_type.to_lowercase())
            .map(PathBuf::as_path)
    }

    pub fn scratch_reserve_bytes(&self) -> u64 {
        parse_size(&self.paths.scratch_reserve).unwrap_or_default()
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.queue.progress_interval_secs)
    }

    /// Copy safe to print
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.storage = self.storage.redacted();
        if copy.api.token.is_some() {
            copy.api.token = Some("***".to_string());
        }
        if let Some(url) = copy.database_url.as_mut() {
            if let Some((scheme, rest)) = url.split_once("://") {
                if let Some((_, host)) = rest.rsplit_once('@') {
                    *url = format!("{scheme}://***@{host}");
                }
            }
        }
        copy
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> anyhow::Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value {raw:?} for {key}: {e}"))?;
    }
    Ok(())
}

/// Dataset types are looked up lowercased
fn lowercase_stage_root_keys(table: &mut toml::Value) {
    let roots = table
        .get_mut("paths")
        .and_then(|paths| paths.get_mut("stage_roots"))
        .and_then(toml::Value::as_table_mut);

    if let Some(roots) = roots {
        let entries = std::mem::take(roots);
        *roots = entries
            .into_iter()
            .map(|(kind, path)| (kind.to_lowercase(), path))
            .collect();
    }
}

/// Parse `type=path,type=path`
fn parse_stage_roots(value: &str) -> anyhow::Result<BTreeMap<String, PathBuf>> {
    split_list(value)
        .map(|pair| {
            let (kind, path) = pair
                .split_once('=')
                .with_context(|| format!("Expected type=path in staging roots, got {pair:?}"))?;
            Ok::<_, anyhow::Error>((kind.trim().to_lowercase(), PathBuf::from(path.trim())))
        })
        .collect()
}
