//! Common types used across runstage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Checksum algorithm type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// The algorithm remote storage reports for its objects
    #[default]
    Md5,
    Sha256,
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumAlgorithm::Md5 => write!(f, "md5"),
            ChecksumAlgorithm::Sha256 => write!(f, "sha256"),
        }
    }
}

// ============================================================================
// Pipeline Records
// ============================================================================

/// A sequencing run discovered under a source directory.
///
/// Batches are created once by the registration scanner and then enriched by
/// each pipeline step (`du_size` by inspect, `archive_path` by archive,
/// `stage_path` by stage, `report_id` by report). They are never deleted here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    /// Identifier assigned by the external API
    pub id: String,

    /// Unique name, taken from the source directory name (e.g. "run42")
    pub name: String,

    /// Absolute, resolved source directory
    pub origin_path: PathBuf,

    /// Workflow driving this batch through the pipeline
    #[serde(default)]
    pub workflow_id: Option<String>,

    /// Directory the archive was extracted into
    #[serde(default)]
    pub stage_path: Option<PathBuf>,

    /// Identifier of the last generated QC report
    #[serde(default)]
    pub report_id: Option<String>,

    /// Archive location in remote storage
    #[serde(default)]
    pub archive_path: Option<String>,

    /// Disk usage of the origin directory in bytes
    #[serde(default)]
    pub du_size: Option<u64>,

    /// Number of regular files found by inspect
    #[serde(default)]
    pub num_files: Option<u64>,

    /// Latest pipeline state tag
    #[serde(default)]
    pub state: Option<DatasetState>,
}

/// Payload used to register a new batch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewBatch {
    pub name: String,
    pub origin_path: PathBuf,
    pub workflow_id: String,
}

/// The staging-level view of a batch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dataset {
    pub id: String,
    pub name: String,

    /// Declared type, selects the staging root (e.g. "raw_data")
    #[serde(rename = "type")]
    pub dataset_type: String,

    /// Archive location in remote storage
    pub archive_path: String,
}

/// State tags added to a dataset as it moves through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatasetState {
    Registered,
    Inspected,
    Archived,
    Staged,
    Validated,
    Reported,
}

impl DatasetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetState::Registered => "REGISTERED",
            DatasetState::Inspected => "INSPECTED",
            DatasetState::Archived => "ARCHIVED",
            DatasetState::Staged => "STAGED",
            DatasetState::Validated => "VALIDATED",
            DatasetState::Reported => "REPORTED",
        }
    }
}

impl std::fmt::Display for DatasetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Progress
// ============================================================================

/// Snapshot of an in-flight transfer or tool run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressRecord {
    /// What is being tracked (e.g. "remote_get")
    pub name: String,

    /// Units processed so far
    pub done: u64,

    /// Total units, when known
    pub total: Option<u64>,

    /// `done / total`, absent when the total is unknown or zero
    pub percent_done: Option<f64>,

    /// Unit tag, "bytes" for file based progress
    pub units: String,

    pub recorded_at: DateTime<Utc>,
}

impl ProgressRecord {
    /// Byte based progress record
    pub fn bytes(name: impl Into<String>, done: u64, total: Option<u64>) -> Self {
        let percent_done = match total {
            Some(total) if total > 0 => Some(done as f64 / total as f64),
            _ => None,
        };

        Self {
            name: name.into(),
            done,
            total,
            percent_done,
            units: "bytes".to_string(),
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_progress_fraction() {
        let record = ProgressRecord::bytes("remote_get", 25, Some(100));
        assert_eq!(record.percent_done, Some(0.25));
        assert_eq!(record.units, "bytes");

        assert_eq!(ProgressRecord::bytes("x", 10, None).percent_done, None);
        assert_eq!(ProgressRecord::bytes("x", 10, Some(0)).percent_done, None);
    }

    #[test]
    fn test_batch_deserializes_minimal_record() {
        let batch: Batch = serde_json::from_value(json!({
            "id": "b-1",
            "name": "run42",
            "origin_path": "/data/run42",
            "state": "STAGED"
        }))
        .unwrap();

        assert_eq!(batch.name, "run42");
        assert_eq!(batch.state, Some(DatasetState::Staged));
        assert!(batch.stage_path.is_none());
        assert!(batch.report_id.is_none());
    }

    #[test]
    fn test_dataset_type_field_name() {
        let dataset: Dataset = serde_json::from_value(json!({
            "id": "d-1",
            "name": "run42",
            "type": "RAW_DATA",
            "archive_path": "archive/run42.tar"
        }))
        .unwrap();
        assert_eq!(dataset.dataset_type, "RAW_DATA");
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(serde_json::to_value(DatasetState::Staged).unwrap(), json!("STAGED"));
        assert_eq!(DatasetState::Validated.to_string(), "VALIDATED");
    }
}
