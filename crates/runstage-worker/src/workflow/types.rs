//! Workflow records

use crate::steps::StepKind;
use chrono::{DateTime, Utc};
use runstage_common::types::ProgressRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Created, not started yet
    Created,
    Running,
    /// Step completions are recorded but nothing new is dispatched
    Paused,
    /// Parked at `current_step` after a fatal error or exhausted retries
    Failed,
    Completed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Created => "created",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(WorkflowStatus::Created),
            "running" => Ok(WorkflowStatus::Running),
            "paused" => Ok(WorkflowStatus::Paused),
            "failed" => Ok(WorkflowStatus::Failed),
            "completed" => Ok(WorkflowStatus::Completed),
            other => Err(format!("Unknown workflow status: {other}")),
        }
    }
}

/// One workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub steps: Vec<StepKind>,
    /// Index into `steps` of the step being run (or parked at)
    pub current_step: usize,
    pub status: WorkflowStatus,
    /// Batch / dataset id handed to every step
    pub correlation_id: Option<String>,
    /// A task for `current_step` has been dispatched and not yet finished
    pub in_flight: bool,
    pub last_output: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub progress: Option<ProgressRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(steps: Vec<StepKind>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            steps,
            current_step: 0,
            status: WorkflowStatus::Created,
            correlation_id: None,
            in_flight: false,
            last_output: None,
            last_error: None,
            progress: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn current(&self) -> Option<StepKind> {
        self.steps.get(self.current_step).copied()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Unit of work handed to the task queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTask {
    pub workflow_id: Uuid,
    pub step_index: usize,
    pub step: StepKind,
    pub correlation_id: String,
    /// Output of the previous step
    pub input: Option<serde_json::Value>,
}
