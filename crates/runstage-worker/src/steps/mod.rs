//! Pipeline step handlers
//!
//! Each step kind has exactly one handler, registered once at startup in a
//! [`StepRegistry`]. A handler receives only a correlation id (the batch id,
//! which doubles as the dataset id) and fetches the rest of its context from
//! the external API.

pub mod archive;
pub mod inspect;
pub mod report;
pub mod stage;
pub mod validate;

use crate::api::PipelineApi;
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult, StepResult};
use crate::progress::ProgressSink;
use crate::storage::RemoteStorage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

pub use archive::ArchiveStep;
pub use inspect::InspectStep;
pub use report::ReportStep;
pub use stage::StageStep;
pub use validate::ValidateStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Inspect,
    Archive,
    Stage,
    Validate,
    Report,
}

impl StepKind {
    pub const ALL: [StepKind; 5] = [
        StepKind::Inspect,
        StepKind::Archive,
        StepKind::Stage,
        StepKind::Validate,
        StepKind::Report,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Inspect => "inspect",
            StepKind::Archive => "archive",
            StepKind::Stage => "stage",
            StepKind::Validate => "validate",
            StepKind::Report => "report",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = PipelineError;

    /// Accepts `stage`, `STAGE`, `stage_dataset` and dotted task paths such
    /// as `workers.stage.stage_batch`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        let last = lowered.rsplit('.').next().unwrap_or(lowered.as_str());
        let base = last
            .strip_suffix("_batch")
            .or_else(|| last.strip_suffix("_dataset"))
            .unwrap_or(last);

        StepKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == base)
            .ok_or_else(|| PipelineError::UnknownStep(s.to_string()))
    }
}

/// Everything a handler gets for one execution
#[derive(Clone)]
pub struct StepContext {
    /// Absent when a step is run by hand outside any workflow
    pub workflow_id: Option<Uuid>,
    pub step_index: usize,
    pub correlation_id: String,
    /// Output of the previous step, if any
    pub input: Option<Value>,
    /// 1-based attempt number
    pub attempt: u32,
    pub progress: Arc<dyn ProgressSink>,
}

impl StepContext {
    /// Context for a one-off run outside any workflow
    pub fn standalone(correlation_id: impl Into<String>, progress: Arc<dyn ProgressSink>) -> Self {
        Self {
            workflow_id: None,
            step_index: 0,
            correlation_id: correlation_id.into(),
            input: None,
            attempt: 1,
            progress,
        }
    }
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    fn kind(&self) -> StepKind;

    async fn run(&self, ctx: StepContext) -> StepResult;
}

/// Shared collaborators of the built-in handlers
#[derive(Clone)]
pub struct StepDeps {
    pub api: Arc<dyn PipelineApi>,
    pub storage: Arc<dyn RemoteStorage>,
    pub config: Arc<Config>,
}

/// Step kind to handler map, resolved once at startup
#[derive(Clone, Default)]
pub struct StepRegistry {
    handlers: HashMap<StepKind, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in handler
    pub fn standard(deps: StepDeps) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(InspectStep::new(deps.clone())));
        registry.register(Arc::new(ArchiveStep::new(deps.clone())));
        registry.register(Arc::new(StageStep::new(deps.clone())));
        registry.register(Arc::new(ValidateStep::new(deps.clone())));
        registry.register(Arc::new(ReportStep::new(deps)));
        registry
    }

    /// Register a handler, replacing any previous one for the same kind
    pub fn register(&mut self, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: StepKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Parse a step name and make sure a handler exists for it
    pub fn resolve(&self, name: &str) -> PipelineResult<StepKind> {
        let kind: StepKind = name.parse()?;
        if self.contains(kind) {
            Ok(kind)
        } else {
            Err(PipelineError::UnknownStep(name.to_string()))
        }
    }

    pub fn kinds(&self) -> Vec<StepKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

/// Standard step output: the correlation id plus step-specific fields
pub(crate) fn step_output(id: &str, mut fields: Value) -> Value {
    if let Value::Object(map) = &mut fields {
        map.insert("id".to_string(), Value::String(id.to_string()));
    }
    fields
}
