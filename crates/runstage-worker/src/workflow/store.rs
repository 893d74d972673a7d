//! Workflow persistence

use crate::error::{PipelineError, PipelineResult};
use crate::workflow::types::{Workflow, WorkflowStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn insert(&self, workflow: &Workflow) -> PipelineResult<()>;

    async fn get(&self, id: Uuid) -> PipelineResult<Option<Workflow>>;

    /// Replace a stored workflow; fails with `WorkflowNotFound` if absent
    async fn update(&self, workflow: &Workflow) -> PipelineResult<()>;

    /// Returns whether anything was deleted
    async fn delete(&self, id: Uuid) -> PipelineResult<bool>;

    /// Oldest first
    async fn list(&self) -> PipelineResult<Vec<Workflow>>;

    async fn list_by_status(&self, status: WorkflowStatus) -> PipelineResult<Vec<Workflow>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|wf| wf.status == status)
            .collect())
    }
}

/// Process-local store; workflows do not survive a restart
#[derive(Default)]
pub struct MemoryWorkflowStore {
    workflows: RwLock<HashMap<Uuid, Workflow>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn insert(&self, workflow: &Workflow) -> PipelineResult<()> {
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&workflow.id) {
            return Err(PipelineError::Workflow(format!(
                "Workflow {} already exists",
                workflow.id
            )));
        }
        workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> PipelineResult<Option<Workflow>> {
        Ok(self.workflows.read().await.get(&id).cloned())
    }

    async fn update(&self, workflow: &Workflow) -> PipelineResult<()> {
        match self.workflows.write().await.get_mut(&workflow.id) {
            Some(slot) => {
                *slot = workflow.clone();
                Ok(())
            },
            None => Err(PipelineError::WorkflowNotFound(workflow.id)),
        }
    }

    async fn delete(&self, id: Uuid) -> PipelineResult<bool> {
        Ok(self.workflows.write().await.remove(&id).is_some())
    }

    async fn list(&self) -> PipelineResult<Vec<Workflow>> {
        let mut all: Vec<Workflow> = self.workflows.read().await.values().cloned().collect();
        all.sort_by_key(|wf| wf.created_at);
        Ok(all)
    }
}
