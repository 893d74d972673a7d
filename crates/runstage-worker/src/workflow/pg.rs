//! PostgreSQL workflow store

use crate::error::{PipelineError, PipelineResult};
use crate::steps::StepKind;
use crate::workflow::store::WorkflowStore;
use crate::workflow::types::{Workflow, WorkflowStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const MAX_CONNECTIONS: u32 = 5;
const CONNECT_TIMEOUT_SECS: u64 = 10;

const SELECT_COLUMNS: &str = r#"
    SELECT id, steps, current_step, status, correlation_id, in_flight,
           last_output, last_error, progress, created_at, updated_at
    FROM workflows
"#;

#[derive(Debug, sqlx::FromRow)]
struct WorkflowRow {
    id: Uuid,
    steps: Vec<String>,
    current_step: i32,
    status: String,
    correlation_id: Option<String>,
    in_flight: bool,
    last_output: Option<serde_json::Value>,
    last_error: Option<String>,
    progress: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = PipelineError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        let steps = row
            .steps
            .iter()
            .map(|s| s.parse::<StepKind>())
            .collect::<PipelineResult<Vec<_>>>()?;
        let status = row
            .status
            .parse::<WorkflowStatus>()
            .map_err(PipelineError::Workflow)?;
        let current_step = usize::try_from(row.current_step)
            .map_err(|_| PipelineError::Workflow(format!("Negative step index {}", row.current_step)))?;
        let progress = row.progress.map(serde_json::from_value).transpose()?;

        Ok(Workflow {
            id: row.id,
            steps,
            current_step,
            status,
            correlation_id: row.correlation_id,
            in_flight: row.in_flight,
            last_output: row.last_output,
            last_error: row.last_error,
            progress,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn step_index(workflow: &Workflow) -> PipelineResult<i32> {
    i32::try_from(workflow.current_step)
        .map_err(|_| PipelineError::Workflow(format!("Step index {} out of range", workflow.current_step)))
}

/// Workflows kept in the `workflows` table
#[derive(Clone)]
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply pending migrations
    pub async fn connect(database_url: &str) -> PipelineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .connect(database_url)
            .await?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(|e| PipelineError::Database(e.into()))?;

        info!("Workflow store migrations completed");
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn insert(&self, workflow: &Workflow) -> PipelineResult<()> {
        let steps: Vec<String> = workflow.steps.iter().map(|s| s.as_str().to_string()).collect();
        let progress = workflow.progress.as_ref().map(serde_json::to_value).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO workflows (
                id, steps, current_step, status, correlation_id, in_flight,
                last_output, last_error, progress, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(workflow.id)
        .bind(&steps)
        .bind(step_index(workflow)?)
        .bind(workflow.status.as_str())
        .bind(&workflow.correlation_id)
        .bind(workflow.in_flight)
        .bind(&workflow.last_output)
        .bind(&workflow.last_error)
        .bind(progress)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> PipelineResult<Option<Workflow>> {
        let row: Option<WorkflowRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Workflow::try_from).transpose()
    }

    async fn update(&self, workflow: &Workflow) -> PipelineResult<()> {
        let progress = workflow.progress.as_ref().map(serde_json::to_value).transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET current_step = $2,
                status = $3,
                correlation_id = $4,
                in_flight = $5,
                last_output = $6,
                last_error = $7,
                progress = $8,
                updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(workflow.id)
        .bind(step_index(workflow)?)
        .bind(workflow.status.as_str())
        .bind(&workflow.correlation_id)
        .bind(workflow.in_flight)
        .bind(&workflow.last_output)
        .bind(&workflow.last_error)
        .bind(progress)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::WorkflowNotFound(workflow.id));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> PipelineResult<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> PipelineResult<Vec<Workflow>> {
        let rows: Vec<WorkflowRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY created_at"))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Workflow::try_from).collect()
    }

    async fn list_by_status(&self, status: WorkflowStatus) -> PipelineResult<Vec<Workflow>> {
        let rows: Vec<WorkflowRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE status = $1 ORDER BY created_at"))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(Workflow::try_from).collect()
    }
}
