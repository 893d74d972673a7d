//! Workflow routes
//!
//! Operator endpoints for inspecting workflows and moving halted ones along.
//! Workflows are created by the registration scanner, not over HTTP.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::sequencer::Sequencer;
use super::types::{Workflow, WorkflowStatus};
use crate::error::PipelineResult;

#[derive(Debug, Default, Deserialize)]
pub struct ListWorkflowsQuery {
    pub status: Option<WorkflowStatus>,
}

/// Create workflow routes
pub fn workflow_routes() -> Router<Arc<Sequencer>> {
    Router::new()
        .route("/health", get(health))
        .route("/workflows", get(list_workflows))
        .route("/workflows/:id", get(get_workflow).delete(delete_workflow))
        .route("/workflows/:id/pause", post(pause_workflow))
        .route("/workflows/:id/resume", post(resume_workflow))
        .route("/workflows/:id/retry", post(retry_workflow))
}

/// Routes with request tracing, bound to `sequencer`
pub fn router(sequencer: Arc<Sequencer>) -> Router {
    workflow_routes()
        .layer(TraceLayer::new_for_http())
        .with_state(sequencer)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /workflows?status=failed
async fn list_workflows(
    State(sequencer): State<Arc<Sequencer>>,
    Query(query): Query<ListWorkflowsQuery>,
) -> PipelineResult<Json<Vec<Workflow>>> {
    Ok(Json(sequencer.list(query.status).await?))
}

async fn get_workflow(
    State(sequencer): State<Arc<Sequencer>>,
    Path(id): Path<Uuid>,
) -> PipelineResult<Json<Workflow>> {
    Ok(Json(sequencer.get(id).await?))
}

async fn delete_workflow(
    State(sequencer): State<Arc<Sequencer>>,
    Path(id): Path<Uuid>,
) -> PipelineResult<StatusCode> {
    sequencer.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pause_workflow(
    State(sequencer): State<Arc<Sequencer>>,
    Path(id): Path<Uuid>,
) -> PipelineResult<Json<Workflow>> {
    Ok(Json(sequencer.pause(id).await?))
}

async fn resume_workflow(
    State(sequencer): State<Arc<Sequencer>>,
    Path(id): Path<Uuid>,
) -> PipelineResult<Json<Workflow>> {
    Ok(Json(sequencer.resume(id).await?))
}

/// POST /workflows/:id/retry
///
/// Re-dispatches the step a failed workflow is parked at.
async fn retry_workflow(
    State(sequencer): State<Arc<Sequencer>>,
    Path(id): Path<Uuid>,
) -> PipelineResult<Json<Workflow>> {
    Ok(Json(sequencer.retry(id).await?))
}
