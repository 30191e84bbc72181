use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use db::models::{
    workflow::{CreateWorkflow, Workflow, WorkflowSummary},
    workflow_event::WorkflowEvent,
};
use serde::Deserialize;
use services::services::approvals::DecideWorkflow;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct CreateWorkflowPayload {
    pub text: String,
}

pub fn router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/workflows", get(list_workflows).post(create_workflow))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflows/{id}/events", get(get_timeline))
        .route("/workflows/{id}/decide", post(decide_workflow))
        .with_state(state.clone())
}

async fn create_workflow(
    State(state): State<AppState>,
    Json(payload): Json<CreateWorkflowPayload>,
) -> Result<(StatusCode, Json<ApiResponse<WorkflowSummary>>), ApiError> {
    let workflow = Workflow::create(
        &state.db().pool,
        CreateWorkflow {
            request_text: payload.text,
        },
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(workflow.to_summary())),
    ))
}

async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<WorkflowSummary>>>, ApiError> {
    let workflows = Workflow::find_all(&state.db().pool).await?;
    let summaries = workflows.iter().map(Workflow::to_summary).collect();
    Ok(Json(ApiResponse::success(summaries)))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowSummary>>, ApiError> {
    let workflow = Workflow::find_by_id(&state.db().pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Workflow not found".to_string()))?;
    Ok(Json(ApiResponse::success(workflow.to_summary())))
}

/// Read-only audit timeline, consumed by the dashboard.
async fn get_timeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<WorkflowEvent>>>, ApiError> {
    let pool = &state.db().pool;
    if Workflow::find_by_id(pool, id).await?.is_none() {
        return Err(ApiError::NotFound("Workflow not found".to_string()));
    }

    let events = WorkflowEvent::find_by_workflow(pool, id).await?;
    Ok(Json(ApiResponse::success(events)))
}

async fn decide_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DecideWorkflow>,
) -> Result<Json<ApiResponse<WorkflowSummary>>, ApiError> {
    let workflow = state.approvals().decide(id, payload).await?;
    Ok(Json(ApiResponse::success(workflow.to_summary())))
}
