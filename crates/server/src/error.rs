use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use db::models::{workflow::WorkflowError, workflow_event::WorkflowEventError};
use services::services::approvals::ApprovalError;
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    WorkflowEvent(#[from] WorkflowEventError),
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Not Found: {0}")]
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_type) = match &self {
            ApiError::Workflow(err) => match err {
                WorkflowError::Validation(_) => (StatusCode::BAD_REQUEST, "ValidationError"),
                WorkflowError::NotFound => (StatusCode::NOT_FOUND, "NotFound"),
                WorkflowError::StaleState { .. } | WorkflowError::IllegalTransition(_) => {
                    (StatusCode::CONFLICT, "InvalidStateError")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "WorkflowError"),
            },
            ApiError::Approval(err) => match err {
                ApprovalError::Validation(_) => (StatusCode::BAD_REQUEST, "ValidationError"),
                ApprovalError::NotFound => (StatusCode::NOT_FOUND, "NotFound"),
                ApprovalError::InvalidState { .. } => (StatusCode::CONFLICT, "InvalidStateError"),
                ApprovalError::Workflow(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "WorkflowError")
                }
            },
            ApiError::WorkflowEvent(_) => (StatusCode::INTERNAL_SERVER_ERROR, "WorkflowEventError"),
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
        };

        let error_message = match &self {
            ApiError::NotFound(msg) => msg.clone(),
            ApiError::Workflow(WorkflowError::Validation(msg)) => msg.clone(),
            ApiError::Approval(ApprovalError::Validation(msg)) => msg.clone(),
            ApiError::Approval(ApprovalError::InvalidState { .. }) => self.to_string(),
            _ => format!("{}: {}", error_type, self),
        };
        let response = ApiResponse::<()>::error(&error_message);
        (status_code, Json(response)).into_response()
    }
}
