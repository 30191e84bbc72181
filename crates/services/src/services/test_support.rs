use std::str::FromStr;

use db::models::workflow::{
    AiOutput, CreateWorkflow, TransitionFields, Workflow, WorkflowState,
};
use executors::RecommendedAction;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use uuid::Uuid;

pub(crate) async fn setup_test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:?cache=shared")
        .expect("invalid sqlite config")
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("failed to open sqlite memory db");

    db::MIGRATOR
        .run(&pool)
        .await
        .expect("failed to run migrations");

    pool
}

pub(crate) async fn fetch(pool: &SqlitePool, id: Uuid) -> Workflow {
    Workflow::find_by_id(pool, id)
        .await
        .expect("lookup failed")
        .expect("workflow missing")
}

/// Walk a fresh workflow to `waiting_for_approval` with a send_email
/// recommendation, the way the analyzer would.
pub(crate) async fn ready_for_approval(pool: &SqlitePool) -> Workflow {
    ready_for_approval_with(
        pool,
        AiOutput {
            intent: "follow_up".to_string(),
            recommended_action: RecommendedAction::SendEmail,
            confidence: 0.82,
        },
    )
    .await
}

pub(crate) async fn ready_for_approval_with(pool: &SqlitePool, output: AiOutput) -> Workflow {
    let workflow = Workflow::create(
        pool,
        CreateWorkflow {
            request_text: "Follow up with ABC Corp about pricing".to_string(),
        },
    )
    .await
    .expect("create failed");

    Workflow::transition(
        pool,
        workflow.id,
        WorkflowState::Received,
        WorkflowState::AiAnalyzed,
        TransitionFields::default(),
    )
    .await
    .expect("claim failed");

    Workflow::transition(
        pool,
        workflow.id,
        WorkflowState::AiAnalyzed,
        WorkflowState::WaitingForApproval,
        TransitionFields {
            ai_output: Some(output),
            ..Default::default()
        },
    )
    .await
    .expect("transition failed")
}
