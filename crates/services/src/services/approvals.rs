//! The human approval gate.
//!
//! A workflow leaves `waiting_for_approval` only through `decide`, and the
//! executor runs only after the approval is already durable. The two-step
//! approved path (record, then resolve) means a crash mid-dispatch leaves a
//! workflow parked in `action_approved`, where `resolve_stale_approvals`
//! fails it closed instead of losing the decision.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use db::models::{
    workflow::{
        Decision, HumanDecision, TransitionFields, Workflow, WorkflowError, WorkflowState,
    },
    workflow_event::{EventType, WorkflowEvent},
};
use executors::{ActionContext, ActionExecutor, ExecutorError};
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

const EXECUTOR_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error(transparent)]
    Workflow(WorkflowError),
    #[error("Workflow not found")]
    NotFound,
    #[error("Workflow is not awaiting approval (current: {current})")]
    InvalidState { current: WorkflowState },
    #[error("Invalid decision: {0}")]
    Validation(String),
}

impl From<WorkflowError> for ApprovalError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::NotFound => ApprovalError::NotFound,
            WorkflowError::StaleState { actual, .. } => {
                ApprovalError::InvalidState { current: actual }
            }
            other => ApprovalError::Workflow(other),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DecideWorkflow {
    pub decision: Decision,
    pub reviewer: String,
    pub notes: Option<String>,
}

pub struct ApprovalService {
    pool: SqlitePool,
    executor: Arc<dyn ActionExecutor>,
}

impl ApprovalService {
    pub fn new(pool: SqlitePool, executor: Arc<dyn ActionExecutor>) -> Arc<Self> {
        Arc::new(Self { pool, executor })
    }

    /// Record a human decision and, on approval, dispatch the recommended
    /// action exactly once.
    ///
    /// The conditional transition out of `waiting_for_approval` is what makes
    /// duplicate or racing decisions safe: the second caller finds the state
    /// already moved and gets `InvalidState`.
    pub async fn decide(&self, id: Uuid, data: DecideWorkflow) -> Result<Workflow, ApprovalError> {
        if data.reviewer.trim().is_empty() {
            return Err(ApprovalError::Validation(
                "reviewer must not be empty".to_string(),
            ));
        }

        let human_decision = HumanDecision {
            decision: data.decision,
            reviewer: data.reviewer,
            notes: data.notes,
            decided_at: Utc::now(),
        };

        match data.decision {
            Decision::Rejected => {
                let workflow = Workflow::transition(
                    &self.pool,
                    id,
                    WorkflowState::WaitingForApproval,
                    WorkflowState::Rejected,
                    TransitionFields {
                        human_decision: Some(human_decision),
                        ..Default::default()
                    },
                )
                .await?;
                tracing::info!(workflow_id = %id, "workflow rejected");
                Ok(workflow)
            }
            Decision::Approved => {
                // Durable first: the decision is committed before the
                // executor ever runs.
                let approved = Workflow::transition(
                    &self.pool,
                    id,
                    WorkflowState::WaitingForApproval,
                    WorkflowState::ActionApproved,
                    TransitionFields {
                        human_decision: Some(human_decision),
                        ..Default::default()
                    },
                )
                .await?;

                Ok(self.dispatch(approved).await?)
            }
        }
    }

    async fn dispatch(&self, workflow: Workflow) -> Result<Workflow, WorkflowError> {
        let Some(ai_output) = workflow.ai_output_parsed() else {
            // Unreachable through the state machine; resolve rather than
            // leave the workflow parked.
            WorkflowEvent::append(
                &self.pool,
                workflow.id,
                EventType::ActionFailed,
                Some(json!({"error": "approved workflow has no ai_output"})),
            )
            .await?;
            return Workflow::transition(
                &self.pool,
                workflow.id,
                WorkflowState::ActionApproved,
                WorkflowState::ActionFailed,
                TransitionFields::default(),
            )
            .await;
        };

        let ctx = ActionContext {
            workflow_id: workflow.id,
            request_text: workflow.request_text.clone(),
            intent: ai_output.intent.clone(),
        };

        let result = tokio::time::timeout(
            EXECUTOR_TIMEOUT,
            self.executor.execute(ai_output.recommended_action, ctx),
        )
        .await
        .unwrap_or(Err(ExecutorError::Timeout));

        match result {
            Ok(()) => {
                WorkflowEvent::append(
                    &self.pool,
                    workflow.id,
                    EventType::ActionDispatched,
                    Some(json!({"action": ai_output.recommended_action})),
                )
                .await?;
                Workflow::transition(
                    &self.pool,
                    workflow.id,
                    WorkflowState::ActionApproved,
                    WorkflowState::ActionExecuted,
                    TransitionFields::default(),
                )
                .await
            }
            Err(err) => {
                tracing::warn!(workflow_id = %workflow.id, "action dispatch failed: {err}");
                WorkflowEvent::append(
                    &self.pool,
                    workflow.id,
                    EventType::ActionFailed,
                    Some(json!({"error": err.to_string()})),
                )
                .await?;
                Workflow::transition(
                    &self.pool,
                    workflow.id,
                    WorkflowState::ActionApproved,
                    WorkflowState::ActionFailed,
                    TransitionFields::default(),
                )
                .await
            }
        }
    }

    /// Fail-closed recovery for approvals orphaned by a crash between the
    /// approval write and the executor result. Run at startup.
    pub async fn resolve_stale_approvals(
        &self,
        older_than_secs: i64,
    ) -> Result<usize, ApprovalError> {
        let stuck = Workflow::find_stale_in_state(
            &self.pool,
            WorkflowState::ActionApproved,
            older_than_secs,
        )
        .await
        .map_err(ApprovalError::Workflow)?;

        let mut resolved = 0;
        for workflow in stuck {
            WorkflowEvent::append(
                &self.pool,
                workflow.id,
                EventType::ActionFailed,
                Some(json!({"error": "approval left unresolved, failing closed"})),
            )
            .await
            .map_err(|e| ApprovalError::Workflow(WorkflowError::from(e)))?;

            match Workflow::transition(
                &self.pool,
                workflow.id,
                WorkflowState::ActionApproved,
                WorkflowState::ActionFailed,
                TransitionFields::default(),
            )
            .await
            {
                Ok(_) => {
                    tracing::warn!(workflow_id = %workflow.id, "resolved orphaned approval to action_failed");
                    resolved += 1;
                }
                // Someone else resolved it in the meantime.
                Err(WorkflowError::StaleState { .. }) => {}
                Err(other) => return Err(ApprovalError::Workflow(other)),
            }
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use db::models::workflow::AiOutput;
    use executors::{MockExecutor, RecommendedAction};

    use super::*;
    use crate::services::test_support::{fetch, ready_for_approval, setup_test_pool};

    fn approval(reviewer: &str) -> DecideWorkflow {
        DecideWorkflow {
            decision: Decision::Approved,
            reviewer: reviewer.to_string(),
            notes: None,
        }
    }

    fn rejection(reviewer: &str) -> DecideWorkflow {
        DecideWorkflow {
            decision: Decision::Rejected,
            reviewer: reviewer.to_string(),
            notes: Some("not appropriate".to_string()),
        }
    }

    #[tokio::test]
    async fn approval_executes_the_action_exactly_once() {
        let pool = setup_test_pool().await;
        let executor = MockExecutor::new();
        let service = ApprovalService::new(pool.clone(), executor.clone());
        let workflow = ready_for_approval(&pool).await;

        let decided = service
            .decide(workflow.id, approval("r@x.com"))
            .await
            .expect("decide failed");

        assert_eq!(decided.state, WorkflowState::ActionExecuted);
        assert_eq!(
            executor.invocations(),
            vec![(workflow.id, RecommendedAction::SendEmail)]
        );
        let decision = decided.human_decision_parsed().expect("missing decision");
        assert_eq!(decision.decision, Decision::Approved);
        assert_eq!(decision.reviewer, "r@x.com");

        let timeline = WorkflowEvent::find_by_workflow(&pool, workflow.id)
            .await
            .unwrap();
        let dispatched = timeline
            .iter()
            .filter(|e| e.event_type == EventType::ActionDispatched)
            .count();
        assert_eq!(dispatched, 1);
    }

    #[tokio::test]
    async fn rejection_never_touches_the_executor() {
        let pool = setup_test_pool().await;
        let executor = MockExecutor::new();
        let service = ApprovalService::new(pool.clone(), executor.clone());
        let workflow = ready_for_approval(&pool).await;

        let decided = service
            .decide(workflow.id, rejection("r@x.com"))
            .await
            .expect("decide failed");

        assert_eq!(decided.state, WorkflowState::Rejected);
        assert_eq!(executor.invocation_count(), 0);

        // Terminal: a second decision is refused.
        let result = service.decide(workflow.id, approval("r@x.com")).await;
        assert!(matches!(
            result,
            Err(ApprovalError::InvalidState {
                current: WorkflowState::Rejected
            })
        ));
        assert_eq!(executor.invocation_count(), 0);
    }

    #[tokio::test]
    async fn executor_failure_resolves_to_action_failed_with_decision_intact() {
        let pool = setup_test_pool().await;
        let executor = MockExecutor::failing("smtp unreachable");
        let service = ApprovalService::new(pool.clone(), executor.clone());
        let workflow = ready_for_approval(&pool).await;

        let decided = service
            .decide(workflow.id, approval("r@x.com"))
            .await
            .expect("decide failed");

        assert_eq!(decided.state, WorkflowState::ActionFailed);
        assert_eq!(executor.invocation_count(), 1);
        assert!(decided.human_decision_parsed().is_some());

        let timeline = WorkflowEvent::find_by_workflow(&pool, workflow.id)
            .await
            .unwrap();
        let failure = timeline
            .iter()
            .find(|e| e.event_type == EventType::ActionFailed)
            .expect("missing action_failed event");
        let data = failure.event_data_json().unwrap();
        assert!(data["error"].as_str().unwrap().contains("smtp unreachable"));
    }

    #[tokio::test]
    async fn concurrent_decisions_have_exactly_one_winner() {
        let pool = setup_test_pool().await;
        let executor = MockExecutor::new();
        let service = ApprovalService::new(pool.clone(), executor.clone());
        let workflow = ready_for_approval(&pool).await;

        let (a, b) = tokio::join!(
            service.decide(workflow.id, approval("first@x.com")),
            service.decide(workflow.id, rejection("second@x.com")),
        );

        let wins = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(wins, 1);

        let final_state = fetch(&pool, workflow.id).await.state;
        assert!(final_state.is_terminal());
        // The executor ran at most once, and only if the approval won.
        assert!(executor.invocation_count() <= 1);
        if final_state == WorkflowState::Rejected {
            assert_eq!(executor.invocation_count(), 0);
        }
    }

    #[tokio::test]
    async fn decide_refuses_unanalyzed_and_unknown_workflows() {
        let pool = setup_test_pool().await;
        let service = ApprovalService::new(pool.clone(), MockExecutor::new());

        let workflow = db::models::workflow::Workflow::create(
            &pool,
            db::models::workflow::CreateWorkflow {
                request_text: "still pending".to_string(),
            },
        )
        .await
        .unwrap();

        let result = service.decide(workflow.id, approval("r@x.com")).await;
        assert!(matches!(
            result,
            Err(ApprovalError::InvalidState {
                current: WorkflowState::Received
            })
        ));

        let result = service.decide(Uuid::new_v4(), approval("r@x.com")).await;
        assert!(matches!(result, Err(ApprovalError::NotFound)));

        let result = service.decide(workflow.id, approval("   ")).await;
        assert!(matches!(result, Err(ApprovalError::Validation(_))));
    }

    #[tokio::test]
    async fn stale_approvals_are_failed_closed() {
        let pool = setup_test_pool().await;
        let executor = MockExecutor::new();
        let service = ApprovalService::new(pool.clone(), executor.clone());
        let workflow = ready_for_approval(&pool).await;

        // Simulate a crash after the approval write: the workflow is parked
        // in action_approved with a stale updated_at.
        Workflow::transition(
            &pool,
            workflow.id,
            WorkflowState::WaitingForApproval,
            WorkflowState::ActionApproved,
            TransitionFields {
                human_decision: Some(HumanDecision {
                    decision: Decision::Approved,
                    reviewer: "r@x.com".to_string(),
                    notes: None,
                    decided_at: Utc::now(),
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        sqlx::query(
            "UPDATE workflows SET updated_at = datetime('now', '-10 minutes') WHERE id = ?1",
        )
        .bind(workflow.id)
        .execute(&pool)
        .await
        .unwrap();

        let resolved = service
            .resolve_stale_approvals(300)
            .await
            .expect("recovery failed");
        assert_eq!(resolved, 1);

        let recovered = fetch(&pool, workflow.id).await;
        assert_eq!(recovered.state, WorkflowState::ActionFailed);
        assert!(recovered.human_decision_parsed().is_some());
        assert_eq!(executor.invocation_count(), 0);
    }

    #[tokio::test]
    async fn fresh_approvals_are_left_alone_by_recovery() {
        let pool = setup_test_pool().await;
        let service = ApprovalService::new(pool.clone(), MockExecutor::new());
        let workflow = ready_for_approval(&pool).await;

        Workflow::transition(
            &pool,
            workflow.id,
            WorkflowState::WaitingForApproval,
            WorkflowState::ActionApproved,
            TransitionFields {
                human_decision: Some(HumanDecision {
                    decision: Decision::Approved,
                    reviewer: "r@x.com".to_string(),
                    notes: None,
                    decided_at: Utc::now(),
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let resolved = service
            .resolve_stale_approvals(300)
            .await
            .expect("recovery failed");
        assert_eq!(resolved, 0);
        assert_eq!(
            fetch(&pool, workflow.id).await.state,
            WorkflowState::ActionApproved
        );
    }

    #[tokio::test]
    async fn reject_recommendation_dispatches_as_a_no_op_action() {
        let pool = setup_test_pool().await;
        let executor = MockExecutor::new();
        let service = ApprovalService::new(pool.clone(), executor.clone());

        let workflow = crate::services::test_support::ready_for_approval_with(
            &pool,
            AiOutput {
                intent: "decline politely".to_string(),
                recommended_action: RecommendedAction::Reject,
                confidence: 0.9,
            },
        )
        .await;

        let decided = service
            .decide(workflow.id, approval("r@x.com"))
            .await
            .expect("decide failed");

        assert_eq!(decided.state, WorkflowState::ActionExecuted);
        assert_eq!(
            executor.invocations(),
            vec![(workflow.id, RecommendedAction::Reject)]
        );
    }
}
