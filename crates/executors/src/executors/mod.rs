//! Action dispatch capability.
//!
//! The workflow core never performs an action itself. After a human approves
//! a recommendation, the approval gateway hands the validated action to an
//! [`ActionExecutor`] exactly once. Concrete integrations (email, task
//! systems) implement the trait; the default backends here only log.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Action dispatch failed: {0}")]
    DispatchFailed(String),
    #[error("Action dispatch timed out")]
    Timeout,
    #[error("Executor not configured: {0}")]
    NotConfigured(String),
}

/// The closed set of actions the AI may recommend.
///
/// Serde's enum decoding is the enforcement point: an invented action name
/// fails to parse instead of being coerced into something dispatchable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    SendEmail,
    CreateTask,
    Reject,
}

impl std::fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecommendedAction::SendEmail => write!(f, "send_email"),
            RecommendedAction::CreateTask => write!(f, "create_task"),
            RecommendedAction::Reject => write!(f, "reject"),
        }
    }
}

/// Everything a backend is allowed to see about the workflow it acts for.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub workflow_id: Uuid,
    pub request_text: String,
    pub intent: String,
}

/// Capability interface for performing an approved action.
///
/// Implementations must be safe to call concurrently for distinct workflows;
/// the approval gateway guarantees at most one call per workflow.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: RecommendedAction, ctx: ActionContext)
        -> Result<(), ExecutorError>;
}

/// Default backend: records the dispatch in the log and does nothing else.
pub struct LoggingExecutor;

#[async_trait]
impl ActionExecutor for LoggingExecutor {
    async fn execute(
        &self,
        action: RecommendedAction,
        ctx: ActionContext,
    ) -> Result<(), ExecutorError> {
        match action {
            RecommendedAction::SendEmail => {
                tracing::info!(workflow_id = %ctx.workflow_id, intent = %ctx.intent, "sent email");
            }
            RecommendedAction::CreateTask => {
                tracing::info!(workflow_id = %ctx.workflow_id, intent = %ctx.intent, "created task");
            }
            RecommendedAction::Reject => {
                tracing::info!(workflow_id = %ctx.workflow_id, "no action executed");
            }
        }
        Ok(())
    }
}

/// Test double: records every invocation and can be told to fail.
#[derive(Default)]
pub struct MockExecutor {
    invocations: Mutex<Vec<(Uuid, RecommendedAction)>>,
    fail_with: Mutex<Option<String>>,
}

impl MockExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(message: &str) -> Arc<Self> {
        let executor = Self::default();
        *executor.fail_with.lock().unwrap() = Some(message.to_string());
        Arc::new(executor)
    }

    pub fn invocations(&self) -> Vec<(Uuid, RecommendedAction)> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

#[async_trait]
impl ActionExecutor for MockExecutor {
    async fn execute(
        &self,
        action: RecommendedAction,
        ctx: ActionContext,
    ) -> Result<(), ExecutorError> {
        self.invocations
            .lock()
            .unwrap()
            .push((ctx.workflow_id, action));

        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(ExecutorError::DispatchFailed(message));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_executor_records_invocations() {
        let executor = MockExecutor::new();
        let id = Uuid::new_v4();

        executor
            .execute(
                RecommendedAction::SendEmail,
                ActionContext {
                    workflow_id: id,
                    request_text: "follow up".into(),
                    intent: "follow_up".into(),
                },
            )
            .await
            .expect("dispatch failed");

        assert_eq!(executor.invocations(), vec![(id, RecommendedAction::SendEmail)]);
    }

    #[tokio::test]
    async fn failing_mock_still_records_the_attempt() {
        let executor = MockExecutor::failing("smtp down");
        let id = Uuid::new_v4();

        let result = executor
            .execute(
                RecommendedAction::CreateTask,
                ActionContext {
                    workflow_id: id,
                    request_text: "file a ticket".into(),
                    intent: "create_ticket".into(),
                },
            )
            .await;

        assert!(matches!(result, Err(ExecutorError::DispatchFailed(_))));
        assert_eq!(executor.invocation_count(), 1);
    }
}
