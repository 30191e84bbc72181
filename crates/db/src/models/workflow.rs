use chrono::{DateTime, Utc};
use executors::RecommendedAction;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{FromRow, SqlitePool, Type};
use thiserror::Error;
use uuid::Uuid;

use super::workflow_event::{EventType, WorkflowEvent, WorkflowEventError};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
    #[error("Workflow not found")]
    NotFound,
    #[error("Invalid workflow: {0}")]
    Validation(String),
    #[error("Workflow state changed: expected {expected}, found {actual}")]
    StaleState {
        expected: WorkflowState,
        actual: WorkflowState,
    },
    #[error("Illegal workflow transition: {0}")]
    IllegalTransition(String),
}

impl From<WorkflowEventError> for WorkflowError {
    fn from(err: WorkflowEventError) -> Self {
        match err {
            WorkflowEventError::Database(e) => WorkflowError::Database(e),
        }
    }
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "workflow_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Request recorded, not yet analyzed.
    Received,
    /// Internal: claimed by an analyzer worker.
    AiAnalyzed,
    /// Validated AI recommendation persisted; awaiting a human decision.
    WaitingForApproval,
    /// Internal: approval durably recorded, executor dispatch in flight.
    ActionApproved,
    ActionExecuted,
    ActionFailed,
    Rejected,
    AiFailed,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::ActionExecuted
                | WorkflowState::ActionFailed
                | WorkflowState::Rejected
                | WorkflowState::AiFailed
        )
    }

    /// The complete edge set of the state machine. Every store write is
    /// checked against this; nothing else can move a workflow.
    pub fn permits(&self, next: WorkflowState) -> bool {
        matches!(
            (self, next),
            (WorkflowState::Received, WorkflowState::AiAnalyzed)
                | (WorkflowState::AiAnalyzed, WorkflowState::WaitingForApproval)
                | (WorkflowState::AiAnalyzed, WorkflowState::AiFailed)
                | (WorkflowState::WaitingForApproval, WorkflowState::Rejected)
                | (WorkflowState::WaitingForApproval, WorkflowState::ActionApproved)
                | (WorkflowState::ActionApproved, WorkflowState::ActionExecuted)
                | (WorkflowState::ActionApproved, WorkflowState::ActionFailed)
        )
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowState::Received => write!(f, "received"),
            WorkflowState::AiAnalyzed => write!(f, "ai_analyzed"),
            WorkflowState::WaitingForApproval => write!(f, "waiting_for_approval"),
            WorkflowState::ActionApproved => write!(f, "action_approved"),
            WorkflowState::ActionExecuted => write!(f, "action_executed"),
            WorkflowState::ActionFailed => write!(f, "action_failed"),
            WorkflowState::Rejected => write!(f, "rejected"),
            WorkflowState::AiFailed => write!(f, "ai_failed"),
        }
    }
}

/// Validated AI recommendation. Only the analyzer writes this, and only
/// after the raw model output passed schema validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiOutput {
    pub intent: String,
    pub recommended_action: RecommendedAction,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Rejected,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Approved => write!(f, "approved"),
            Decision::Rejected => write!(f, "rejected"),
        }
    }
}

/// Recorded human decision. Only the approval gateway writes this.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HumanDecision {
    pub decision: Decision,
    pub reviewer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub state: WorkflowState,
    pub request_text: String,
    pub ai_output: Option<String>,      // JSON, AiOutput
    pub human_decision: Option<String>, // JSON, HumanDecision
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkflow {
    pub request_text: String,
}

/// Fields a transition may set. Both are write-once: the store keeps the
/// existing value when one is already present.
#[derive(Debug, Default)]
pub struct TransitionFields {
    pub ai_output: Option<AiOutput>,
    pub human_decision: Option<HumanDecision>,
}

/// API-facing projection with the JSON columns decoded.
#[derive(Debug, Serialize)]
pub struct WorkflowSummary {
    pub id: Uuid,
    pub state: WorkflowState,
    pub request_text: String,
    pub ai_output: Option<AiOutput>,
    pub human_decision: Option<HumanDecision>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Durably record a new request in `received`, together with its
    /// `created` audit event.
    pub async fn create(pool: &SqlitePool, data: CreateWorkflow) -> Result<Self, WorkflowError> {
        if data.request_text.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "request_text must not be empty".to_string(),
            ));
        }

        let id = Uuid::new_v4();
        let mut tx = pool.begin().await?;

        let workflow = sqlx::query_as::<_, Workflow>(
            r#"
            INSERT INTO workflows (id, state, request_text)
            VALUES (?1, ?2, ?3)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(WorkflowState::Received.to_string())
        .bind(&data.request_text)
        .fetch_one(&mut *tx)
        .await?;

        WorkflowEvent::append_with(&mut tx, id, EventType::Created, None).await?;
        tx.commit().await?;

        Ok(workflow)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, WorkflowError> {
        let workflow = sqlx::query_as::<_, Workflow>(r#"SELECT * FROM workflows WHERE id = ?1"#)
            .bind(id)
            .fetch_optional(pool)
            .await?;

        Ok(workflow)
    }

    /// All workflows in insertion order.
    pub async fn find_all(pool: &SqlitePool) -> Result<Vec<Self>, WorkflowError> {
        let workflows = sqlx::query_as::<_, Workflow>(
            r#"SELECT * FROM workflows ORDER BY created_at ASC, rowid ASC"#,
        )
        .fetch_all(pool)
        .await?;

        Ok(workflows)
    }

    /// Candidates for a worker to claim, oldest first.
    pub async fn find_by_state(
        pool: &SqlitePool,
        state: WorkflowState,
        limit: i64,
    ) -> Result<Vec<Self>, WorkflowError> {
        let workflows = sqlx::query_as::<_, Workflow>(
            r#"
            SELECT * FROM workflows
            WHERE state = ?1
            ORDER BY created_at ASC, rowid ASC
            LIMIT ?2
            "#,
        )
        .bind(state.to_string())
        .bind(limit)
        .fetch_all(pool)
        .await?;

        Ok(workflows)
    }

    /// Workflows sitting in `state` with no transition for at least
    /// `older_than_secs`. Used to resolve approvals orphaned by a crash
    /// between the approval write and the executor result.
    pub async fn find_stale_in_state(
        pool: &SqlitePool,
        state: WorkflowState,
        older_than_secs: i64,
    ) -> Result<Vec<Self>, WorkflowError> {
        let cutoff_modifier = format!("-{} seconds", older_than_secs);
        let workflows = sqlx::query_as::<_, Workflow>(
            r#"
            SELECT * FROM workflows
            WHERE state = ?1
              AND updated_at < datetime('now', 'subsec', ?2)
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(state.to_string())
        .bind(cutoff_modifier)
        .fetch_all(pool)
        .await?;

        Ok(workflows)
    }

    /// The single mutation primitive: a compare-and-set on the current state.
    ///
    /// Succeeds only if the workflow is still in `expected`; the state change
    /// and its `state_transition` audit event commit in one transaction.
    /// Losing a race yields `StaleState` and changes nothing. `ai_output` and
    /// `human_decision` are only ever filled in, never overwritten.
    pub async fn transition(
        pool: &SqlitePool,
        id: Uuid,
        expected: WorkflowState,
        new: WorkflowState,
        fields: TransitionFields,
    ) -> Result<Self, WorkflowError> {
        if !expected.permits(new) {
            return Err(WorkflowError::IllegalTransition(format!(
                "{} -> {}",
                expected, new
            )));
        }

        let ai_output_str = fields
            .ai_output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let human_decision_str = fields
            .human_decision
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = pool.begin().await?;

        let updated = sqlx::query_as::<_, Workflow>(
            r#"
            UPDATE workflows
            SET state = ?3,
                ai_output = COALESCE(ai_output, ?4),
                human_decision = COALESCE(human_decision, ?5),
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND state = ?2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expected.to_string())
        .bind(new.to_string())
        .bind(ai_output_str)
        .bind(human_decision_str)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(workflow) = updated else {
            let actual = sqlx::query_scalar::<_, WorkflowState>(
                r#"SELECT state FROM workflows WHERE id = ?1"#,
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

            return Err(match actual {
                Some(actual) => WorkflowError::StaleState { expected, actual },
                None => WorkflowError::NotFound,
            });
        };

        WorkflowEvent::append_with(
            &mut tx,
            id,
            EventType::StateTransition,
            Some(json!({"from": expected, "to": new})),
        )
        .await?;
        tx.commit().await?;

        Ok(workflow)
    }

    /// Parse the stored AI recommendation.
    pub fn ai_output_parsed(&self) -> Option<AiOutput> {
        self.ai_output
            .as_ref()
            .and_then(|s| serde_json::from_str(s).ok())
    }

    /// Parse the stored human decision.
    pub fn human_decision_parsed(&self) -> Option<HumanDecision> {
        self.human_decision
            .as_ref()
            .and_then(|s| serde_json::from_str(s).ok())
    }

    pub fn to_summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.id,
            state: self.state,
            request_text: self.request_text.clone(),
            ai_output: self.ai_output_parsed(),
            human_decision: self.human_decision_parsed(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
