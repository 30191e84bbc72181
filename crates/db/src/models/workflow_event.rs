use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqliteConnection, SqlitePool, Type};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkflowEventError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Audit event kinds. One `state_transition` row is written for every
/// workflow transition; the other kinds carry context alongside it.
#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq)]
#[sqlx(type_name = "workflow_event_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    StateTransition,
    AiOutputInvalid,
    AiRequestFailed,
    ActionDispatched,
    ActionFailed,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Created => write!(f, "created"),
            EventType::StateTransition => write!(f, "state_transition"),
            EventType::AiOutputInvalid => write!(f, "ai_output_invalid"),
            EventType::AiRequestFailed => write!(f, "ai_request_failed"),
            EventType::ActionDispatched => write!(f, "action_dispatched"),
            EventType::ActionFailed => write!(f, "action_failed"),
        }
    }
}

/// Append-only audit row. Events are never updated or deleted; the timeline
/// endpoint is a pure projection over this table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub event_type: EventType,
    pub event_data: Option<String>, // JSON payload
    pub created_at: DateTime<Utc>,
}

impl WorkflowEvent {
    pub async fn append(
        pool: &SqlitePool,
        workflow_id: Uuid,
        event_type: EventType,
        event_data: Option<Value>,
    ) -> Result<Self, WorkflowEventError> {
        let mut conn = pool.acquire().await?;
        Self::append_with(&mut conn, workflow_id, event_type, event_data).await
    }

    /// Append inside an existing transaction so the event commits atomically
    /// with the state change it records.
    pub async fn append_with(
        conn: &mut SqliteConnection,
        workflow_id: Uuid,
        event_type: EventType,
        event_data: Option<Value>,
    ) -> Result<Self, WorkflowEventError> {
        let id = Uuid::new_v4();
        let event_type_str = event_type.to_string();
        let event_data_str = event_data.map(|v| v.to_string());

        let event = sqlx::query_as::<_, WorkflowEvent>(
            r#"
            INSERT INTO workflow_events (id, workflow_id, event_type, event_data)
            VALUES (?1, ?2, ?3, ?4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(workflow_id)
        .bind(event_type_str)
        .bind(event_data_str)
        .fetch_one(conn)
        .await?;

        Ok(event)
    }

    /// Full timeline for one workflow, oldest first.
    pub async fn find_by_workflow(
        pool: &SqlitePool,
        workflow_id: Uuid,
    ) -> Result<Vec<Self>, WorkflowEventError> {
        let events = sqlx::query_as::<_, WorkflowEvent>(
            r#"
            SELECT * FROM workflow_events
            WHERE workflow_id = ?1
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(workflow_id)
        .fetch_all(pool)
        .await?;

        Ok(events)
    }

    /// Parse event_data as JSON.
    pub fn event_data_json(&self) -> Option<Value> {
        self.event_data
            .as_ref()
            .and_then(|s| serde_json::from_str(s).ok())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::test_utils::{create_test_workflow, setup_test_pool};

    #[tokio::test]
    async fn timeline_preserves_append_order() {
        let pool = setup_test_pool().await;
        let workflow = create_test_workflow(&pool, "ping the vendor").await;

        WorkflowEvent::append(
            &pool,
            workflow.id,
            EventType::AiRequestFailed,
            Some(json!({"error": "connect timeout"})),
        )
        .await
        .expect("append failed");

        WorkflowEvent::append(&pool, workflow.id, EventType::StateTransition, None)
            .await
            .expect("append failed");

        let timeline = WorkflowEvent::find_by_workflow(&pool, workflow.id)
            .await
            .expect("timeline lookup failed");

        // create_test_workflow already wrote the `created` event
        assert_eq!(timeline.len(), 3);
        assert_eq!(timeline[0].event_type, EventType::Created);
        assert_eq!(timeline[1].event_type, EventType::AiRequestFailed);
        assert_eq!(
            timeline[1].event_data_json(),
            Some(json!({"error": "connect timeout"}))
        );
        assert_eq!(timeline[2].event_type, EventType::StateTransition);
    }
}
