//! AI analysis worker.
//!
//! Turns `received` workflows into either a validated recommendation
//! (`waiting_for_approval`) or a recorded failure (`ai_failed`). The model
//! never advances a workflow past the approval gate: its output is parsed
//! and checked here, and anything off-contract fails closed.

use std::{sync::Arc, time::Duration};

use db::models::{
    workflow::{AiOutput, TransitionFields, Workflow, WorkflowError, WorkflowState},
    workflow_event::{EventType, WorkflowEvent},
};
use executors::RecommendedAction;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::task::JoinHandle;

use super::llm::{CompletionProvider, ProviderError};

pub const SYSTEM_PROMPT: &str = r#"You are an assistant that analyzes business requests.

Return ONLY valid JSON with this exact schema:
{
  "intent": string,
  "recommended_action": "send_email" | "create_task" | "reject",
  "confidence": number between 0 and 1
}"#;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const CLAIM_BATCH_SIZE: i64 = 10;
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_PROVIDER_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

pub struct AnalyzerService {
    pool: SqlitePool,
    provider: Arc<dyn CompletionProvider>,
}

impl AnalyzerService {
    pub fn new(pool: SqlitePool, provider: Arc<dyn CompletionProvider>) -> Arc<Self> {
        Arc::new(Self { pool, provider })
    }

    /// Background poll loop. Any number of these may run against the same
    /// store; the conditional claim keeps them from processing a workflow
    /// twice.
    pub fn spawn(self: Arc<Self>, poll_interval: Duration) -> JoinHandle<()> {
        let service = self;
        tokio::spawn(async move {
            tracing::info!(provider = service.provider.name(), "analyzer worker started");
            loop {
                match service.process_pending().await {
                    Ok(n) if n > 0 => tracing::debug!("analyzed {n} workflows"),
                    Ok(_) => {}
                    Err(err) => tracing::error!("analyzer pass failed: {err}"),
                }
                tokio::time::sleep(poll_interval).await;
            }
        })
    }

    /// One pass: claim up to a batch of `received` workflows and analyze
    /// each. Returns how many this worker actually processed.
    pub async fn process_pending(&self) -> Result<usize, AnalyzerError> {
        let candidates =
            Workflow::find_by_state(&self.pool, WorkflowState::Received, CLAIM_BATCH_SIZE).await?;

        let mut processed = 0;
        for candidate in candidates {
            // The claim is the exclusivity mechanism: exactly one worker wins
            // this conditional write, everyone else skips the workflow.
            let claimed = match Workflow::transition(
                &self.pool,
                candidate.id,
                WorkflowState::Received,
                WorkflowState::AiAnalyzed,
                TransitionFields::default(),
            )
            .await
            {
                Ok(workflow) => workflow,
                Err(WorkflowError::StaleState { .. }) => continue,
                Err(err) => return Err(err.into()),
            };

            self.analyze(claimed).await?;
            processed += 1;
        }

        Ok(processed)
    }

    async fn analyze(&self, workflow: Workflow) -> Result<(), AnalyzerError> {
        let raw = match self.complete_with_retry(&workflow.request_text).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(workflow_id = %workflow.id, "AI request failed: {err}");
                WorkflowEvent::append(
                    &self.pool,
                    workflow.id,
                    EventType::AiRequestFailed,
                    Some(json!({"error": err.to_string()})),
                )
                .await
                .map_err(WorkflowError::from)?;
                Workflow::transition(
                    &self.pool,
                    workflow.id,
                    WorkflowState::AiAnalyzed,
                    WorkflowState::AiFailed,
                    TransitionFields::default(),
                )
                .await?;
                return Ok(());
            }
        };

        match validate_output(&raw) {
            Ok(output) => {
                tracing::info!(
                    workflow_id = %workflow.id,
                    action = %output.recommended_action,
                    confidence = output.confidence,
                    "AI recommendation validated"
                );
                Workflow::transition(
                    &self.pool,
                    workflow.id,
                    WorkflowState::AiAnalyzed,
                    WorkflowState::WaitingForApproval,
                    TransitionFields {
                        ai_output: Some(output),
                        ..Default::default()
                    },
                )
                .await?;
            }
            Err(reason) => {
                tracing::warn!(workflow_id = %workflow.id, "AI output rejected: {reason}");
                // Preserve the raw text so the audit trail shows exactly what
                // the model said.
                WorkflowEvent::append(
                    &self.pool,
                    workflow.id,
                    EventType::AiOutputInvalid,
                    Some(json!({"reason": reason, "raw": raw})),
                )
                .await
                .map_err(WorkflowError::from)?;
                Workflow::transition(
                    &self.pool,
                    workflow.id,
                    WorkflowState::AiAnalyzed,
                    WorkflowState::AiFailed,
                    TransitionFields::default(),
                )
                .await?;
            }
        }

        Ok(())
    }

    async fn complete_with_retry(&self, request_text: &str) -> Result<String, ProviderError> {
        let mut attempt = 1;
        loop {
            let result = tokio::time::timeout(
                PROVIDER_TIMEOUT,
                self.provider.complete(SYSTEM_PROMPT, request_text),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ProviderError::RequestFailed(
                    "request timed out".to_string(),
                ))
            });

            match result {
                Ok(raw) => return Ok(raw),
                Err(err) if err.is_retryable() && attempt < MAX_PROVIDER_ATTEMPTS => {
                    let backoff = RETRY_BACKOFF_BASE * 2u32.pow(attempt - 1);
                    tracing::debug!("AI request attempt {attempt} failed ({err}), retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Strict decode of the raw model output against the recommendation schema.
///
/// Unknown action names are rejected, never coerced; confidence must be a
/// finite number in [0, 1]. The returned error string goes into the audit
/// log next to the raw text.
fn validate_output(raw: &str) -> Result<AiOutput, String> {
    let value: Value =
        serde_json::from_str(raw.trim()).map_err(|e| format!("not valid JSON: {e}"))?;
    let object = value.as_object().ok_or("not a JSON object")?;

    let intent = object
        .get("intent")
        .and_then(Value::as_str)
        .ok_or("intent missing or not a string")?;
    if intent.trim().is_empty() {
        return Err("intent is empty".to_string());
    }

    let action_value = object
        .get("recommended_action")
        .cloned()
        .ok_or("recommended_action missing")?;
    let recommended_action: RecommendedAction = serde_json::from_value(action_value.clone())
        .map_err(|_| format!("recommended_action not in allowed set: {action_value}"))?;

    let confidence = object
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or("confidence missing or not a number")?;
    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        return Err(format!("confidence out of range: {confidence}"));
    }

    Ok(AiOutput {
        intent: intent.to_string(),
        recommended_action,
        confidence,
    })
}
