use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Error as AnyhowError;
use db::DBService;
use executors::{ActionExecutor, LoggingExecutor};
use server::{AppState, routes};
use services::services::{
    analyzer::{AnalyzerService, DEFAULT_POLL_INTERVAL},
    approvals::ApprovalService,
    llm::{CompletionProvider, OpenAiProvider},
};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, prelude::*};
use utils::assets::data_dir;

const STALE_APPROVAL_CUTOFF_SECS: i64 = 300;

#[derive(Debug, Error)]
pub enum GreenlightError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
    #[error(transparent)]
    Other(#[from] AnyhowError),
}

#[tokio::main]
async fn main() -> Result<(), GreenlightError> {
    // Load environment variables from `.env` if present so local development
    // picks up API keys
    dotenv::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,server={level},services={level},db={level},executors={level},utils={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string).expect("Failed to create tracing filter");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    if !data_dir().exists() {
        std::fs::create_dir_all(data_dir())?;
    }

    let db = DBService::new().await?;

    let provider: Arc<dyn CompletionProvider> = Arc::new(OpenAiProvider::from_env());
    let executor: Arc<dyn ActionExecutor> = Arc::new(LoggingExecutor);

    let approvals = ApprovalService::new(db.pool.clone(), executor);

    // A crash between an approval write and its executor result leaves the
    // workflow parked in action_approved; fail those closed before serving.
    let resolved = approvals
        .resolve_stale_approvals(STALE_APPROVAL_CUTOFF_SECS)
        .await
        .map_err(AnyhowError::from)?;
    if resolved > 0 {
        tracing::warn!("resolved {resolved} orphaned approvals on startup");
    }

    let poll_interval = std::env::var("GREENLIGHT_POLL_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_POLL_INTERVAL);
    let analyzer = AnalyzerService::new(db.pool.clone(), provider);
    analyzer.spawn(poll_interval);

    let state = AppState::new(db, approvals);
    let app = routes::router(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3409);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("greenlight server listening on {addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
