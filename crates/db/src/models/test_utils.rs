use std::str::FromStr;

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};

use super::workflow::{CreateWorkflow, Workflow};

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

    crate::MIGRATOR
        .run(&pool)
        .await
        .expect("failed to run migrations");

    pool
}

pub(crate) async fn create_test_workflow(pool: &SqlitePool, text: &str) -> Workflow {
    Workflow::create(
        pool,
        CreateWorkflow {
            request_text: text.to_string(),
        },
    )
    .await
    .expect("failed to create test workflow")
}
