use std::str::FromStr;

use sqlx::{
    Error, Pool, Sqlite, SqlitePool,
    migrate::Migrator,
    sqlite::SqliteConnectOptions,
};
use utils::assets::data_dir;

pub mod models;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct DBService {
    pub pool: Pool<Sqlite>,
}

impl DBService {
    pub async fn new() -> Result<DBService, Error> {
        let database_url = format!(
            "sqlite://{}",
            data_dir().join("greenlight.sqlite").to_string_lossy()
        );
        let options = SqliteConnectOptions::from_str(&database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePool::connect_with(options).await?;
        MIGRATOR.run(&pool).await?;
        Ok(DBService { pool })
    }
}
