use std::{env, path::PathBuf};

use directories::ProjectDirs;

const DATA_DIR_ENV: &str = "GREENLIGHT_DATA_DIR";

/// Directory holding the sqlite database.
///
/// `GREENLIGHT_DATA_DIR` overrides the platform default so deployments can
/// pin the database location.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    ProjectDirs::from("ai", "greenlight", "greenlight")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| {
            tracing::warn!("no home directory available, falling back to ./data");
            PathBuf::from("./data")
        })
}
