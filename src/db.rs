use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Open (or create) the application database and return a shared pool.
///
/// Every store clones this pool and creates its own tables on construction.
pub async fn open_pool<P: AsRef<Path>>(db_path: P) -> Result<SqlitePool> {
    let db_path = db_path.as_ref();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }

    let connection_string = format!("sqlite:{}", db_path.display());
    let options = SqliteConnectOptions::from_str(&connection_string)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to database at: {}", db_path.display()))?;

    tracing::info!("Database opened: {}", db_path.display());

    Ok(pool)
}
