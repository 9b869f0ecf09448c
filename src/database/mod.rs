pub mod models;
pub mod queries;

use crate::error::DoozerError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Connection pool for the build/artifact store.
///
/// MySQL-level schema management and pooling are external collaborators; the
/// store runs on SQLite with WAL so concurrent claimers and the HTTP surface
/// share one file cleanly.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, DoozerError> {
        if !database_url.starts_with("sqlite:") {
            return Err(DoozerError::Config(
                "Unsupported database URL format. Use 'sqlite://'".to_string(),
            ));
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| DoozerError::Database(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| DoozerError::Database(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// In-memory store for tests. A single pooled connection: every pooled
    /// connection to `sqlite::memory:` would otherwise get its own database.
    pub async fn new_in_memory() -> Result<Self, DoozerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| DoozerError::Database(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> Result<(), DoozerError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DoozerError::Database(format!("Migration failed: {}", e)))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn check_health(&self) -> Result<bool, DoozerError> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|v| v == 1)
            .map_err(|e| DoozerError::Database(e.to_string()))
    }
}
