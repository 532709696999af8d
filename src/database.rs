//! Embedded SQLite storage, shared by the durable registry backend and the
//! Model Manager's evaluation log.
//!
//! Functional core / imperative shell split: configuration validation and
//! connection-string generation are pure; `DatabaseConnection::initialize`
//! is the only place that touches the filesystem or opens a pool.

use sqlx::{migrate::Migrator, Pool, Sqlite, SqlitePool};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Static migrator for the embedded migrations under `migrations/`.
static MIGRATOR: Migrator = sqlx::migrate!();

/// Pure, backend-independent storage errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A database operation failed.
    #[error("database error: {message}")]
    Database {
        /// Underlying error message.
        message: String,
    },

    /// A filesystem operation failed.
    #[error("file system error: {message}")]
    FileSystem {
        /// Underlying error message.
        message: String,
    },

    /// Configuration was invalid.
    #[error("configuration error: {field} - {reason}")]
    Configuration {
        /// Offending field name.
        field: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Top-level database error, aggregating sqlx/io/storage failures.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Error surfaced by `sqlx` itself.
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A pure storage-layer validation failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result alias for database operations.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// A validated path to a `.db` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabasePath(PathBuf);

impl DatabasePath {
    /// Validates that `path` is non-empty and ends in `.db`.
    pub fn new<P: AsRef<Path>>(path: P) -> DatabaseResult<Self> {
        let path_buf = path.as_ref().to_path_buf();
        if path_buf.as_os_str().is_empty()
            || !path_buf.extension().is_some_and(|ext| ext == "db")
        {
            return Err(DatabaseError::Storage(StorageError::Configuration {
                field: "database_path".to_string(),
                reason: "path must be non-empty and end in .db".to_string(),
            }));
        }
        Ok(Self(path_buf))
    }

    /// Returns the path.
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Generates the `sqlite://` connection string, creating the file if
    /// absent (`mode=rwc`).
    #[must_use]
    pub fn to_connection_string(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.0.display())
    }

    /// Parent directory, for pre-creating the containing folder.
    #[must_use]
    pub fn parent_directory(&self) -> Option<PathBuf> {
        self.0.parent().map(Path::to_path_buf)
    }
}

impl std::fmt::Display for DatabasePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// A managed SQLite connection pool, migrated on open.
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    /// Opens (creating if necessary) the database at `path` and runs
    /// pending migrations.
    pub async fn initialize(path: &DatabasePath) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent_directory() {
            std::fs::create_dir_all(&parent)?;
        }
        let pool: Pool<Sqlite> = SqlitePool::connect(&path.to_connection_string()).await?;
        MIGRATOR.run(&pool).await?;
        info!(path = %path, "database migrated");
        Ok(Self { pool })
    }

    /// Opens a purely in-memory database, for tests that need real SQL
    /// semantics without touching the filesystem.
    pub async fn initialize_in_memory() -> DatabaseResult<Self> {
        let pool: Pool<Sqlite> = SqlitePool::connect("sqlite::memory:").await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_path_rejects_wrong_extension() {
        assert!(DatabasePath::new("registry.txt").is_err());
    }

    #[test]
    fn database_path_accepts_db_extension() {
        assert!(DatabasePath::new("registry.db").is_ok());
    }

    #[tokio::test]
    async fn in_memory_database_runs_migrations() {
        let conn = DatabaseConnection::initialize_in_memory().await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM registry_entries")
            .fetch_one(conn.pool())
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }
}
