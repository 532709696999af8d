//! Durable registry backend, backed by embedded SQLite through
//! [`crate::database`] (functional-core/imperative-shell split,
//! `sqlx::migrate!()`).

use async_trait::async_trait;
use sqlx::Row;

use super::{ListFilter, RegistryBackend, RegistryEntry, RegistryError};
use crate::database::DatabaseConnection;

/// Durable `RegistryBackend` for multi-node deployments.
pub struct SqliteRegistryBackend {
    db: DatabaseConnection,
}

impl SqliteRegistryBackend {
    /// Wraps an already-migrated database connection.
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<RegistryEntry, RegistryError> {
        let capabilities_json: String = row.try_get("capabilities").map_err(db_err)?;
        let capabilities: Vec<String> =
            serde_json::from_str(&capabilities_json).map_err(|e| RegistryError::Backend(e.to_string()))?;
        Ok(RegistryEntry {
            name: row.try_get("name").map_err(db_err)?,
            host: row.try_get("host").map_err(db_err)?,
            port: row.try_get::<i64, _>("port").map_err(db_err)? as u16,
            health_port: row.try_get::<i64, _>("health_port").map_err(db_err)? as u16,
            capabilities,
            registered_at_ms: row.try_get::<i64, _>("registered_at_ms").map_err(db_err)? as u64,
            last_heartbeat_ms: row.try_get::<i64, _>("last_heartbeat_ms").map_err(db_err)? as u64,
            version: row.try_get::<i64, _>("version").map_err(db_err)? as u64,
        })
    }
}

fn db_err(e: sqlx::Error) -> RegistryError {
    RegistryError::Backend(e.to_string())
}

#[async_trait]
impl RegistryBackend for SqliteRegistryBackend {
    async fn register(&self, entry: RegistryEntry) -> Result<(), RegistryError> {
        let capabilities_json =
            serde_json::to_string(&entry.capabilities).map_err(|e| RegistryError::Backend(e.to_string()))?;
        let result = sqlx::query(
            "INSERT INTO registry_entries \
                (name, host, port, health_port, capabilities, registered_at_ms, last_heartbeat_ms, version) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1) \
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(&entry.name)
        .bind(&entry.host)
        .bind(i64::from(entry.port))
        .bind(i64::from(entry.health_port))
        .bind(&capabilities_json)
        .bind(entry.registered_at_ms as i64)
        .bind(entry.last_heartbeat_ms as i64)
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NameTaken(entry.name));
        }
        Ok(())
    }

    async fn deregister(&self, name: &str) -> Result<(), RegistryError> {
        let result = sqlx::query("DELETE FROM registry_entries WHERE name = ?1")
            .bind(name)
            .execute(self.db.pool())
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn resolve(&self, name: &str) -> Result<RegistryEntry, RegistryError> {
        let row = sqlx::query("SELECT * FROM registry_entries WHERE name = ?1")
            .bind(name)
            .fetch_optional(self.db.pool())
            .await
            .map_err(db_err)?
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        Self::row_to_entry(&row)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<RegistryEntry>, RegistryError> {
        let rows = sqlx::query("SELECT * FROM registry_entries")
            .fetch_all(self.db.pool())
            .await
            .map_err(db_err)?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(Self::row_to_entry(row)?);
        }
        if let Some(capability) = &filter.capability {
            entries.retain(|e| e.capabilities.iter().any(|c| c == capability));
        }
        Ok(entries)
    }

    async fn heartbeat(&self, name: &str, at_ms: u64) -> Result<(), RegistryError> {
        let result = sqlx::query(
            "UPDATE registry_entries SET last_heartbeat_ms = ?1, version = version + 1 WHERE name = ?2",
        )
        .bind(at_ms as i64)
        .bind(name)
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> RegistryEntry {
        RegistryEntry {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: 9000,
            health_port: 10000,
            capabilities: vec!["speech".to_string()],
            registered_at_ms: 0,
            last_heartbeat_ms: 0,
            version: 1,
        }
    }

    async fn backend() -> SqliteRegistryBackend {
        SqliteRegistryBackend::new(DatabaseConnection::initialize_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn register_and_resolve_round_trip() {
        let backend = backend().await;
        backend.register(entry("asr")).await.unwrap();
        let fetched = backend.resolve("asr").await.unwrap();
        assert_eq!(fetched.port, 9000);
    }

    #[tokio::test]
    async fn duplicate_register_is_rejected() {
        let backend = backend().await;
        backend.register(entry("asr")).await.unwrap();
        assert!(matches!(
            backend.register(entry("asr")).await,
            Err(RegistryError::NameTaken(_))
        ));
    }

    #[tokio::test]
    async fn heartbeat_bumps_version_and_timestamp() {
        let backend = backend().await;
        backend.register(entry("asr")).await.unwrap();
        backend.heartbeat("asr", 555).await.unwrap();
        let fetched = backend.resolve("asr").await.unwrap();
        assert_eq!(fetched.last_heartbeat_ms, 555);
        assert_eq!(fetched.version, 2);
    }

    #[tokio::test]
    async fn deregister_removes_the_row() {
        let backend = backend().await;
        backend.register(entry("asr")).await.unwrap();
        backend.deregister("asr").await.unwrap();
        assert!(matches!(
            backend.resolve("asr").await,
            Err(RegistryError::NotFound(_))
        ));
    }
}
