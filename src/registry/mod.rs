//! Service Registry (C4): live mapping from logical agent name to transport
//! endpoint, with a pluggable backend.
//!
//! [`RegistryBackend`] is the pluggable storage seam; two implementations
//! satisfy it — [`memory::InMemoryRegistryBackend`] (the default, `DashMap`
//! O(1)-lookup) and [`sqlite::SqliteRegistryBackend`] (the durable option,
//! `sqlx`-migration backed).

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::time_provider::SharedTimeProvider;

pub use memory::InMemoryRegistryBackend;
pub use sqlite::SqliteRegistryBackend;

/// Errors raised by the Service Registry.
#[derive(Debug, Error, Clone)]
pub enum RegistryError {
    /// `name` is already bound to a different live endpoint.
    #[error("name already registered: {0}")]
    NameTaken(String),

    /// No entry exists for `name`.
    #[error("agent not found: {0}")]
    NotFound(String),

    /// The entry exists but has not heartbeated within its TTL.
    #[error("agent unreachable: {0}")]
    Unreachable(String),

    /// The durable backend failed.
    #[error("registry backend error: {0}")]
    Backend(String),
}

/// One live (or recently-live) registry entry.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RegistryEntry {
    /// Logical, unique agent name.
    pub name: String,
    /// Host the agent is reachable on.
    pub host: String,
    /// Request port.
    pub port: u16,
    /// Health-probe port.
    pub health_port: u16,
    /// Capability labels this agent advertises.
    pub capabilities: Vec<String>,
    /// Unix milliseconds at which this entry was first registered.
    pub registered_at_ms: u64,
    /// Unix milliseconds of the most recent heartbeat.
    pub last_heartbeat_ms: u64,
    /// Monotonically increasing version, bumped on every heartbeat.
    pub version: u64,
}

impl RegistryEntry {
    /// The `{host, port}` pair clients dial.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Filter applied to `list`.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Only return entries advertising this capability.
    pub capability: Option<String>,
    /// Include entries that are past their heartbeat TTL.
    pub include_unreachable: bool,
}

/// Pluggable storage seam behind the [`ServiceRegistry`] facade.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Registers `entry`, first-writer-wins on `name` (resolves the
    /// `host_affinity = any` open question, `SPEC_FULL.md` §4.9).
    async fn register(&self, entry: RegistryEntry) -> Result<(), RegistryError>;

    /// Removes the binding for `name`, if any.
    async fn deregister(&self, name: &str) -> Result<(), RegistryError>;

    /// Looks up the current entry for `name`.
    async fn resolve(&self, name: &str) -> Result<RegistryEntry, RegistryError>;

    /// Lists entries matching `filter`.
    async fn list(&self, filter: &ListFilter) -> Result<Vec<RegistryEntry>, RegistryError>;

    /// Refreshes `name`'s heartbeat timestamp.
    async fn heartbeat(&self, name: &str, at_ms: u64) -> Result<(), RegistryError>;
}

/// Facade over a [`RegistryBackend`], applying the heartbeat-TTL policy that
/// is backend-agnostic (`SPEC_FULL.md` §4.4).
pub struct ServiceRegistry {
    backend: Box<dyn RegistryBackend>,
    heartbeat_ttl: std::time::Duration,
    time: SharedTimeProvider,
}

impl ServiceRegistry {
    /// Wraps `backend` with the shared staleness policy.
    #[must_use]
    pub fn new(
        backend: Box<dyn RegistryBackend>,
        heartbeat_ttl: std::time::Duration,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            backend,
            heartbeat_ttl,
            time,
        }
    }

    fn now_ms(&self) -> u64 {
        self.time
            .now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }

    /// Registers `entry`, stamping registration/heartbeat timestamps.
    pub async fn register(
        &self,
        name: String,
        host: String,
        port: u16,
        health_port: u16,
        capabilities: Vec<String>,
    ) -> Result<(), RegistryError> {
        let now = self.now_ms();
        self.backend
            .register(RegistryEntry {
                name,
                host,
                port,
                health_port,
                capabilities,
                registered_at_ms: now,
                last_heartbeat_ms: now,
                version: 1,
            })
            .await
    }

    /// Removes `name`'s binding.
    pub async fn deregister(&self, name: &str) -> Result<(), RegistryError> {
        self.backend.deregister(name).await
    }

    /// Resolves `name`, returning `Unreachable` instead of the entry if its
    /// heartbeat has gone stale (entries are retained, not deleted, for
    /// forensic query per §4.4).
    pub async fn resolve(&self, name: &str) -> Result<RegistryEntry, RegistryError> {
        let entry = self.backend.resolve(name).await?;
        let age_ms = self.now_ms().saturating_sub(entry.last_heartbeat_ms);
        if age_ms > u64::try_from(self.heartbeat_ttl.as_millis()).unwrap_or(u64::MAX) {
            return Err(RegistryError::Unreachable(name.to_string()));
        }
        Ok(entry)
    }

    /// Lists entries matching `filter`, applying the heartbeat-TTL policy
    /// unless the caller explicitly asked to see stale entries too.
    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<RegistryEntry>, RegistryError> {
        let entries = self.backend.list(filter).await?;
        if filter.include_unreachable {
            return Ok(entries);
        }
        let ttl_ms = u64::try_from(self.heartbeat_ttl.as_millis()).unwrap_or(u64::MAX);
        let now = self.now_ms();
        Ok(entries
            .into_iter()
            .filter(|e| now.saturating_sub(e.last_heartbeat_ms) <= ttl_ms)
            .collect())
    }

    /// Refreshes `name`'s liveness.
    pub async fn heartbeat(&self, name: &str) -> Result<(), RegistryError> {
        self.backend.heartbeat(name, self.now_ms()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_provider::test_time_provider;

    #[tokio::test]
    async fn resolve_returns_not_found_for_unknown_name() {
        let registry = ServiceRegistry::new(
            Box::new(InMemoryRegistryBackend::new()),
            std::time::Duration::from_secs(30),
            test_time_provider(),
        );
        let err = registry.resolve("ghost").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn register_then_resolve_round_trips() {
        let registry = ServiceRegistry::new(
            Box::new(InMemoryRegistryBackend::new()),
            std::time::Duration::from_secs(30),
            test_time_provider(),
        );
        registry
            .register(
                "asr".to_string(),
                "127.0.0.1".to_string(),
                9001,
                10001,
                vec!["speech".to_string()],
            )
            .await
            .unwrap();
        let entry = registry.resolve("asr").await.unwrap();
        assert_eq!(entry.endpoint(), "127.0.0.1:9001");
    }

    #[tokio::test]
    async fn stale_heartbeat_resolves_as_unreachable_but_list_still_shows_it() {
        let registry = ServiceRegistry::new(
            Box::new(InMemoryRegistryBackend::new()),
            std::time::Duration::from_millis(0),
            test_time_provider(),
        );
        registry
            .register("tts".to_string(), "127.0.0.1".to_string(), 9002, 10002, vec![])
            .await
            .unwrap();
        assert!(matches!(
            registry.resolve("tts").await,
            Err(RegistryError::Unreachable(_))
        ));
        let entries = registry
            .list(&ListFilter {
                include_unreachable: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn list_excludes_stale_entries_by_default() {
        let registry = ServiceRegistry::new(
            Box::new(InMemoryRegistryBackend::new()),
            std::time::Duration::from_millis(0),
            test_time_provider(),
        );
        registry
            .register("tts".to_string(), "127.0.0.1".to_string(), 9002, 10002, vec![])
            .await
            .unwrap();
        let entries = registry.list(&ListFilter::default()).await.unwrap();
        assert!(entries.is_empty());
    }
}
