//! In-memory registry backend: O(1) lookup via `DashMap`.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;

use super::{ListFilter, RegistryBackend, RegistryEntry, RegistryError};

/// Default backend for single-node deployments and all unit tests.
#[derive(Debug, Default)]
pub struct InMemoryRegistryBackend {
    entries: DashMap<String, RegistryEntry>,
    capability_index: DashMap<String, HashSet<String>>,
}

impl InMemoryRegistryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn index_capabilities(&self, name: &str, capabilities: &[String]) {
        for capability in capabilities {
            self.capability_index
                .entry(capability.clone())
                .or_default()
                .insert(name.to_string());
        }
    }

    fn unindex_capabilities(&self, name: &str, capabilities: &[String]) {
        for capability in capabilities {
            if let Some(mut names) = self.capability_index.get_mut(capability) {
                names.remove(name);
                if names.is_empty() {
                    drop(names);
                    self.capability_index.remove(capability);
                }
            }
        }
    }
}

#[async_trait]
impl RegistryBackend for InMemoryRegistryBackend {
    async fn register(&self, entry: RegistryEntry) -> Result<(), RegistryError> {
        // First-writer-wins: `entry()` only inserts if vacant, implementing
        // the compare-and-set semantics `host_affinity = any` relies on.
        let name = entry.name.clone();
        let capabilities = entry.capabilities.clone();
        let mut inserted = false;
        self.entries.entry(name.clone()).or_insert_with(|| {
            inserted = true;
            entry
        });
        if !inserted {
            return Err(RegistryError::NameTaken(name));
        }
        self.index_capabilities(&name, &capabilities);
        Ok(())
    }

    async fn deregister(&self, name: &str) -> Result<(), RegistryError> {
        let (_, entry) = self
            .entries
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        self.unindex_capabilities(name, &entry.capabilities);
        Ok(())
    }

    async fn resolve(&self, name: &str) -> Result<RegistryEntry, RegistryError> {
        self.entries
            .get(name)
            .map(|e| e.clone())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<RegistryEntry>, RegistryError> {
        let names: Option<HashSet<String>> = filter
            .capability
            .as_ref()
            .map(|cap| self.capability_index.get(cap).map_or_else(HashSet::new, |s| s.clone()));

        Ok(self
            .entries
            .iter()
            .filter(|e| names.as_ref().is_none_or(|n| n.contains(e.key())))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn heartbeat(&self, name: &str, at_ms: u64) -> Result<(), RegistryError> {
        let mut entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        entry.last_heartbeat_ms = at_ms;
        entry.version += 1;
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

    #[tokio::test]
    async fn second_register_of_same_name_is_rejected_first_writer_wins() {
        let backend = InMemoryRegistryBackend::new();
        backend.register(entry("asr")).await.unwrap();
        let err = backend.register(entry("asr")).await.unwrap_err();
        assert!(matches!(err, RegistryError::NameTaken(_)));
    }

    #[tokio::test]
    async fn deregister_cleans_up_capability_index() {
        let backend = InMemoryRegistryBackend::new();
        backend.register(entry("asr")).await.unwrap();
        backend.deregister("asr").await.unwrap();
        let results = backend
            .list(&ListFilter {
                capability: Some("speech".to_string()),
                include_unreachable: true,
            })
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn find_by_capability_returns_matching_entries_only() {
        let backend = InMemoryRegistryBackend::new();
        backend.register(entry("asr")).await.unwrap();
        let mut other = entry("tts");
        other.capabilities = vec!["voice".to_string()];
        backend.register(other).await.unwrap();

        let results = backend
            .list(&ListFilter {
                capability: Some("speech".to_string()),
                include_unreachable: true,
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "asr");
    }
}
