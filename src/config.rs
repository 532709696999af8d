//! Runtime configuration for development and production deployments.
//!
//! Provides pre-configured settings optimized for different deployment
//! scenarios with validation and builder pattern support, plus the
//! environment-variable overlay described in `SPEC_FULL.md` §6.

#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::return_self_not_must_use
)]

use std::env;
use std::path::PathBuf;
use thiserror::Error;

use crate::domain_types::{Priority, Seconds, VramMb};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed a cross-field or range check.
    #[error("invalid configuration: {field} - {reason}")]
    Validation {
        /// Name of the offending field.
        field: String,
        /// Human-readable reason.
        reason: String,
    },

    /// Reading/writing the config file failed.
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O failure.
        #[from]
        source: std::io::Error,
    },

    /// (De)serializing the config file failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serde failure.
        #[from]
        source: serde_json::Error,
    },

    /// An environment variable overlay value could not be parsed.
    #[error("invalid environment variable {name}: {value}")]
    InvalidEnvVar {
        /// The variable's name.
        name: &'static str,
        /// The raw value that failed to parse.
        value: String,
    },
}

/// Complete runtime configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct RuntimeConfig {
    /// Path to the topology document.
    pub topology_path: PathBuf,
    /// Hostname or address of the peer machine, if this is a two-node deployment.
    pub peer_host: Option<String>,
    /// Address other agents use to reach the Service Registry.
    pub registry_endpoint: String,
    /// Total VRAM budget available to the Model Manager, in megabytes.
    pub vram_budget_mb: VramMb,
    /// Interval between health probes.
    pub probe_interval: Seconds,
    /// Grace window granted to a newly started agent before probe failures count.
    pub start_grace: Seconds,
    /// Grace window granted during orderly shutdown before force-termination.
    pub shutdown_grace: Seconds,
    /// Soft consecutive-failure threshold before an agent is marked `Degraded`.
    pub health_soft_threshold: u32,
    /// Hard consecutive-failure threshold before an agent is marked `Failed`.
    pub health_hard_threshold: u32,
    /// Heartbeat time-to-live before a registry entry is marked `Unreachable`.
    pub heartbeat_ttl: Seconds,
    /// How long a stale registry entry is retained for forensic query.
    pub registry_retain: Seconds,
    /// Circuit breaker sliding-window size.
    pub breaker_window: u32,
    /// Circuit breaker open threshold (failure ratio, 0.0-1.0).
    pub breaker_open_threshold: f64,
    /// Minimum samples before a breaker may open.
    pub breaker_min_samples: u32,
    /// Duration a breaker stays open before trying half-open.
    pub breaker_open_duration: Seconds,
    /// Cap on the breaker's exponential open-duration backoff.
    pub breaker_open_duration_cap: Seconds,
    /// Consecutive successes required to close a half-open breaker.
    pub breaker_half_open_successes: u32,
    /// Initial backoff before the first automatic restart.
    pub restart_initial_backoff: Seconds,
    /// Cap on restart backoff.
    pub restart_backoff_cap: Seconds,
    /// Maximum automatic restart attempts before giving up.
    pub max_restart_attempts: u32,
    /// Capacity of the Request Coordinator's priority queue.
    pub coordinator_queue_capacity: usize,
    /// Number of Request Coordinator worker tasks.
    pub coordinator_worker_count: usize,
    /// Idle timeout before the Model Manager unloads an unused model.
    pub model_idle_timeout: Seconds,
    /// Grace window for a model unload to complete before being forced.
    pub model_unload_grace: Seconds,
    /// Priority reserved for models that must never be auto-evicted.
    pub protected_priority: Priority,
    /// Whether the Service Registry uses the durable sqlite backend.
    pub registry_persistence_enabled: bool,
    /// Path to the sqlite database file when persistence is enabled.
    pub registry_storage_path: Option<PathBuf>,
    /// Whether structured logs are emitted as JSON (production) or pretty (development).
    pub json_logs: bool,
    /// `tracing` log level filter, e.g. `"info"`.
    pub log_level: String,
}

impl RuntimeConfig {
    /// Development defaults: short timers, verbose logs, in-memory registry.
    ///
    /// # Panics
    /// Panics if any hardcoded literal is out of range for its domain type.
    #[must_use]
    pub fn development() -> Self {
        Self {
            topology_path: PathBuf::from("./topology.yaml"),
            peer_host: None,
            registry_endpoint: "127.0.0.1:7000".to_string(),
            vram_budget_mb: VramMb::try_new(8_000).unwrap(),
            probe_interval: Seconds::try_new(5).unwrap(),
            start_grace: Seconds::try_new(60).unwrap(),
            shutdown_grace: Seconds::try_new(10).unwrap(),
            health_soft_threshold: 2,
            health_hard_threshold: 4,
            heartbeat_ttl: Seconds::try_new(15).unwrap(),
            registry_retain: Seconds::try_new(300).unwrap(),
            breaker_window: 10,
            breaker_open_threshold: 0.5,
            breaker_min_samples: 3,
            breaker_open_duration: Seconds::try_new(5).unwrap(),
            breaker_open_duration_cap: Seconds::try_new(60).unwrap(),
            breaker_half_open_successes: 2,
            restart_initial_backoff: Seconds::try_new(1).unwrap(),
            restart_backoff_cap: Seconds::try_new(30).unwrap(),
            max_restart_attempts: 5,
            coordinator_queue_capacity: 50,
            coordinator_worker_count: 2,
            model_idle_timeout: Seconds::try_new(300).unwrap(),
            model_unload_grace: Seconds::try_new(5).unwrap(),
            protected_priority: Priority::max(),
            registry_persistence_enabled: false,
            registry_storage_path: None,
            json_logs: false,
            log_level: "debug".to_string(),
        }
    }

    /// Production defaults: conservative timers, durable registry, JSON logs.
    ///
    /// # Panics
    /// Panics if any hardcoded literal is out of range for its domain type.
    #[must_use]
    pub fn production() -> Self {
        Self {
            topology_path: PathBuf::from("/etc/meridian/topology.yaml"),
            peer_host: None,
            registry_endpoint: "0.0.0.0:7000".to_string(),
            vram_budget_mb: VramMb::try_new(24_000).unwrap(),
            probe_interval: Seconds::try_new(30).unwrap(),
            start_grace: Seconds::try_new(300).unwrap(),
            shutdown_grace: Seconds::try_new(20).unwrap(),
            health_soft_threshold: 3,
            health_hard_threshold: 6,
            heartbeat_ttl: Seconds::try_new(90).unwrap(),
            registry_retain: Seconds::try_new(3_600).unwrap(),
            breaker_window: 20,
            breaker_open_threshold: 0.5,
            breaker_min_samples: 5,
            breaker_open_duration: Seconds::try_new(30).unwrap(),
            breaker_open_duration_cap: Seconds::try_new(300).unwrap(),
            breaker_half_open_successes: 3,
            restart_initial_backoff: Seconds::try_new(5).unwrap(),
            restart_backoff_cap: Seconds::try_new(300).unwrap(),
            max_restart_attempts: 5,
            coordinator_queue_capacity: 100,
            coordinator_worker_count: 4,
            model_idle_timeout: Seconds::try_new(900).unwrap(),
            model_unload_grace: Seconds::try_new(10).unwrap(),
            protected_priority: Priority::max(),
            registry_persistence_enabled: true,
            registry_storage_path: Some(PathBuf::from("/var/lib/meridian/registry.db")),
            json_logs: true,
            log_level: "info".to_string(),
        }
    }

    /// Test defaults: minimal timers so invariant/property tests run fast.
    ///
    /// # Panics
    /// Panics if any hardcoded literal is out of range for its domain type.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            topology_path: PathBuf::from("./fixtures/topology.yaml"),
            peer_host: None,
            registry_endpoint: "127.0.0.1:0".to_string(),
            vram_budget_mb: VramMb::try_new(1_000).unwrap(),
            probe_interval: Seconds::try_new(1).unwrap(),
            start_grace: Seconds::try_new(2).unwrap(),
            shutdown_grace: Seconds::try_new(1).unwrap(),
            health_soft_threshold: 1,
            health_hard_threshold: 2,
            heartbeat_ttl: Seconds::try_new(3).unwrap(),
            registry_retain: Seconds::try_new(5).unwrap(),
            breaker_window: 5,
            breaker_open_threshold: 0.5,
            breaker_min_samples: 2,
            breaker_open_duration: Seconds::try_new(1).unwrap(),
            breaker_open_duration_cap: Seconds::try_new(5).unwrap(),
            breaker_half_open_successes: 1,
            restart_initial_backoff: Seconds::try_new(1).unwrap(),
            restart_backoff_cap: Seconds::try_new(2).unwrap(),
            max_restart_attempts: 2,
            coordinator_queue_capacity: 10,
            coordinator_worker_count: 1,
            model_idle_timeout: Seconds::try_new(2).unwrap(),
            model_unload_grace: Seconds::try_new(1).unwrap(),
            protected_priority: Priority::max(),
            registry_persistence_enabled: false,
            registry_storage_path: None,
            json_logs: false,
            log_level: "trace".to_string(),
        }
    }

    /// Creates a configuration builder seeded with development defaults.
    #[must_use]
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Validates cross-field consistency beyond what the domain types enforce.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health_hard_threshold <= self.health_soft_threshold {
            return Err(ConfigError::Validation {
                field: "health_hard_threshold".to_string(),
                reason: "must be greater than health_soft_threshold".to_string(),
            });
        }
        if self.heartbeat_ttl.into_inner() < self.probe_interval.into_inner() {
            return Err(ConfigError::Validation {
                field: "heartbeat_ttl".to_string(),
                reason: "must be at least one probe interval".to_string(),
            });
        }
        if self.breaker_min_samples > self.breaker_window {
            return Err(ConfigError::Validation {
                field: "breaker_min_samples".to_string(),
                reason: "must not exceed the sliding window size".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.breaker_open_threshold) {
            return Err(ConfigError::Validation {
                field: "breaker_open_threshold".to_string(),
                reason: "must be a ratio between 0.0 and 1.0".to_string(),
            });
        }
        if self.breaker_open_duration_cap.into_inner() < self.breaker_open_duration.into_inner() {
            return Err(ConfigError::Validation {
                field: "breaker_open_duration_cap".to_string(),
                reason: "must be at least the initial open duration".to_string(),
            });
        }
        if self.restart_backoff_cap.into_inner() < self.restart_initial_backoff.into_inner() {
            return Err(ConfigError::Validation {
                field: "restart_backoff_cap".to_string(),
                reason: "must be at least the initial backoff".to_string(),
            });
        }
        if self.coordinator_worker_count == 0 {
            return Err(ConfigError::Validation {
                field: "coordinator_worker_count".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.coordinator_worker_count > num_cpus::get() * 4 {
            return Err(ConfigError::Validation {
                field: "coordinator_worker_count".to_string(),
                reason: format!("should not exceed 4x CPU cores ({})", num_cpus::get() * 4),
            });
        }
        if self.registry_persistence_enabled && self.registry_storage_path.is_none() {
            return Err(ConfigError::Validation {
                field: "registry_storage_path".to_string(),
                reason: "must be set when registry_persistence_enabled is true".to_string(),
            });
        }
        Ok(())
    }

    /// Layers the environment-variable overlay from `SPEC_FULL.md` §6 on top
    /// of an already-valid configuration.
    pub fn apply_env_overlay(mut self) -> Result<Self, ConfigError> {
        if let Ok(path) = env::var("TOPOLOGY_PATH") {
            self.topology_path = PathBuf::from(path);
        }
        if let Ok(peer) = env::var("PEER_HOST") {
            self.peer_host = Some(peer);
        }
        if let Ok(endpoint) = env::var("REGISTRY_ENDPOINT") {
            self.registry_endpoint = endpoint;
        }
        if let Ok(raw) = env::var("VRAM_BUDGET_MB") {
            let parsed: u64 = raw.parse().map_err(|_| ConfigError::InvalidEnvVar {
                name: "VRAM_BUDGET_MB",
                value: raw.clone(),
            })?;
            self.vram_budget_mb =
                VramMb::try_new(parsed).map_err(|_| ConfigError::InvalidEnvVar {
                    name: "VRAM_BUDGET_MB",
                    value: raw,
                })?;
        }
        if let Ok(raw) = env::var("PROBE_INTERVAL_S") {
            self.probe_interval = parse_seconds("PROBE_INTERVAL_S", &raw)?;
        }
        if let Ok(raw) = env::var("START_GRACE_S") {
            self.start_grace = parse_seconds("START_GRACE_S", &raw)?;
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            self.log_level = level;
        }
        self.validate()?;
        Ok(self)
    }

    /// Saves configuration to a JSON file.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Loads configuration from a JSON file and validates it.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

fn parse_seconds(name: &'static str, raw: &str) -> Result<Seconds, ConfigError> {
    let parsed: u64 = raw.parse().map_err(|_| ConfigError::InvalidEnvVar {
        name,
        value: raw.to_string(),
    })?;
    Seconds::try_new(parsed).map_err(|_| ConfigError::InvalidEnvVar {
        name,
        value: raw.to_string(),
    })
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::development()
    }
}

/// Fluent builder for a custom `RuntimeConfig`.
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Starts from development defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::development(),
        }
    }

    /// Sets the topology document path.
    #[must_use]
    pub fn topology_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.topology_path = path.into();
        self
    }

    /// Sets the VRAM budget.
    #[must_use]
    pub fn vram_budget_mb(mut self, mb: VramMb) -> Self {
        self.config.vram_budget_mb = mb;
        self
    }

    /// Sets the health probe interval.
    #[must_use]
    pub fn probe_interval(mut self, interval: Seconds) -> Self {
        self.config.probe_interval = interval;
        self
    }

    /// Sets the start grace window.
    #[must_use]
    pub fn start_grace(mut self, grace: Seconds) -> Self {
        self.config.start_grace = grace;
        self
    }

    /// Enables durable registry persistence with the given storage path.
    #[must_use]
    pub fn with_registry_persistence<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.registry_persistence_enabled = true;
        self.config.registry_storage_path = Some(path.into());
        self
    }

    /// Sets the coordinator worker pool size.
    #[must_use]
    pub fn coordinator_worker_count(mut self, count: usize) -> Self {
        self.config.coordinator_worker_count = count;
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for RuntimeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn development_config_is_valid() {
        assert!(RuntimeConfig::development().validate().is_ok());
    }

    #[test]
    fn production_config_is_valid() {
        assert!(RuntimeConfig::production().validate().is_ok());
    }

    #[test]
    fn testing_config_is_valid() {
        assert!(RuntimeConfig::testing().validate().is_ok());
    }

    #[test]
    fn builder_produces_overridden_config() {
        let config = RuntimeConfig::builder()
            .vram_budget_mb(VramMb::try_new(4_000).unwrap())
            .coordinator_worker_count(1)
            .build()
            .unwrap();
        assert_eq!(config.vram_budget_mb.into_inner(), 4_000);
        assert_eq!(config.coordinator_worker_count, 1);
    }

    #[test]
    fn validation_rejects_inverted_thresholds() {
        let mut config = RuntimeConfig::development();
        config.health_soft_threshold = 5;
        config.health_hard_threshold = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_requires_storage_path_when_persistence_enabled() {
        let mut config = RuntimeConfig::development();
        config.registry_persistence_enabled = true;
        config.registry_storage_path = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_roundtrips_through_json_file() {
        let config = RuntimeConfig::development();
        let file = NamedTempFile::new().unwrap();
        config.save_to_file(file.path()).unwrap();
        let loaded = RuntimeConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.vram_budget_mb, loaded.vram_budget_mb);
        assert_eq!(config.registry_endpoint, loaded.registry_endpoint);
    }

    #[test]
    fn env_overlay_applies_recognized_variables() {
        // SAFETY: test-only process-wide env mutation, executed serially by
        // cargo test's default single-threaded-per-test isolation is not
        // guaranteed, so this test only asserts on values it itself sets.
        unsafe {
            env::set_var("VRAM_BUDGET_MB", "2048");
        }
        let config = RuntimeConfig::testing().apply_env_overlay().unwrap();
        assert_eq!(config.vram_budget_mb.into_inner(), 2048);
        unsafe {
            env::remove_var("VRAM_BUDGET_MB");
        }
    }
}
