//! Top-level error taxonomy.
//!
//! Each subsystem defines its own `thiserror` enum at its module boundary
//! (`circuit_breaker::BreakerError`, `registry::RegistryError`,
//! `model_manager::ModelError`, `supervisor::SupervisorError`, ...); this
//! module aggregates them into the one error the binary and CLI boundary
//! actually matches on, so exit codes (§6) and Error Bus records (§4.2) have
//! a single place to classify severity.

use thiserror::Error;

use crate::circuit_breaker::BreakerError;
use crate::config::ConfigError;
use crate::database::DatabaseError;
use crate::model_manager::ModelError;
use crate::registry::RegistryError;
use crate::supervisor::topology::TopologyError;
use crate::supervisor::SupervisorError;
use crate::transport::TransportError;

/// Aggregate error for the runtime, used at the binary/CLI boundary and as
/// the payload type published on the Error Bus.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Topology document failed to parse or validate.
    #[error("topology invalid: {0}")]
    TopologyInvalid(#[from] TopologyError),

    /// The runtime configuration failed validation or could not be loaded.
    #[error("configuration invalid: {0}")]
    ConfigInvalid(#[from] ConfigError),

    /// The embedded database failed to open or migrate.
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// The agent supervisor hit an unrecoverable condition.
    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// The service registry rejected an operation.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The model manager rejected or failed an operation.
    #[error("model manager error: {0}")]
    Model(#[from] ModelError),

    /// A circuit breaker rejected a call.
    #[error("circuit breaker error: {0}")]
    Breaker(#[from] BreakerError),

    /// A transport-layer failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The request queue is full.
    #[error("request queue overloaded")]
    Overloaded,

    /// A request was canceled, either by the client or by its deadline.
    #[error("request canceled: {0}")]
    Canceled(String),

    /// A message did not conform to the expected wire schema.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Wraps lower-level I/O failures (file reads, socket setup).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Severity band attached to every `ErrorRecord` published on the Error Bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational; no operator action implied.
    Info,
    /// Something degraded but the system is still making progress.
    Warn,
    /// An operation failed outright.
    Error,
    /// Requires immediate operator attention (§7 "critical").
    Critical,
}

impl RuntimeError {
    /// Maps an error to the severity it should be published with on the
    /// Error Bus (§4.2, §7).
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            RuntimeError::TopologyInvalid(_)
            | RuntimeError::ConfigInvalid(_)
            | RuntimeError::Database(_)
            | RuntimeError::Supervisor(_) => Severity::Critical,
            RuntimeError::Model(_) | RuntimeError::Registry(_) => Severity::Error,
            RuntimeError::Breaker(_) | RuntimeError::Transport(_) | RuntimeError::Overloaded => {
                Severity::Warn
            }
            RuntimeError::Canceled(_) | RuntimeError::Protocol(_) | RuntimeError::Io(_) => {
                Severity::Info
            }
        }
    }

    /// Maps an error to the CLI exit code it corresponds to (§6), when it
    /// originates at the start/validate boundary. Errors raised after
    /// startup (breaker, overload, ...) have no dedicated exit code and fall
    /// back to `1`.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            RuntimeError::TopologyInvalid(_) => 3,
            RuntimeError::Supervisor(SupervisorError::DependencyTimeout { .. }) => 4,
            RuntimeError::Supervisor(SupervisorError::RequiredAgentFailed { .. }) => 5,
            _ => 1,
        }
    }
}
