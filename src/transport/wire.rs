//! Tagged wire formats for the health-probe, registry, and model-manager
//! protocols (`SPEC_FULL.md` §6).
//!
//! Every request/response pair is an internally-tagged `serde` enum decoded
//! once at the transport boundary; nothing downstream dispatches on a raw
//! string (`SPEC_FULL.md` §9 "dynamic dispatch over stringly-typed actions").

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain_types::{ModelId, RequestId};

/// Envelope carried by every `RequestReply` message, regardless of payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Correlates a reply with its request and, end to end, a client request
    /// with any downstream request it spawned (§5 "deadline propagation").
    pub request_id: RequestId,
    /// Unix milliseconds after which the sender considers the request dead.
    pub deadline_unix_ms: u64,
    /// Logical name of the agent or component that issued the request.
    pub sender_name: String,
    /// The tagged payload.
    pub payload: T,
}

/// Health-probe wire request (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HealthRequest {
    /// Shallow liveness check.
    Ping,
    /// Deep check: verify the agent's own upstream dependencies too.
    HealthCheck,
}

/// Health-probe wire response (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Coarse status as reported by the probed agent.
    pub status: HealthWireStatus,
    /// Unix milliseconds at which the agent first became ready.
    pub ready_since: u64,
    /// Per-dependency status, only populated for `HealthCheck` requests.
    pub deps: HashMap<String, HealthWireStatus>,
    /// Seconds since the agent process started.
    pub uptime_s: u64,
}

/// Status vocabulary used on the health-probe wire (distinct from the
/// supervisor's internal `HealthState` so the wire format is stable even if
/// the internal state machine grows states).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthWireStatus {
    /// Everything the agent depends on is reachable and responding.
    Ok,
    /// The agent is up but degraded (a non-critical dependency is failing).
    Degraded,
    /// The agent considers itself unable to serve requests.
    Failing,
}

/// Service Registry wire request (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RegistryRequest {
    /// Bind a name to an endpoint.
    Register {
        /// Logical agent name.
        name: String,
        /// Host the agent is reachable on.
        host: String,
        /// Request port.
        port: u16,
        /// Health-probe port.
        health_port: u16,
        /// Capability labels this agent advertises.
        capabilities: Vec<String>,
    },
    /// Release a previously registered binding.
    Deregister {
        /// Logical agent name.
        name: String,
    },
    /// Look up an agent's endpoint.
    Resolve {
        /// Logical agent name.
        name: String,
    },
    /// List all known entries, optionally filtered by capability.
    List {
        /// Optional capability filter.
        capability: Option<String>,
    },
    /// Refresh an entry's liveness.
    Heartbeat {
        /// Logical agent name.
        name: String,
    },
}

/// Service Registry wire response envelope (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RegistryResponse {
    /// The operation succeeded.
    Ok {
        /// Operation-specific payload, as JSON.
        data: serde_json::Value,
    },
    /// The operation failed.
    Error {
        /// Human-readable failure reason.
        message: String,
    },
}

/// Model Manager wire request (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ModelRequest {
    /// Ensure a model is loaded.
    LoadModel {
        /// Identifier of the model to load.
        model_id: ModelId,
        /// Opaque backend-specific load context.
        context: serde_json::Value,
    },
    /// Release a loaded model.
    UnloadModel {
        /// Identifier of the model to unload.
        model_id: ModelId,
    },
    /// Query the status of one model, or all models if omitted.
    GetModelStatus {
        /// Identifier of the model to query, or `None` for all models.
        model_id: Option<ModelId>,
    },
}

/// Supervisor control-plane wire request, used by `meridian-cli` to talk to
/// a running `meridian-supervisor` process (§6 CLI surface).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Requests orderly shutdown of the whole supervisor.
    Stop,
    /// Requests the lifecycle phase of every known agent.
    Status,
    /// Forces an immediate restart of one agent.
    Restart {
        /// Name of the agent to restart.
        agent: String,
    },
    /// Requests detailed runtime state for one agent.
    Inspect {
        /// Name of the agent to inspect.
        agent: String,
    },
}

/// Supervisor control-plane wire response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlResponse {
    /// The operation succeeded.
    Ok {
        /// Operation-specific payload, as JSON.
        data: serde_json::Value,
    },
    /// The named agent is unknown to this supervisor.
    UnknownAgent {
        /// The name that did not resolve.
        name: String,
    },
    /// The operation failed.
    Error {
        /// Human-readable failure reason.
        message: String,
    },
}

/// Model Manager wire response (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModelResponse {
    /// The model is now loaded.
    Loaded,
    /// The request was accepted but the model is queued pending VRAM.
    Queued,
    /// No feasible admission exists even after considering eviction.
    Infeasible,
    /// The model was unloaded.
    Unloaded,
    /// The model was not loaded, so there was nothing to unload.
    NotLoaded,
    /// The backend adapter failed.
    Error {
        /// Human-readable failure detail.
        detail: String,
    },
}
