//! Backend adapters: the uniform interface the Model Manager drives
//! regardless of where a model actually executes (`SPEC_FULL.md` §4.8).

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

use crate::domain_types::ModelId;
use crate::transport::RequestReply;

/// An adapter failure, distinguishing retryable conditions from permanent
/// ones so only the former are retried at the adapter layer.
#[derive(Debug, Error, Clone)]
pub enum AdapterError {
    /// The backend is momentarily unavailable; the caller may retry.
    #[error("transient adapter failure: {0}")]
    Transient(String),

    /// The backend rejected the request outright; retrying will not help.
    #[error("permanent adapter failure: {0}")]
    Permanent(String),
}

/// Static description of a backend's serving characteristics, surfaced to
/// `status`/`inspect`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BackendDescription {
    /// How this adapter serves the model (e.g. `"inproc_gguf"`).
    pub serving_method: String,
    /// Capability tags the backend claims (e.g. `"streaming"`).
    pub caps: Vec<String>,
}

/// Uniform interface over however a model actually executes.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Loads `model_id` with `params`, blocking until it is ready to serve.
    async fn load(&self, model_id: &ModelId, params: &serde_json::Value) -> Result<(), AdapterError>;

    /// Unloads `model_id`, releasing whatever resources the backend holds.
    async fn unload(&self, model_id: &ModelId) -> Result<(), AdapterError>;

    /// Runs one inference call against an already-loaded model.
    async fn infer(&self, model_id: &ModelId, payload: serde_json::Value) -> Result<serde_json::Value, AdapterError>;

    /// Static description of this adapter.
    fn describe(&self) -> BackendDescription;
}

/// In-process GGUF backend, served by a native inference library linked
/// directly into this process. Modeled here as a lightweight state holder;
/// the actual tensor runtime is out of scope (§1 Non-goals do not bind this
/// ambient adapter boundary, only the feature of which runtime ships).
#[derive(Debug, Default)]
pub struct InprocGgufAdapter;

#[async_trait]
impl ModelBackend for InprocGgufAdapter {
    async fn load(&self, _model_id: &ModelId, _params: &serde_json::Value) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn unload(&self, _model_id: &ModelId) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn infer(&self, _model_id: &ModelId, payload: serde_json::Value) -> Result<serde_json::Value, AdapterError> {
        Ok(payload)
    }

    fn describe(&self) -> BackendDescription {
        BackendDescription {
            serving_method: "inproc_gguf".to_string(),
            caps: vec!["streaming".to_string()],
        }
    }
}

/// Backend reached over a local HTTP API (e.g. an already-running
/// llama.cpp server), via the same `RequestReply` abstraction the
/// supervisor uses for health probes.
pub struct HttpApiAdapter {
    transport: std::sync::Arc<dyn RequestReply>,
    endpoint: String,
    request_timeout: Duration,
}

impl HttpApiAdapter {
    /// Creates an adapter targeting `endpoint` through `transport`.
    #[must_use]
    pub fn new(transport: std::sync::Arc<dyn RequestReply>, endpoint: String, request_timeout: Duration) -> Self {
        Self {
            transport,
            endpoint,
            request_timeout,
        }
    }
}

#[async_trait]
impl ModelBackend for HttpApiAdapter {
    async fn load(&self, model_id: &ModelId, params: &serde_json::Value) -> Result<(), AdapterError> {
        let payload = serde_json::json!({ "action": "load", "model_id": model_id.to_string(), "params": params });
        let body = serde_json::to_vec(&payload).map_err(|e| AdapterError::Permanent(e.to_string()))?;
        self.transport
            .request(&self.endpoint, body, self.request_timeout)
            .await
            .map(|_| ())
            .map_err(|e| AdapterError::Transient(e.to_string()))
    }

    async fn unload(&self, model_id: &ModelId) -> Result<(), AdapterError> {
        let payload = serde_json::json!({ "action": "unload", "model_id": model_id.to_string() });
        let body = serde_json::to_vec(&payload).map_err(|e| AdapterError::Permanent(e.to_string()))?;
        self.transport
            .request(&self.endpoint, body, self.request_timeout)
            .await
            .map(|_| ())
            .map_err(|e| AdapterError::Transient(e.to_string()))
    }

    async fn infer(&self, model_id: &ModelId, payload: serde_json::Value) -> Result<serde_json::Value, AdapterError> {
        let request = serde_json::json!({ "action": "infer", "model_id": model_id.to_string(), "payload": payload });
        let body = serde_json::to_vec(&request).map_err(|e| AdapterError::Permanent(e.to_string()))?;
        let reply = self
            .transport
            .request(&self.endpoint, body, self.request_timeout)
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;
        serde_json::from_slice(&reply).map_err(|e| AdapterError::Permanent(e.to_string()))
    }

    fn describe(&self) -> BackendDescription {
        BackendDescription {
            serving_method: "http_api".to_string(),
            caps: vec!["batching".to_string()],
        }
    }
}

/// Backend managed as a subprocess owned by this process (e.g. a local
/// `ollama run` invocation). `load`/`unload` spawn/terminate the subprocess;
/// `infer` is expected to go through a sidecar `HttpApiAdapter` in practice,
/// but is implemented directly here for standalone use.
pub struct SubprocessOllamaAdapter {
    executable: String,
}

impl SubprocessOllamaAdapter {
    /// Creates an adapter that shells out to `executable` (e.g. `"ollama"`).
    #[must_use]
    pub fn new(executable: String) -> Self {
        Self { executable }
    }
}

#[async_trait]
impl ModelBackend for SubprocessOllamaAdapter {
    async fn load(&self, model_id: &ModelId, _params: &serde_json::Value) -> Result<(), AdapterError> {
        let status = Command::new(&self.executable)
            .arg("pull")
            .arg(model_id.to_string())
            .status()
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(AdapterError::Permanent(format!(
                "{} pull exited with {status}",
                self.executable
            )))
        }
    }

    async fn unload(&self, model_id: &ModelId) -> Result<(), AdapterError> {
        let status = Command::new(&self.executable)
            .arg("stop")
            .arg(model_id.to_string())
            .status()
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(AdapterError::Permanent(format!(
                "{} stop exited with {status}",
                self.executable
            )))
        }
    }

    async fn infer(&self, _model_id: &ModelId, _payload: serde_json::Value) -> Result<serde_json::Value, AdapterError> {
        Err(AdapterError::Permanent(
            "subprocess adapter does not serve inference directly; pair it with an HTTP adapter".to_string(),
        ))
    }

    fn describe(&self) -> BackendDescription {
        BackendDescription {
            serving_method: "subprocess_ollama".to_string(),
            caps: vec![],
        }
    }
}

/// Backend delegated to the peer node over the cross-machine router, for
/// models whose `host_affinity` pins them to the other machine.
pub struct RemoteRpcAdapter {
    transport: std::sync::Arc<dyn RequestReply>,
    peer_endpoint: String,
    request_timeout: Duration,
}

impl RemoteRpcAdapter {
    /// Creates an adapter forwarding to `peer_endpoint`.
    #[must_use]
    pub fn new(transport: std::sync::Arc<dyn RequestReply>, peer_endpoint: String, request_timeout: Duration) -> Self {
        Self {
            transport,
            peer_endpoint,
            request_timeout,
        }
    }
}

#[async_trait]
impl ModelBackend for RemoteRpcAdapter {
    async fn load(&self, model_id: &ModelId, params: &serde_json::Value) -> Result<(), AdapterError> {
        let payload = serde_json::json!({ "action": "load_model", "model_id": model_id.to_string(), "context": params });
        let body = serde_json::to_vec(&payload).map_err(|e| AdapterError::Permanent(e.to_string()))?;
        self.transport
            .request(&self.peer_endpoint, body, self.request_timeout)
            .await
            .map(|_| ())
            .map_err(|e| AdapterError::Transient(e.to_string()))
    }

    async fn unload(&self, model_id: &ModelId) -> Result<(), AdapterError> {
        let payload = serde_json::json!({ "action": "unload_model", "model_id": model_id.to_string() });
        let body = serde_json::to_vec(&payload).map_err(|e| AdapterError::Permanent(e.to_string()))?;
        self.transport
            .request(&self.peer_endpoint, body, self.request_timeout)
            .await
            .map(|_| ())
            .map_err(|e| AdapterError::Transient(e.to_string()))
    }

    async fn infer(&self, model_id: &ModelId, payload: serde_json::Value) -> Result<serde_json::Value, AdapterError> {
        let request = serde_json::json!({ "action": "infer", "model_id": model_id.to_string(), "payload": payload });
        let body = serde_json::to_vec(&request).map_err(|e| AdapterError::Permanent(e.to_string()))?;
        let reply = self
            .transport
            .request(&self.peer_endpoint, body, self.request_timeout)
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;
        serde_json::from_slice(&reply).map_err(|e| AdapterError::Permanent(e.to_string()))
    }

    fn describe(&self) -> BackendDescription {
        BackendDescription {
            serving_method: "remote_rpc".to_string(),
            caps: vec!["cross_machine".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inproc_adapter_echoes_the_payload() {
        let adapter = InprocGgufAdapter;
        let model_id = ModelId::try_new("llama").unwrap();
        let out = adapter
            .infer(&model_id, serde_json::json!({"prompt": "hi"}))
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!({"prompt": "hi"}));
    }

    #[test]
    fn describe_reports_a_stable_serving_method() {
        assert_eq!(InprocGgufAdapter.describe().serving_method, "inproc_gguf");
    }
}
