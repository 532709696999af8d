//! Health Prober (C5): periodic liveness + readiness probes, deep-dependency
//! probes, and status publication to Observability.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreaker;
use crate::domain_types::ConsecutiveCount;
use crate::time_provider::SharedTimeProvider;
use crate::transport::wire::{HealthRequest, HealthResponse, HealthWireStatus};
use crate::transport::RequestReply;

/// A health snapshot published after every probe (`SPEC_FULL.md` §3.1).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HealthSnapshot {
    /// Agent the snapshot belongs to.
    pub agent_name: String,
    /// Coarse classification derived from consecutive-failure counts.
    pub status: AgentHealthState,
    /// Unix milliseconds the agent has reported as its ready-since time.
    pub ready_since_ms: u64,
    /// Per-dependency status, when a deep probe was performed.
    pub deps: HashMap<String, HealthWireStatus>,
    /// Process uptime as reported by the agent.
    pub uptime_s: u64,
    /// Round-trip latency of the probe itself.
    pub probe_latency_ms: u64,
}

/// Classification derived from consecutive probe outcomes (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealthState {
    /// Below the soft failure threshold.
    Ready,
    /// At or above the soft threshold but below the hard threshold.
    Degraded,
    /// At or above the hard threshold.
    Failed,
}

/// Tunables for one agent's prober task.
#[derive(Debug, Clone, Copy)]
pub struct ProberConfig {
    /// Interval between probes.
    pub interval: Duration,
    /// Timeout for a single probe round-trip.
    pub probe_timeout: Duration,
    /// Consecutive failures before `Degraded`.
    pub soft_threshold: u32,
    /// Consecutive failures before `Failed`.
    pub hard_threshold: u32,
}

/// Probes a single agent's health endpoint on a fixed interval, recording
/// outcomes with its circuit breaker and publishing a [`HealthSnapshot`]
/// after every round.
pub struct HealthProber {
    agent_name: String,
    health_endpoint: String,
    config: ProberConfig,
    transport: Arc<dyn RequestReply>,
    breaker: Arc<CircuitBreaker>,
    time: SharedTimeProvider,
    consecutive_failures: std::sync::atomic::AtomicU32,
}

impl HealthProber {
    /// Creates a prober for `agent_name`, reachable at `health_endpoint`.
    #[must_use]
    pub fn new(
        agent_name: String,
        health_endpoint: String,
        config: ProberConfig,
        transport: Arc<dyn RequestReply>,
        breaker: Arc<CircuitBreaker>,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            agent_name,
            health_endpoint,
            config,
            transport,
            breaker,
            time,
            consecutive_failures: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Runs one probe round-trip and returns the resulting snapshot,
    /// updating the breaker and the consecutive-failure counter.
    #[tracing::instrument(skip(self), fields(agent = %self.agent_name))]
    pub async fn probe_once(&self) -> HealthSnapshot {
        let started = self.time.instant();
        let request = HealthRequest::Ping;
        let payload = serde_json::to_vec(&request).unwrap_or_default();

        let outcome = self
            .transport
            .request(&self.health_endpoint, payload, self.config.probe_timeout)
            .await
            .ok()
            .and_then(|bytes| serde_json::from_slice::<HealthResponse>(&bytes).ok());

        let latency_ms = u64::try_from(self.time.instant().duration_since(started).as_millis())
            .unwrap_or(u64::MAX);

        match outcome {
            Some(response) => {
                self.breaker.record_success().await;
                self.consecutive_failures
                    .store(0, std::sync::atomic::Ordering::Relaxed);
                HealthSnapshot {
                    agent_name: self.agent_name.clone(),
                    status: AgentHealthState::Ready,
                    ready_since_ms: response.ready_since,
                    deps: response.deps,
                    uptime_s: response.uptime_s,
                    probe_latency_ms: latency_ms,
                }
            }
            None => {
                self.breaker.record_failure().await;
                let failures = ConsecutiveCount::new(
                    self.consecutive_failures
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                        + 1,
                );
                let status = if failures.into_inner() >= self.config.hard_threshold {
                    AgentHealthState::Failed
                } else if failures.into_inner() >= self.config.soft_threshold {
                    AgentHealthState::Degraded
                } else {
                    AgentHealthState::Ready
                };
                HealthSnapshot {
                    agent_name: self.agent_name.clone(),
                    status,
                    ready_since_ms: 0,
                    deps: HashMap::new(),
                    uptime_s: 0,
                    probe_latency_ms: latency_ms,
                }
            }
        }
    }

    /// Issues a deep-dependency probe, instructing the agent to verify its
    /// own upstream dependencies before reporting aggregated status.
    pub async fn deep_probe(&self) -> Option<HealthResponse> {
        let payload = serde_json::to_vec(&HealthRequest::HealthCheck).ok()?;
        let reply = self
            .transport
            .request(&self.health_endpoint, payload, self.config.probe_timeout)
            .await
            .ok()?;
        serde_json::from_slice(&reply).ok()
    }

    /// Runs the probe loop until `shutdown` resolves, sleeping `interval`
    /// between rounds via the injected `TimeProvider` so tests can skip
    /// delays.
    #[tracing::instrument(skip(self, shutdown, on_snapshot), fields(agent = %self.agent_name))]
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: tokio::sync::oneshot::Receiver<()>,
        on_snapshot: impl Fn(HealthSnapshot) + Send + 'static,
    ) {
        loop {
            tokio::select! {
                () = self.time.sleep(self.config.interval) => {
                    let snapshot = self.probe_once().await;
                    on_snapshot(snapshot);
                }
                _ = &mut shutdown => break,
            }
        }
    }
}
