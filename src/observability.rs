//! Observability Hub (C11): subscribes to the Error Bus and every agent's
//! Health Prober, maintains rolling per-agent metrics, a bounded event feed,
//! and periodic resource snapshots, and exposes all three as read-only
//! `axum` routes for the out-of-scope dashboard UI (`SPEC_FULL.md` §4.11).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error_bus::{ErrorBus, ErrorRecord};
use crate::health::{AgentHealthState, HealthSnapshot};
use crate::time_provider::SharedTimeProvider;

/// One CPU/RAM/VRAM sample of the whole node.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ResourceSnapshot {
    /// Overall CPU utilization, 0.0-100.0.
    pub cpu_percent: f64,
    /// Resident memory in use, in megabytes.
    pub ram_mb: u64,
    /// VRAM in use per device name, in megabytes.
    pub vram_mb_per_device: HashMap<String, u64>,
    /// Unix milliseconds this sample was taken.
    pub sampled_at_ms: u64,
}

/// Something that can produce a fresh [`ResourceSnapshot`] on demand; the
/// concrete sampler (reading `/proc`, `nvidia-smi`, or a platform API) lives
/// outside this module's scope and is injected here.
pub trait ResourceSampler: Send + Sync {
    /// Takes one sample of current resource usage.
    fn sample(&self) -> ResourceSnapshot;
}

/// An entry in the bounded event feed.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservabilityEvent {
    /// A structured error published on the Error Bus.
    Error(ErrorRecord),
    /// A health snapshot from an agent's prober.
    Health(HealthSnapshot),
}

/// Rolling request-rate, error-rate, and latency stats for one agent, plus a
/// histogram of observed health states.
#[derive(Debug, Default)]
struct AgentMetrics {
    request_count: u64,
    error_count: u64,
    /// Bounded window of recent latencies, used to compute percentiles.
    recent_latencies_ms: VecDeque<u64>,
    health_histogram: HashMap<AgentHealthState, u64>,
}

const LATENCY_WINDOW: usize = 500;

impl AgentMetrics {
    fn record_request(&mut self, latency_ms: u64, is_error: bool) {
        self.request_count += 1;
        if is_error {
            self.error_count += 1;
        }
        if self.recent_latencies_ms.len() == LATENCY_WINDOW {
            self.recent_latencies_ms.pop_front();
        }
        self.recent_latencies_ms.push_back(latency_ms);
    }

    fn record_health(&mut self, status: AgentHealthState) {
        *self.health_histogram.entry(status).or_insert(0) += 1;
    }

    fn percentile(&self, p: f64) -> u64 {
        if self.recent_latencies_ms.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.recent_latencies_ms.iter().copied().collect();
        sorted.sort_unstable();
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let index = ((sorted.len() - 1) as f64 * p).round() as usize;
        sorted[index.min(sorted.len() - 1)]
    }
}

/// Public, serializable view of one agent's rolling metrics.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AgentMetricsSnapshot {
    /// Total requests observed.
    pub request_count: u64,
    /// Total requests that ended in an error.
    pub error_count: u64,
    /// Median observed latency, in milliseconds.
    pub p50_latency_ms: u64,
    /// 95th-percentile observed latency, in milliseconds.
    pub p95_latency_ms: u64,
    /// How many times each health state was observed.
    pub health_histogram: HashMap<AgentHealthState, u64>,
}

/// Maintains per-agent rolling metrics behind one mutex per agent (sharded
/// by a `DashMap`, mirroring the Model Manager's per-key locking).
#[derive(Default)]
struct MetricsRegistry {
    by_agent: DashMap<String, Mutex<AgentMetrics>>,
}

impl MetricsRegistry {
    async fn record_request(&self, agent_name: &str, latency_ms: u64, is_error: bool) {
        let entry = self.by_agent.entry(agent_name.to_string()).or_default();
        entry.lock().await.record_request(latency_ms, is_error);
    }

    async fn record_health(&self, agent_name: &str, status: AgentHealthState) {
        let entry = self.by_agent.entry(agent_name.to_string()).or_default();
        entry.lock().await.record_health(status);
    }

    async fn snapshot(&self, agent_name: &str) -> Option<AgentMetricsSnapshot> {
        let entry = self.by_agent.get(agent_name)?;
        let metrics = entry.lock().await;
        Some(AgentMetricsSnapshot {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            p50_latency_ms: metrics.percentile(0.50),
            p95_latency_ms: metrics.percentile(0.95),
            health_histogram: metrics.health_histogram.clone(),
        })
    }
}

/// Tunables for the hub's background sampling.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// How often a [`ResourceSnapshot`] is taken.
    pub resource_sample_interval: Duration,
    /// Maximum number of events retained in the ring buffer.
    pub event_feed_capacity: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            resource_sample_interval: Duration::from_secs(5),
            event_feed_capacity: 1000,
        }
    }
}

/// The Observability Hub: aggregates errors, health, and resource usage for
/// both this process and, when configured, a peer hub on the other machine.
pub struct ObservabilityHub {
    metrics: Arc<MetricsRegistry>,
    events: Arc<Mutex<VecDeque<ObservabilityEvent>>>,
    resources: Arc<Mutex<ResourceSnapshot>>,
    config: ObservabilityConfig,
    time: SharedTimeProvider,
    peer_hub_endpoint: Option<String>,
}

impl ObservabilityHub {
    /// Creates a hub. `peer_hub_endpoint` is `Some` only on a two-machine
    /// deployment; when set, [`Self::is_aggregating`] reports `true`.
    #[must_use]
    pub fn new(
        config: ObservabilityConfig,
        time: SharedTimeProvider,
        peer_hub_endpoint: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            metrics: Arc::new(MetricsRegistry::default()),
            events: Arc::new(Mutex::new(VecDeque::with_capacity(config.event_feed_capacity))),
            resources: Arc::new(Mutex::new(ResourceSnapshot::default())),
            config,
            time,
            peer_hub_endpoint,
        })
    }

    /// Whether this hub aggregates a peer's metrics into its reported view.
    #[must_use]
    pub fn is_aggregating(&self) -> bool {
        self.peer_hub_endpoint.is_some()
    }

    async fn push_event(&self, event: ObservabilityEvent) {
        let mut events = self.events.lock().await;
        if events.len() == self.config.event_feed_capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Records one completed request's outcome against `agent_name`'s
    /// rolling metrics.
    pub async fn record_request(&self, agent_name: &str, latency_ms: u64, is_error: bool) {
        self.metrics.record_request(agent_name, latency_ms, is_error).await;
    }

    /// Callback suitable for [`crate::health::HealthProber::run`]'s
    /// `on_snapshot` parameter: records the health histogram sample and
    /// appends the snapshot to the event feed.
    pub fn health_sink(self: &Arc<Self>) -> impl Fn(HealthSnapshot) + Send + 'static {
        let hub = Arc::clone(self);
        move |snapshot: HealthSnapshot| {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                hub.metrics.record_health(&snapshot.agent_name, snapshot.status).await;
                hub.push_event(ObservabilityEvent::Health(snapshot)).await;
            });
        }
    }

    /// Spawns a task that drains `error_bus` into the event feed until the
    /// bus is dropped.
    pub fn subscribe_error_bus(self: &Arc<Self>, error_bus: &Arc<ErrorBus>) {
        let hub = Arc::clone(self);
        let receiver = error_bus.subscribe();
        tokio::spawn(hub.drain_error_bus_loop(receiver));
    }

    #[tracing::instrument(skip(self, receiver))]
    async fn drain_error_bus_loop(
        self: Arc<Self>,
        mut receiver: tokio::sync::broadcast::Receiver<ErrorRecord>,
    ) {
        loop {
            match receiver.recv().await {
                Ok(record) => self.push_event(ObservabilityEvent::Error(record)).await,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Spawns the periodic resource-sampling task, running until `shutdown`
    /// resolves.
    pub fn spawn_resource_sampler(
        self: &Arc<Self>,
        sampler: Arc<dyn ResourceSampler>,
        mut shutdown: tokio::sync::oneshot::Receiver<()>,
    ) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = hub.time.sleep(hub.config.resource_sample_interval) => {
                        hub.sample_once(&sampler).await;
                    }
                    _ = &mut shutdown => break,
                }
            }
        });
    }

    #[tracing::instrument(skip(self, sampler))]
    async fn sample_once(&self, sampler: &Arc<dyn ResourceSampler>) {
        let mut snapshot = sampler.sample();
        snapshot.sampled_at_ms = self.now_ms();
        *self.resources.lock().await = snapshot;
    }

    fn now_ms(&self) -> u64 {
        self.time
            .now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }

    /// Drains the full event feed as a `Vec`, oldest first.
    pub async fn drain_events(&self) -> Vec<ObservabilityEvent> {
        self.events.lock().await.drain(..).collect()
    }

    /// Current rolling metrics for `agent_name`, if any requests or health
    /// samples have been recorded for it.
    pub async fn agent_metrics(&self, agent_name: &str) -> Option<AgentMetricsSnapshot> {
        self.metrics.snapshot(agent_name).await
    }

    /// The most recent [`ResourceSnapshot`].
    pub async fn latest_resources(&self) -> ResourceSnapshot {
        self.resources.lock().await.clone()
    }

    /// Builds the read-only `axum` router: `GET /events`, `GET
    /// /metrics/:agent`, `GET /resources` (§4.11 HTTP read surface).
    #[must_use]
    pub fn http_router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/events", get(get_events))
            .route("/metrics/{agent}", get(get_agent_metrics))
            .route("/resources", get(get_resources))
            .with_state(Arc::clone(self))
    }
}

async fn get_events(State(hub): State<Arc<ObservabilityHub>>) -> Json<Vec<ObservabilityEvent>> {
    Json(hub.drain_events().await)
}

async fn get_agent_metrics(
    State(hub): State<Arc<ObservabilityHub>>,
    Path(agent): Path<String>,
) -> Json<Option<AgentMetricsSnapshot>> {
    Json(hub.agent_metrics(&agent).await)
}

async fn get_resources(State(hub): State<Arc<ObservabilityHub>>) -> Json<ResourceSnapshot> {
    Json(hub.latest_resources().await)
}
