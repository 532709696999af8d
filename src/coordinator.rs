//! Request Coordinator (C10): a bounded priority queue drained by a pool of
//! cooperative workers, each resolving the destination via the Service
//! Registry, checking out its Circuit Breaker, and issuing the downstream
//! call — falling back to an alternate agent sharing the requested
//! capability on `CircuitOpen`/`Timeout` (`SPEC_FULL.md` §4.10).
//!
//! Workers share [`crate::circuit_breaker`] state per endpoint, checking out
//! a breaker before every downstream call.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::circuit_breaker::{BreakerConfig, BreakerError, CircuitBreaker};
use crate::domain_types::{AgentName, Priority, RequestId};
use crate::registry::ServiceRegistry;
use crate::time_provider::SharedTimeProvider;
use crate::transport::{RequestReply, TransportError};

/// Errors surfaced to the client that submitted a request.
#[derive(Debug, Error, Clone)]
pub enum CoordinatorError {
    /// The bounded queue was full at submission time.
    #[error("coordinator queue is full")]
    Overloaded,

    /// The destination (and any capability-matched fallback) rejected the
    /// call or could not be reached.
    #[error("request to {0} failed: {1}")]
    DownstreamFailed(String, String),

    /// The caller canceled before a reply arrived.
    #[error("request canceled")]
    Canceled,

    /// The coordinator was shut down before this request was serviced.
    #[error("coordinator is shutting down")]
    ShuttingDown,
}

/// Tunables for the coordinator's queue and worker pool.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// Maximum number of queued, not-yet-dispatched requests.
    pub queue_capacity: usize,
    /// Number of cooperative workers draining the queue.
    pub worker_count: usize,
    /// Per-breaker tunables shared by every endpoint's breaker.
    pub breaker: BreakerConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            worker_count: 4,
            breaker: BreakerConfig {
                window: 20,
                open_threshold: 0.5,
                min_samples: 5,
                open_duration: Duration::from_secs(5),
                open_duration_cap: Duration::from_secs(60),
                half_open_successes: 3,
            },
        }
    }
}

/// A client submission: the destination agent (resolved by name or, on
/// fallback, by capability), the payload, and the deadline.
pub struct SubmittedRequest {
    /// Preferred destination agent.
    pub destination: AgentName,
    /// Capability label used to find a fallback if `destination` is
    /// unreachable or breaker-open.
    pub capability: Option<String>,
    /// Relative priority; higher values are drained first.
    pub priority: Priority,
    /// End-to-end deadline for the whole exchange, including any fallback.
    pub deadline: Duration,
    /// Opaque request body.
    pub payload: Vec<u8>,
}

struct QueuedRequest {
    id: RequestId,
    request: SubmittedRequest,
    reply: oneshot::Sender<Result<Vec<u8>, CoordinatorError>>,
    cancel: oneshot::Receiver<()>,
    sequence: u64,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.request.priority == other.request.priority && self.sequence == other.sequence
    }
}
impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    /// Higher priority first; among equal priorities, earlier arrival first
    /// (`SPEC_FULL.md` §5: "priority then arrival order"). `BinaryHeap` is a
    /// max-heap, so arrival order is reversed to make the earliest sequence
    /// number compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        self.request
            .priority
            .cmp(&other.request.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// A handle clients use to submit work; cheaply cloneable.
#[derive(Clone)]
pub struct CoordinatorHandle {
    queue: Arc<SharedQueue>,
    sequence: Arc<AtomicU64>,
}

impl CoordinatorHandle {
    /// Submits `request`, returning `Overloaded` synchronously if the queue
    /// is full rather than dropping it silently (§4.10 Backpressure).
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Overloaded`] if the queue is full.
    pub async fn submit(
        &self,
        request: SubmittedRequest,
    ) -> Result<RequestCancelHandle, CoordinatorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let id = RequestId::generate();
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        let queued = QueuedRequest {
            id,
            request,
            reply: reply_tx,
            cancel: cancel_rx,
            sequence,
        };
        self.queue
            .try_push(queued)
            .await
            .map_err(|_| CoordinatorError::Overloaded)?;
        Ok(RequestCancelHandle {
            id,
            cancel_tx: Some(cancel_tx),
            reply_rx,
        })
    }
}

/// Returned from [`CoordinatorHandle::submit`]; await [`Self::reply`] for
/// the result, or drop/call [`Self::cancel`] to abandon it.
pub struct RequestCancelHandle {
    id: RequestId,
    cancel_tx: Option<oneshot::Sender<()>>,
    reply_rx: oneshot::Receiver<Result<Vec<u8>, CoordinatorError>>,
}

impl RequestCancelHandle {
    /// This request's id, for correlating logs or a later cancel.
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    /// Signals the worker handling this request to cancel the downstream
    /// call and free itself, then waits for the (canceled) reply.
    pub fn cancel(mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Waits for the dispatched outcome.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Canceled`] if the coordinator dropped
    /// the reply channel (e.g. during shutdown) without responding.
    pub async fn reply(self) -> Result<Vec<u8>, CoordinatorError> {
        self.reply_rx.await.unwrap_or(Err(CoordinatorError::Canceled))
    }
}

/// The shared internal queue: a priority heap bounded at `capacity` and
/// guarded by a mutex, since `BinaryHeap` offers no lock-free concurrent
/// variant and workers must see a consistent total order.
struct SharedQueue {
    heap: Mutex<BinaryHeap<QueuedRequest>>,
    capacity: usize,
    notify: tokio::sync::Notify,
}

impl SharedQueue {
    fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            capacity,
            notify: tokio::sync::Notify::new(),
        }
    }

    /// Pushes `request` unless the queue is already at capacity.
    async fn try_push(&self, request: QueuedRequest) -> Result<(), QueuedRequest> {
        let mut heap = self.heap.lock().await;
        if heap.len() >= self.capacity {
            return Err(request);
        }
        heap.push(request);
        drop(heap);
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self) -> QueuedRequest {
        loop {
            if let Some(request) = self.heap.lock().await.pop() {
                return request;
            }
            self.notify.notified().await;
        }
    }
}

/// Resolves a destination to a transport endpoint and hands back the
/// breaker guarding it, creating one on first use.
struct EndpointResolver {
    registry: Arc<ServiceRegistry>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    breaker_config: BreakerConfig,
    time: SharedTimeProvider,
}

impl EndpointResolver {
    fn breaker_for(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.breaker_config, self.time.clone()))
            .clone()
    }
}

/// The Request Coordinator: owns the shared queue and supervises the worker
/// pool draining it.
pub struct RequestCoordinator {
    queue: Arc<SharedQueue>,
    resolver: Arc<EndpointResolver>,
    transport: Arc<dyn RequestReply>,
    config: CoordinatorConfig,
}

impl RequestCoordinator {
    /// Builds a coordinator; call [`Self::spawn_workers`] to start draining.
    #[must_use]
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<ServiceRegistry>,
        transport: Arc<dyn RequestReply>,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            queue: Arc::new(SharedQueue::new(config.queue_capacity)),
            resolver: Arc::new(EndpointResolver {
                registry,
                breakers: DashMap::new(),
                breaker_config: config.breaker,
                time,
            }),
            transport,
            config,
        }
    }

    /// Returns a cloneable handle clients use to submit requests directly
    /// against the bounded priority heap.
    #[must_use]
    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            queue: self.queue.clone(),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawns [`CoordinatorConfig::worker_count`] worker loops, each pulling
    /// from the shared priority queue and dispatching downstream.
    pub fn spawn_workers(&self) {
        for worker_id in 0..self.config.worker_count {
            let queue = self.queue.clone();
            let resolver = self.resolver.clone();
            let transport = self.transport.clone();
            tokio::spawn(async move {
                loop {
                    let mut request = queue.pop().await;
                    debug!(worker_id, request_id = %request.id, "dispatching");
                    let outcome = tokio::select! {
                        result = dispatch(&resolver, &transport, &request.request) => result,
                        _ = &mut request.cancel => Err(CoordinatorError::Canceled),
                    };
                    let _ = request.reply.send(outcome);
                }
            });
        }
    }
}

#[tracing::instrument(skip(resolver, transport, request), fields(destination = %request.destination))]
async fn dispatch(
    resolver: &EndpointResolver,
    transport: &Arc<dyn RequestReply>,
    request: &SubmittedRequest,
) -> Result<Vec<u8>, CoordinatorError> {
    match try_destination(resolver, transport, request, request.destination.to_string(), request.deadline).await {
        Ok(reply) => Ok(reply),
        Err(primary_err) => {
            let Some(capability) = &request.capability else {
                return Err(primary_err);
            };
            let fallback = resolver
                .registry
                .list(&crate::registry::ListFilter {
                    capability: Some(capability.clone()),
                    include_unreachable: false,
                })
                .await
                .unwrap_or_default()
                .into_iter()
                .find(|entry| entry.name != request.destination.to_string());
            let Some(fallback) = fallback else {
                return Err(primary_err);
            };
            warn!(
                original = %request.destination,
                fallback = %fallback.name,
                "falling back to an alternate agent sharing the requested capability"
            );
            try_destination(resolver, transport, request, fallback.name, request.deadline).await
        }
    }
}

#[tracing::instrument(skip(resolver, transport, request, deadline), fields(destination = %destination))]
async fn try_destination(
    resolver: &EndpointResolver,
    transport: &Arc<dyn RequestReply>,
    request: &SubmittedRequest,
    destination: String,
    deadline: Duration,
) -> Result<Vec<u8>, CoordinatorError> {
    let entry = resolver
        .registry
        .resolve(&destination)
        .await
        .map_err(|e| CoordinatorError::DownstreamFailed(destination.clone(), e.to_string()))?;

    let breaker = resolver.breaker_for(&destination);
    breaker
        .try_acquire()
        .await
        .map_err(|BreakerError::Open| CoordinatorError::DownstreamFailed(destination.clone(), "circuit open".to_string()))?;

    match transport
        .request(&entry.endpoint(), request.payload.clone(), deadline)
        .await
    {
        Ok(reply) => {
            breaker.record_success().await;
            Ok(reply)
        }
        Err(err @ TransportError::Timeout(_)) => {
            breaker.record_failure().await;
            Err(CoordinatorError::DownstreamFailed(destination, err.to_string()))
        }
        Err(err) => {
            breaker.record_failure().await;
            Err(CoordinatorError::DownstreamFailed(destination, err.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistryBackend;
    use crate::time_provider::test_time_provider;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as TokioMutex;

    struct ScriptedTransport {
        calls: AtomicUsize,
        responses: TokioMutex<Vec<Result<Vec<u8>, TransportError>>>,
    }

    #[async_trait::async_trait]
    impl RequestReply for ScriptedTransport {
        async fn request(
            &self,
            _destination: &str,
            _payload: Vec<u8>,
            _timeout: Duration,
        ) -> Result<Vec<u8>, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                Err(TransportError::PeerUnreachable("exhausted script".to_string()))
            } else {
                responses.remove(0)
            }
        }
    }

    async fn registry_with(entries: &[(&str, &str)]) -> Arc<ServiceRegistry> {
        let registry = ServiceRegistry::new(
            Box::new(InMemoryRegistryBackend::new()),
            Duration::from_secs(30),
            test_time_provider(),
        );
        for (name, capability) in entries {
            registry
                .register(
                    (*name).to_string(),
                    "primary".to_string(),
                    9000,
                    10000,
                    vec![(*capability).to_string()],
                )
                .await
                .unwrap();
        }
        Arc::new(registry)
    }

    fn request(destination: &str, capability: Option<&str>) -> SubmittedRequest {
        SubmittedRequest {
            destination: AgentName::try_new(destination).unwrap(),
            capability: capability.map(str::to_string),
            priority: Priority::default(),
            deadline: Duration::from_secs(1),
            payload: vec![9],
        }
    }

    #[tokio::test]
    async fn queue_full_is_reported_synchronously_as_overloaded() {
        let registry = registry_with(&[("asr", "speech")]).await;
        let transport = Arc::new(ScriptedTransport {
            calls: AtomicUsize::new(0),
            responses: TokioMutex::new(vec![]),
        });
        let config = CoordinatorConfig {
            queue_capacity: 1,
            worker_count: 0,
            ..CoordinatorConfig::default()
        };
        let coordinator = RequestCoordinator::new(config, registry, transport, test_time_provider());
        let handle = coordinator.handle();
        // No workers are spawned, so the first submission sits in the heap
        // and the second, with capacity 1, is rejected synchronously.
        handle.submit(request("asr", None)).await.unwrap();
        assert!(matches!(
            handle.submit(request("asr", None)).await,
            Err(CoordinatorError::Overloaded)
        ));
    }

    #[tokio::test]
    async fn successful_dispatch_returns_the_downstream_reply() {
        let registry = registry_with(&[("asr", "speech")]).await;
        let transport = Arc::new(ScriptedTransport {
            calls: AtomicUsize::new(0),
            responses: TokioMutex::new(vec![Ok(vec![42])]),
        });
        let coordinator = RequestCoordinator::new(
            CoordinatorConfig::default(),
            registry,
            transport,
            test_time_provider(),
        );
        let handle = coordinator.handle();
        coordinator.spawn_workers();
        let pending = handle.submit(request("asr", None)).await.unwrap();
        assert_eq!(pending.reply().await.unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn falls_back_to_a_capability_sharing_agent_on_failure() {
        let registry = registry_with(&[("asr-primary", "speech"), ("asr-backup", "speech")]).await;
        let transport = Arc::new(ScriptedTransport {
            calls: AtomicUsize::new(0),
            responses: TokioMutex::new(vec![
                Err(TransportError::PeerUnreachable("down".to_string())),
                Ok(vec![7]),
            ]),
        });
        let coordinator = RequestCoordinator::new(
            CoordinatorConfig::default(),
            registry,
            transport,
            test_time_provider(),
        );
        let handle = coordinator.handle();
        coordinator.spawn_workers();
        let pending = handle
            .submit(request("asr-primary", Some("speech")))
            .await
            .unwrap();
        assert_eq!(pending.reply().await.unwrap(), vec![7]);
    }

    struct HangingTransport;

    #[async_trait::async_trait]
    impl RequestReply for HangingTransport {
        async fn request(
            &self,
            _destination: &str,
            _payload: Vec<u8>,
            _timeout: Duration,
        ) -> Result<Vec<u8>, TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn canceling_before_reply_yields_canceled() {
        let registry = registry_with(&[("asr", "speech")]).await;
        let coordinator = RequestCoordinator::new(
            CoordinatorConfig::default(),
            registry,
            Arc::new(HangingTransport),
            test_time_provider(),
        );
        let handle = coordinator.handle();
        coordinator.spawn_workers();
        let pending = handle.submit(request("asr", None)).await.unwrap();
        // Give the worker a moment to pick the request up before canceling.
        tokio::task::yield_now().await;
        let (cancel_tx, reply_rx) = (pending.cancel_tx, pending.reply_rx);
        if let Some(tx) = cancel_tx {
            let _ = tx.send(());
        }
        assert!(matches!(
            reply_rx.await.unwrap(),
            Err(CoordinatorError::Canceled)
        ));
    }
}
