//! End-to-end scenarios exercising the public surface of two or more
//! components together, one per row of the testable-properties table
//! (`SPEC_FULL.md` §8).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meridian_runtime::circuit_breaker::{BreakerConfig, BreakerError, BreakerState, CircuitBreaker};
use meridian_runtime::domain_types::{AgentName, ModelId, Priority, RequestId, VramMb};
use meridian_runtime::model_manager::adapters::InprocGgufAdapter;
use meridian_runtime::model_manager::{LoadResult, ModelManagerHandle, ModelState, UnloadResult};
use meridian_runtime::registry::InMemoryRegistryBackend;
use meridian_runtime::registry::ServiceRegistry;
use meridian_runtime::router::{CrossMachineRouter, RequestKind, RoutedRequest};
use meridian_runtime::supervisor::process::{ManagedProcess, ProcessError, ProcessLauncher};
use meridian_runtime::supervisor::topology::parse_topology;
use meridian_runtime::supervisor::{Supervisor, SupervisorConfig};
use meridian_runtime::time_provider::{integration_test_time_provider, test_time_provider};
use meridian_runtime::transport::{RequestReply, TransportError};

struct FakeProcess;

#[async_trait]
impl ManagedProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(1)
    }
    async fn request_shutdown(&mut self) -> Result<(), ProcessError> {
        Ok(())
    }
    async fn kill(&mut self) -> Result<(), ProcessError> {
        Ok(())
    }
    async fn wait(&mut self) -> Result<bool, ProcessError> {
        Ok(true)
    }
    fn has_exited(&mut self) -> bool {
        false
    }
}

struct FakeLauncher;

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn spawn(
        &self,
        _executable: &str,
        _args: &[String],
        _env: &std::collections::HashMap<String, String>,
    ) -> Result<Box<dyn ManagedProcess>, ProcessError> {
        Ok(Box::new(FakeProcess))
    }
}

fn supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        start_grace: Duration::from_millis(50),
        shutdown_grace: Duration::from_millis(50),
        restart_initial_backoff: Duration::from_millis(1),
        restart_backoff_cap: Duration::from_millis(10),
        max_restart_attempts: 3,
    }
}

/// E2E-1 Start with dependencies: A has no deps, B depends on A. B must not
/// reach `Starting` until A has reached `Ready`; both end up `Ready`.
#[tokio::test]
async fn e2e_1_start_with_dependencies() {
    const YAML: &str = r"
core_services:
  - name: a
    executable: /bin/a
    host_affinity: primary
    port: 9001
    required: true
    startup_priority: 1
  - name: b
    executable: /bin/b
    host_affinity: primary
    port: 9002
    dependencies: [a]
    required: true
    startup_priority: 2
";
    let topology = parse_topology(YAML).unwrap();
    let supervisor = Supervisor::new(topology, supervisor_config(), Arc::new(FakeLauncher), test_time_provider());

    let order = supervisor.launch_order().unwrap();
    assert_eq!(order, vec!["a".to_string(), "b".to_string()]);

    for name in &order {
        while !supervisor.dependencies_ready(name) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        supervisor.launch(name).await.unwrap();
        supervisor.mark_ready(name);
    }

    assert_eq!(supervisor.state_of("a").unwrap().phase, meridian_runtime::supervisor::AgentPhase::Ready);
    assert_eq!(supervisor.state_of("b").unwrap().phase, meridian_runtime::supervisor::AgentPhase::Ready);
}

/// E2E-2 Topology cycle: A depends on B, B depends on A. Loading the
/// document must fail with a cycle naming both agents.
#[test]
fn e2e_2_topology_cycle_is_rejected() {
    const YAML: &str = r"
core_services:
  - name: a
    executable: /bin/a
    host_affinity: primary
    port: 9001
    dependencies: [b]
  - name: b
    executable: /bin/b
    host_affinity: primary
    port: 9002
    dependencies: [a]
";
    let err = parse_topology(YAML).unwrap_err();
    let message = err.to_string();
    assert!(message.contains('a') && message.contains('b'), "error should name both agents: {message}");
}

/// E2E-3 VRAM eviction: loading a higher-priority model evicts the older of
/// two equal-priority residents just enough to fit.
#[tokio::test]
async fn e2e_3_vram_eviction_picks_oldest_equal_priority_victim() {
    let manager = ModelManagerHandle::new(
        VramMb::try_new(1000).unwrap(),
        Arc::new(InprocGgufAdapter),
        test_time_provider(),
        Duration::from_millis(10),
        Duration::from_secs(3600),
    );

    let m1 = ModelId::try_new("m1").unwrap();
    let m2 = ModelId::try_new("m2").unwrap();
    let m3 = ModelId::try_new("m3").unwrap();
    let low = Priority::try_new(1).unwrap();
    let high = Priority::try_new(5).unwrap();

    assert_eq!(
        manager
            .load_model(&m1, serde_json::Value::Null, VramMb::try_new(600).unwrap(), low)
            .await
            .unwrap(),
        LoadResult::Loaded
    );
    assert_eq!(
        manager
            .load_model(&m2, serde_json::Value::Null, VramMb::try_new(300).unwrap(), low)
            .await
            .unwrap(),
        LoadResult::Loaded
    );
    assert_eq!(
        manager
            .load_model(&m3, serde_json::Value::Null, VramMb::try_new(500).unwrap(), high)
            .await
            .unwrap(),
        LoadResult::Loaded
    );

    assert_eq!(manager.state_of(&m1), ModelState::Unloaded);
    assert_eq!(manager.state_of(&m2), ModelState::Loaded);
    assert_eq!(manager.state_of(&m3), ModelState::Loaded);
}

/// E2E-4 VRAM queuing then admission: a request that cannot be admitted is
/// queued, and is admitted automatically once the blocker is unloaded.
#[tokio::test]
async fn e2e_4_queued_load_admits_once_capacity_frees() {
    let manager = ModelManagerHandle::new(
        VramMb::try_new(1000).unwrap(),
        Arc::new(InprocGgufAdapter),
        test_time_provider(),
        Duration::from_millis(10),
        Duration::from_secs(3600),
    );
    let max_priority = Priority::max();
    let big = ModelId::try_new("big").unwrap();
    let small = ModelId::try_new("small").unwrap();

    assert_eq!(
        manager
            .load_model(&big, serde_json::Value::Null, VramMb::try_new(900).unwrap(), max_priority)
            .await
            .unwrap(),
        LoadResult::Loaded
    );
    assert_eq!(
        manager
            .load_model(&small, serde_json::Value::Null, VramMb::try_new(200).unwrap(), max_priority)
            .await
            .unwrap(),
        LoadResult::Queued
    );
    assert_eq!(manager.state_of(&small), ModelState::Unloaded);

    assert_eq!(manager.unload_model(&big).await.unwrap(), UnloadResult::Unloaded);
    assert_eq!(manager.state_of(&small), ModelState::Loaded);
}

/// E2E-5 Circuit open/close: five consecutive failures open the breaker;
/// after `open_duration` one probe is admitted, and three successes close it.
#[tokio::test]
async fn e2e_5_breaker_opens_then_recovers() {
    // `CircuitBreaker` measures its open window against real `Instant`s, so
    // the provider must actually sleep; the grace period is kept short to
    // keep the test fast.
    let time = integration_test_time_provider();
    let open_duration = Duration::from_millis(50);
    let breaker = CircuitBreaker::new(
        BreakerConfig {
            window: 10,
            open_threshold: 0.5,
            min_samples: 5,
            open_duration,
            open_duration_cap: Duration::from_secs(30),
            half_open_successes: 3,
        },
        time.clone(),
    );

    for _ in 0..5 {
        breaker.try_acquire().await.unwrap();
        breaker.record_failure().await;
    }
    assert_eq!(breaker.state().await, BreakerState::Open);
    assert!(matches!(breaker.try_acquire().await, Err(BreakerError::Open)));

    time.sleep(open_duration + Duration::from_millis(20)).await;
    assert_eq!(breaker.state().await, BreakerState::HalfOpen);
    breaker.try_acquire().await.unwrap();
    assert!(matches!(breaker.try_acquire().await, Err(BreakerError::Open)));

    breaker.record_success().await;
    breaker.try_acquire().await.unwrap();
    breaker.record_success().await;
    breaker.try_acquire().await.unwrap();
    breaker.record_success().await;
    assert_eq!(breaker.state().await, BreakerState::Closed);
}

struct EchoingPeerTransport {
    calls: AtomicUsize,
}

#[async_trait]
impl RequestReply for EchoingPeerTransport {
    async fn request(
        &self,
        _destination: &str,
        payload: Vec<u8>,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let envelope: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        Ok(serde_json::to_vec(&serde_json::json!({
            "request_id": envelope["request_id"],
            "reply": "ok",
        }))
        .unwrap())
    }
}

/// E2E-6 Cross-machine resolve: an agent registered on the peer host is
/// transparently forwarded to, and the reply carries the original
/// request_id end to end.
#[tokio::test]
async fn e2e_6_cross_machine_request_forwards_and_preserves_request_id() {
    let registry = Arc::new(ServiceRegistry::new(
        Box::new(InMemoryRegistryBackend::new()),
        Duration::from_secs(30),
        test_time_provider(),
    ));
    registry
        .register("remote_agent".to_string(), "secondary".to_string(), 9100, 10100, vec![])
        .await
        .unwrap();

    let transport = Arc::new(EchoingPeerTransport {
        calls: AtomicUsize::new(0),
    });
    let router = CrossMachineRouter::new(
        "primary".to_string(),
        registry,
        transport.clone(),
        Some("secondary:7000".to_string()),
    );

    let request_id = RequestId::generate();
    let request = RoutedRequest {
        request_id,
        sender_name: AgentName::try_new("caller").unwrap(),
        destination: AgentName::try_new("remote_agent").unwrap(),
        deadline: Duration::from_secs(1),
        kind: RequestKind::NonIdempotent,
        payload: vec![9, 9, 9],
    };

    let reply = router.route(request).await.unwrap();
    let reply: serde_json::Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(reply["request_id"], serde_json::json!(request_id.to_string()));
    assert_eq!(transport.calls.load(Ordering::Relaxed), 1);
}
