//! Wires a validated [`RuntimeConfig`] and its topology document into a
//! running supervisor process: the Agent Supervisor, Model Manager, Request
//! Coordinator, Cross-Machine Router, Observability Hub, one Health Prober
//! per agent, and a small control-plane listener `meridian-cli` talks to.
//!
//! Shared by both `meridian-supervisor` (runs the topology named by
//! `config.topology_path` directly) and `meridian-cli start` (the same flow,
//! reached through the subcommand).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tracing::{error, info, warn};

use crate::circuit_breaker::BreakerConfig;
use crate::config::RuntimeConfig;
use crate::coordinator::{CoordinatorConfig, RequestCoordinator};
use crate::database::{DatabaseConnection, DatabasePath};
use crate::error::{RuntimeError, Severity};
use crate::error_bus::{ErrorBus, ErrorRecord};
use crate::health::{AgentHealthState, HealthProber, ProberConfig};
use crate::model_manager::adapters::InprocGgufAdapter;
use crate::model_manager::ModelManagerHandle;
use crate::observability::{ObservabilityConfig, ObservabilityHub};
use crate::registry::{InMemoryRegistryBackend, RegistryBackend, ServiceRegistry, SqliteRegistryBackend};
use crate::router::CrossMachineRouter;
use crate::supervisor::process::TokioProcessLauncher;
use crate::supervisor::topology::{load_topology, Topology};
use crate::supervisor::{AgentPhase, Supervisor, SupervisorConfig, SupervisorError};
use crate::time_provider::{production_time_provider, SharedTimeProvider};
use crate::transport::wire::{ControlRequest, ControlResponse};
use crate::transport::{InMemoryTransport, RequestReply, TcpTransport};

/// Runs the supervisor end to end: loads the topology, launches every agent
/// in dependency order, serves the control plane and the read-only
/// observability HTTP surface, and blocks until an orderly-shutdown signal
/// arrives (`Ctrl-C` or a `ControlRequest::Stop`).
pub async fn run_supervisor(config: RuntimeConfig) -> Result<(), RuntimeError> {
    let topology = load_topology(&config.topology_path)?;
    let time = production_time_provider();

    let error_bus = ErrorBus::new(1024, time.clone());
    let (registry, db) = build_registry(&config, time.clone()).await?;
    let registry = Arc::new(registry);
    let transport: Arc<dyn RequestReply> = if config.peer_host.is_some() {
        Arc::new(TcpTransport::new())
    } else {
        Arc::new(InMemoryTransport::new())
    };

    let observability = ObservabilityHub::new(
        ObservabilityConfig::default(),
        time.clone(),
        config.peer_host.clone(),
    );
    observability.subscribe_error_bus(&error_bus);

    // The Model Manager serves the agent-facing model-lifecycle wire
    // protocol (§6); wiring its inbound listener is an agent-process
    // concern outside the supervisor's own entry point.
    let model_manager = ModelManagerHandle::new(
        config.vram_budget_mb,
        Arc::new(InprocGgufAdapter),
        time.clone(),
        config.model_unload_grace.as_duration(),
        config.model_idle_timeout.as_duration(),
        error_bus.clone(),
        db,
    );
    // Held for the process lifetime so the preloader's tick loop keeps
    // running; dropping it signals the loop to stop.
    let (_preloader_shutdown_tx, preloader_shutdown_rx) = oneshot::channel();
    model_manager.spawn_preloader(preloader_shutdown_rx);

    let coordinator = RequestCoordinator::new(
        CoordinatorConfig {
            queue_capacity: config.coordinator_queue_capacity,
            worker_count: config.coordinator_worker_count,
            breaker: BreakerConfig {
                window: config.breaker_window,
                open_threshold: config.breaker_open_threshold,
                min_samples: config.breaker_min_samples,
                open_duration: config.breaker_open_duration.as_duration(),
                open_duration_cap: config.breaker_open_duration_cap.as_duration(),
                half_open_successes: config.breaker_half_open_successes,
            },
        },
        registry.clone(),
        transport.clone(),
        time.clone(),
    );
    coordinator.spawn_workers();

    let peer_endpoint = topology
        .global
        .network
        .as_ref()
        .and_then(|n| n.peer_endpoint.clone());
    // The router dispatches inbound cross-machine traffic once the
    // agent-facing listener that owns `register_local_queue` is wired up;
    // kept alive here so that listener has somewhere to attach.
    let _router = Arc::new(CrossMachineRouter::new(
        this_host(&config, &topology),
        registry.clone(),
        transport.clone(),
        peer_endpoint,
    ));

    let supervisor = Arc::new(Supervisor::new(
        topology.clone(),
        SupervisorConfig {
            start_grace: config.start_grace.as_duration(),
            shutdown_grace: config.shutdown_grace.as_duration(),
            restart_initial_backoff: config.restart_initial_backoff.as_duration(),
            restart_backoff_cap: config.restart_backoff_cap.as_duration(),
            max_restart_attempts: config.max_restart_attempts,
        },
        Arc::new(TokioProcessLauncher),
        time.clone(),
        error_bus.clone(),
    ));
    let mut fatal_rx = supervisor.subscribe_fatal();

    launch_in_order(
        &supervisor,
        &topology,
        &config,
        &transport,
        &observability,
        &time,
        &error_bus,
    )
    .await?;

    let observability_listener = TcpListener::bind("0.0.0.0:9100")
        .await
        .map_err(RuntimeError::Io)?;
    let observability_router = observability.http_router();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(observability_listener, observability_router).await {
            error!(error = %e, "observability HTTP surface exited");
        }
    });

    let (stop_tx, stop_rx) = oneshot::channel();
    spawn_control_server(
        control_bind_addr(&config),
        supervisor.clone(),
        topology.clone(),
        stop_tx,
    );

    let shutdown_reason = wait_for_shutdown_signal(stop_rx, &mut fatal_rx).await;
    info!("shutdown requested, stopping every agent in reverse topological order");
    supervisor.shutdown_all().await?;
    if let Some(err) = shutdown_reason {
        return Err(RuntimeError::Supervisor(err));
    }
    Ok(())
}

/// Builds the Service Registry, returning the shared SQLite connection
/// alongside it (when persistence is enabled) so other subsystems backed by
/// the same database file, such as the Model Manager's evaluation log, can
/// reuse the one connection pool rather than opening their own.
async fn build_registry(
    config: &RuntimeConfig,
    time: SharedTimeProvider,
) -> Result<(ServiceRegistry, Option<DatabaseConnection>), RuntimeError> {
    let (backend, db): (Box<dyn RegistryBackend>, Option<DatabaseConnection>) =
        if config.registry_persistence_enabled {
            let path = config
                .registry_storage_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("./meridian-registry.db"));
            let db = DatabaseConnection::initialize(&DatabasePath::new(path)?).await?;
            (Box::new(SqliteRegistryBackend::new(db.clone())), Some(db))
        } else {
            (Box::new(InMemoryRegistryBackend::new()), None)
        };
    Ok((
        ServiceRegistry::new(backend, config.heartbeat_ttl.as_duration(), time),
        db,
    ))
}

fn this_host(config: &RuntimeConfig, topology: &Topology) -> String {
    topology
        .global
        .network
        .as_ref()
        .map(|n| n.bind_address.clone())
        .unwrap_or_else(|| config.registry_endpoint.clone())
}

/// Launches every agent in topological order, waiting for each one's
/// dependencies to report `Ready` before starting it (invariant 2, §8), and
/// attaches a [`HealthProber`] as soon as the process is launched.
async fn launch_in_order(
    supervisor: &Arc<Supervisor>,
    topology: &Topology,
    config: &RuntimeConfig,
    transport: &Arc<dyn RequestReply>,
    observability: &Arc<ObservabilityHub>,
    time: &SharedTimeProvider,
    error_bus: &Arc<ErrorBus>,
) -> Result<(), RuntimeError> {
    let order = supervisor.launch_order()?;
    for name in &order {
        let deadline = time.instant() + config.start_grace.as_duration();
        while !supervisor.dependencies_ready(name) {
            if time.instant() >= deadline {
                let err = SupervisorError::DependencyTimeout { name: name.clone() };
                error_bus.publish(ErrorRecord {
                    source_agent: name.clone(),
                    kind: "dependency_timeout".to_string(),
                    severity: Severity::Critical,
                    message: err.to_string(),
                    context: serde_json::json!({}),
                    occurred_at_ms: 0,
                    request_id: None,
                });
                return Err(RuntimeError::Supervisor(err));
            }
            time.sleep(Duration::from_millis(20)).await;
        }
        supervisor.launch(name).await?;
        let Some(spec) = topology.agents.iter().find(|a| &a.name == name) else {
            continue;
        };
        let health_endpoint = format!("{}:{}", this_host(config, topology), spec.health_port());
        let breaker = crate::circuit_breaker::CircuitBreaker::new(
            BreakerConfig {
                window: config.breaker_window,
                open_threshold: config.breaker_open_threshold,
                min_samples: config.breaker_min_samples,
                open_duration: config.breaker_open_duration.as_duration(),
                open_duration_cap: config.breaker_open_duration_cap.as_duration(),
                half_open_successes: config.breaker_half_open_successes,
            },
            time.clone(),
        );
        let prober = Arc::new(HealthProber::new(
            name.clone(),
            health_endpoint,
            ProberConfig {
                interval: config.probe_interval.as_duration(),
                probe_timeout: config.probe_interval.as_duration(),
                soft_threshold: config.health_soft_threshold,
                hard_threshold: config.health_hard_threshold,
            },
            transport.clone(),
            breaker,
            time.clone(),
        ));
        let (_prober_shutdown_tx, prober_shutdown_rx) = oneshot::channel();
        let supervisor_for_prober = supervisor.clone();
        let observability_sink = observability.health_sink();
        let agent_name = name.clone();
        tokio::spawn(async move {
            prober
                .run(prober_shutdown_rx, move |snapshot| {
                    observability_sink(snapshot.clone());
                    let supervisor = supervisor_for_prober.clone();
                    let agent_name = agent_name.clone();
                    tokio::spawn(async move {
                        apply_health(&supervisor, &agent_name, snapshot.status).await;
                    });
                })
                .await;
        });
    }
    Ok(())
}

async fn apply_health(supervisor: &Supervisor, name: &str, status: AgentHealthState) {
    let already_ready = supervisor
        .state_of(name)
        .is_some_and(|s| s.phase == AgentPhase::Ready);
    if status == AgentHealthState::Ready && !already_ready {
        supervisor.mark_ready(name);
    } else {
        supervisor.observe_health(name, status).await;
    }
}

fn control_bind_addr(config: &RuntimeConfig) -> String {
    let host = config
        .registry_endpoint
        .rsplit_once(':')
        .map_or("0.0.0.0", |(host, _)| host);
    format!("{host}:7100")
}

/// The address `meridian-cli`'s control subcommands connect to, derived the
/// same way as [`control_bind_addr`] but substituting a loopback address for
/// the server's `0.0.0.0` wildcard bind.
#[must_use]
pub fn control_connect_addr(config: &RuntimeConfig) -> String {
    let addr = control_bind_addr(config);
    addr.replace("0.0.0.0", "127.0.0.1")
}

/// Sends one [`ControlRequest`] to a running supervisor's control plane and
/// returns its [`ControlResponse`].
///
/// # Errors
///
/// Returns an I/O error if the connection cannot be established or the
/// exchange does not complete, and a JSON error if the reply does not decode
/// as a [`ControlResponse`].
pub async fn send_control_request(
    addr: &str,
    request: &ControlRequest,
) -> std::io::Result<ControlResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    let body = serde_json::to_vec(request).map_err(std::io::Error::other)?;
    let len = u32::try_from(body.len())
        .map_err(|_| std::io::Error::other("control request body too large"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&body).await?;

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let reply_len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; reply_len];
    stream.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(std::io::Error::other)
}

fn spawn_control_server(
    bind_addr: String,
    supervisor: Arc<Supervisor>,
    topology: Topology,
    stop_tx: oneshot::Sender<()>,
) {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, %bind_addr, "control listener failed to bind");
                return;
            }
        };
        let mut stop_tx = Some(stop_tx);
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                continue;
            };
            let supervisor = supervisor.clone();
            let agent_names: Vec<String> = topology.agents.iter().map(|a| a.name.clone()).collect();
            let stopper = stop_tx.take();
            tokio::spawn(async move {
                if let Some(tx) = handle_control_connection(stream, &supervisor, &agent_names, stopper).await {
                    // Stop was requested but this connection did not own the
                    // sender (a later connection raced it); drop silently.
                    drop(tx);
                }
            });
        }
    });
}

async fn handle_control_connection(
    mut stream: TcpStream,
    supervisor: &Arc<Supervisor>,
    agent_names: &[String],
    mut stop_tx: Option<oneshot::Sender<()>>,
) -> Option<oneshot::Sender<()>> {
    let mut len_buf = [0u8; 4];
    if stream.read_exact(&mut len_buf).await.is_err() {
        return stop_tx;
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    if stream.read_exact(&mut buf).await.is_err() {
        return stop_tx;
    }
    let Ok(request) = serde_json::from_slice::<ControlRequest>(&buf) else {
        warn!("control connection sent an unparseable request");
        return stop_tx;
    };

    let response = match request {
        ControlRequest::Stop => {
            if let Some(tx) = stop_tx.take() {
                let _ = tx.send(());
            }
            ControlResponse::Ok {
                data: serde_json::json!({ "stopping": true }),
            }
        }
        ControlRequest::Status => {
            let states: std::collections::HashMap<String, serde_json::Value> = agent_names
                .iter()
                .map(|name| {
                    let phase = supervisor
                        .state_of(name)
                        .map(|s| s.phase)
                        .unwrap_or(AgentPhase::Pending);
                    (name.clone(), serde_json::json!(phase))
                })
                .collect();
            ControlResponse::Ok {
                data: serde_json::json!(states),
            }
        }
        ControlRequest::Restart { agent } => {
            if agent_names.contains(&agent) {
                match supervisor.launch(&agent).await {
                    Ok(()) => ControlResponse::Ok {
                        data: serde_json::json!({ "restarted": agent }),
                    },
                    Err(e) => ControlResponse::Error {
                        message: e.to_string(),
                    },
                }
            } else {
                ControlResponse::UnknownAgent { name: agent }
            }
        }
        ControlRequest::Inspect { agent } => match supervisor.state_of(&agent) {
            Some(state) => ControlResponse::Ok {
                data: serde_json::json!({
                    "phase": state.phase,
                    "pid": state.pid,
                    "restart_count": state.restart_count.into_inner(),
                    "last_failure_reason": state.last_failure_reason,
                }),
            },
            None => ControlResponse::UnknownAgent { name: agent },
        },
    };

    if let Ok(body) = serde_json::to_vec(&response) {
        let len = u32::try_from(body.len()).unwrap_or(u32::MAX).to_be_bytes();
        let _ = stream.write_all(&len).await;
        let _ = stream.write_all(&body).await;
    }
    stop_tx
}

/// Waits for `Ctrl-C`, a control-plane stop request, or a fatal supervisor
/// condition (a required agent exhausting its restart budget). Returns the
/// fatal error, if that is what woke it, so the caller can propagate it as
/// the process's exit code.
async fn wait_for_shutdown_signal(
    stop_rx: oneshot::Receiver<()>,
    fatal_rx: &mut broadcast::Receiver<SupervisorError>,
) -> Option<SupervisorError> {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl-C");
            None
        }
        _ = stop_rx => {
            info!("received control-plane stop request");
            None
        }
        Ok(err) = fatal_rx.recv() => {
            error!(error = %err, "required agent failed, shutting down");
            Some(err)
        }
    }
}
