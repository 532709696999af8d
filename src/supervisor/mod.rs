//! Agent Supervisor (C6): topology-driven process lifecycle.
//!
//! Resolves the dependency DAG, launches agents in priority order, and
//! reacts to failures with backoff-governed restarts.

pub mod process;
pub mod topology;

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use crate::domain_types::RestartCount;
use crate::error::Severity;
use crate::error_bus::{ErrorBus, ErrorRecord};
use crate::health::AgentHealthState;
use crate::time_provider::SharedTimeProvider;
use process::{ManagedProcess, ProcessLauncher};
use topology::{effectively_required_closure, topological_order, AgentSpec, Topology};

/// Errors raised by the supervisor.
#[derive(Debug, Error, Clone)]
pub enum SupervisorError {
    /// An agent did not reach `Ready` within its start grace window.
    #[error("agent {name} did not become ready within the start grace window")]
    DependencyTimeout {
        /// The agent that timed out.
        name: String,
    },

    /// A `required` agent exhausted its restart budget.
    #[error("required agent {name} failed after exhausting its restart budget")]
    RequiredAgentFailed {
        /// The agent that failed.
        name: String,
    },

    /// The named agent is unknown to this supervisor.
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    /// The process layer failed to launch or control the agent.
    #[error("process error: {0}")]
    Process(String),
}

/// Lifecycle phase of one supervised agent (`SPEC_FULL.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    /// Declared but not yet eligible to start (dependencies not `Ready`).
    Pending,
    /// Process launched, awaiting the first successful probe.
    Starting,
    /// At least one successful probe has landed within the grace window.
    Ready,
    /// Probe failures below the hard threshold.
    Degraded,
    /// Shut down in an orderly fashion.
    Stopped,
    /// Probe failures at/above the hard threshold, or exhausted restarts.
    Failed,
}

/// Supervisor-owned runtime state for one agent (`SPEC_FULL.md` §3).
#[derive(Debug, Clone)]
pub struct AgentRuntimeState {
    /// Current lifecycle phase.
    pub phase: AgentPhase,
    /// OS pid, once launched.
    pub pid: Option<u32>,
    /// Unix milliseconds the process was last (re)started at.
    pub started_at_ms: u64,
    /// Restart attempts made since the agent last reached `Ready`.
    pub restart_count: RestartCount,
    /// Human-readable reason for the most recent failure, if any.
    pub last_failure_reason: Option<String>,
}

impl Default for AgentRuntimeState {
    fn default() -> Self {
        Self {
            phase: AgentPhase::Pending,
            pid: None,
            started_at_ms: 0,
            restart_count: RestartCount::default(),
            last_failure_reason: None,
        }
    }
}

/// Tunables governing supervisor scheduling, independent of any one agent.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// Window during which probe failures for a newly started agent do not
    /// count toward its failure thresholds.
    pub start_grace: Duration,
    /// Grace window granted during orderly shutdown before force-kill.
    pub shutdown_grace: Duration,
    /// Initial backoff before the first automatic restart.
    pub restart_initial_backoff: Duration,
    /// Cap on restart backoff growth.
    pub restart_backoff_cap: Duration,
    /// Maximum automatic restart attempts before giving up.
    pub max_restart_attempts: u32,
}

/// Computes the backoff delay before the `attempt`-th restart (1-indexed),
/// per invariant 8 (`SPEC_FULL.md` §8): `>= min(initial * 2^attempt, cap)`.
#[must_use]
pub fn restart_backoff(config: &SupervisorConfig, attempt: u32) -> Duration {
    let scaled = config
        .restart_initial_backoff
        .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    std::cmp::min(scaled, config.restart_backoff_cap)
}

/// The Agent Supervisor: owns the process table and reacts to health
/// transitions with restart-with-backoff.
pub struct Supervisor {
    topology: Topology,
    config: SupervisorConfig,
    launcher: Arc<dyn ProcessLauncher>,
    time: SharedTimeProvider,
    states: Arc<DashMap<String, AgentRuntimeState>>,
    processes: Arc<DashMap<String, Mutex<Box<dyn ManagedProcess>>>>,
    restart_in_flight: Arc<DashMap<String, ()>>,
    effectively_required: HashSet<String>,
    launch_attempts: Arc<AtomicU32>,
    error_bus: Arc<ErrorBus>,
    fatal: broadcast::Sender<SupervisorError>,
}

impl Supervisor {
    /// Builds a supervisor for `topology`, publishing restart-exhaustion and
    /// dependency-timeout conditions onto `error_bus`.
    #[must_use]
    pub fn new(
        topology: Topology,
        config: SupervisorConfig,
        launcher: Arc<dyn ProcessLauncher>,
        time: SharedTimeProvider,
        error_bus: Arc<ErrorBus>,
    ) -> Self {
        let effectively_required = effectively_required_closure(&topology.agents);
        let states = Arc::new(DashMap::new());
        for agent in &topology.agents {
            states.insert(agent.name.clone(), AgentRuntimeState::default());
        }
        let (fatal, _) = broadcast::channel(8);
        Self {
            topology,
            config,
            launcher,
            time,
            states,
            processes: Arc::new(DashMap::new()),
            restart_in_flight: Arc::new(DashMap::new()),
            effectively_required,
            launch_attempts: Arc::new(AtomicU32::new(0)),
            error_bus,
            fatal,
        }
    }

    /// Subscribes to fatal supervisor conditions (currently just
    /// [`SupervisorError::RequiredAgentFailed`]) that should end the process.
    #[must_use]
    pub fn subscribe_fatal(&self) -> broadcast::Receiver<SupervisorError> {
        self.fatal.subscribe()
    }

    /// True if `name` must be treated as required for start/restart purposes,
    /// either because its own `required` flag is set or because a required
    /// agent transitively depends on it (§4.6).
    #[must_use]
    pub fn effectively_required(&self, name: &str) -> bool {
        self.topology
            .agents
            .iter()
            .find(|a| a.name == name)
            .is_some_and(|a| a.required)
            || self.effectively_required.contains(name)
    }

    /// Returns a snapshot of one agent's runtime state.
    #[must_use]
    pub fn state_of(&self, name: &str) -> Option<AgentRuntimeState> {
        self.states.get(name).map(|s| s.clone())
    }

    /// Computes the topological launch order for the held topology.
    pub fn launch_order(&self) -> Result<Vec<String>, topology::TopologyError> {
        topological_order(&self.topology.agents)
    }

    fn spec(&self, name: &str) -> Option<&AgentSpec> {
        self.topology.agents.iter().find(|a| a.name == name)
    }

    /// Verifies invariant 2 (§8): a dependency must be `Ready` before its
    /// dependent transitions out of `Pending`.
    #[must_use]
    pub fn dependencies_ready(&self, name: &str) -> bool {
        let Some(spec) = self.spec(name) else {
            return false;
        };
        spec.dependencies.iter().all(|dep| {
            self.states
                .get(dep)
                .is_some_and(|s| s.phase == AgentPhase::Ready)
        })
    }

    /// Launches `name`, transitioning `Pending -> Starting`. Callers must
    /// have already confirmed [`Supervisor::dependencies_ready`].
    pub async fn launch(&self, name: &str) -> Result<(), SupervisorError> {
        let spec = self
            .spec(name)
            .ok_or_else(|| SupervisorError::UnknownAgent(name.to_string()))?
            .clone();

        let process = self
            .launcher
            .spawn(&spec.executable, &spec.args, &spec.env)
            .await
            .map_err(|e| SupervisorError::Process(e.to_string()))?;

        self.launch_attempts.fetch_add(1, Ordering::Relaxed);
        let pid = process.pid();
        self.processes.insert(name.to_string(), Mutex::new(process));

        let mut state = self
            .states
            .get_mut(name)
            .ok_or_else(|| SupervisorError::UnknownAgent(name.to_string()))?;
        state.phase = AgentPhase::Starting;
        state.pid = pid;
        state.started_at_ms = now_ms(&self.time);
        Ok(())
    }

    /// Marks `name` `Ready` after its first successful probe within the
    /// grace window.
    pub fn mark_ready(&self, name: &str) {
        if let Some(mut state) = self.states.get_mut(name) {
            state.phase = AgentPhase::Ready;
            state.restart_count = RestartCount::default();
        }
    }

    /// Applies a health transition observed by the prober, escalating to
    /// `Degraded`/`Failed` and, for effectively-required agents, scheduling
    /// a restart once the backoff delay has elapsed.
    #[tracing::instrument(skip(self))]
    pub async fn observe_health(&self, name: &str, health: AgentHealthState) {
        let Some(mut state) = self.states.get_mut(name) else {
            return;
        };

        let within_grace =
            now_ms(&self.time).saturating_sub(state.started_at_ms) < duration_ms(self.config.start_grace);
        if within_grace && state.phase == AgentPhase::Starting {
            return;
        }

        state.phase = match health {
            AgentHealthState::Ready => AgentPhase::Ready,
            AgentHealthState::Degraded => AgentPhase::Degraded,
            AgentHealthState::Failed => AgentPhase::Failed,
        };

        if state.phase == AgentPhase::Failed {
            drop(state);
            self.handle_failure(name).await;
        }
    }

    #[tracing::instrument(skip(self))]
    async fn handle_failure(&self, name: &str) {
        if !self.effectively_required(name) {
            // Non-required agents are recorded and left failed; no
            // automatic restart (§4.6, §7).
            return;
        }
        if self.restart_in_flight.contains_key(name) {
            // At most one restart attempt per agent at a time (invariant,
            // §4.6 "two concurrent restart attempts ... are forbidden").
            return;
        }
        self.restart_in_flight.insert(name.to_string(), ());

        let attempt = {
            let mut state = self.states.get_mut(name).expect("known agent");
            state.restart_count = state.restart_count.increment();
            state.restart_count
        };

        if attempt.into_inner() > self.config.max_restart_attempts {
            let err = SupervisorError::RequiredAgentFailed {
                name: name.to_string(),
            };
            if let Some(mut state) = self.states.get_mut(name) {
                state.last_failure_reason = Some(err.to_string());
            }
            self.error_bus.publish(ErrorRecord {
                source_agent: name.to_string(),
                kind: "required_agent_failed".to_string(),
                severity: Severity::Critical,
                message: err.to_string(),
                context: serde_json::json!({"restart_attempts": attempt.into_inner()}),
                occurred_at_ms: 0,
                request_id: None,
            });
            let _ = self.fatal.send(err);
            self.restart_in_flight.remove(name);
            return;
        }

        let delay = restart_backoff(&self.config, attempt.into_inner());
        self.time.sleep(delay).await;

        if let Err(e) = self.launch(name).await {
            if let Some(mut state) = self.states.get_mut(name) {
                state.last_failure_reason = Some(e.to_string());
            }
            self.error_bus.publish(ErrorRecord {
                source_agent: name.to_string(),
                kind: "restart_launch_failed".to_string(),
                severity: Severity::Error,
                message: e.to_string(),
                context: serde_json::json!({"restart_attempts": attempt.into_inner()}),
                occurred_at_ms: 0,
                request_id: None,
            });
        }
        self.restart_in_flight.remove(name);
    }

    /// Requests orderly shutdown of `name`, waiting up to `shutdown_grace`
    /// before force-terminating.
    pub async fn shutdown(&self, name: &str) -> Result<(), SupervisorError> {
        let Some(process_lock) = self.processes.get(name) else {
            return Ok(());
        };
        let mut process = process_lock.lock().await;
        process
            .request_shutdown()
            .await
            .map_err(|e| SupervisorError::Process(e.to_string()))?;

        let waited = tokio::time::timeout(self.config.shutdown_grace, process.wait()).await;
        if waited.is_err() {
            process
                .kill()
                .await
                .map_err(|e| SupervisorError::Process(e.to_string()))?;
        }

        if let Some(mut state) = self.states.get_mut(name) {
            state.phase = AgentPhase::Stopped;
        }
        Ok(())
    }

    /// Shuts down every agent in reverse topological order (§4.6).
    pub async fn shutdown_all(&self) -> Result<(), SupervisorError> {
        let mut order = self.launch_order().map_err(|_| SupervisorError::Process(
            "cannot compute shutdown order for a topology with unresolved cycles".to_string(),
        ))?;
        order.reverse();
        for name in order {
            self.shutdown(&name).await?;
        }
        Ok(())
    }
}

fn now_ms(time: &SharedTimeProvider) -> u64 {
    time.now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::process::ProcessError;
    use crate::supervisor::topology::parse_topology;
    use crate::time_provider::test_time_provider;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    struct FakeProcess {
        exited: bool,
    }

    #[async_trait]
    impl ManagedProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(1)
        }
        async fn request_shutdown(&mut self) -> Result<(), ProcessError> {
            self.exited = true;
            Ok(())
        }
        async fn kill(&mut self) -> Result<(), ProcessError> {
            self.exited = true;
            Ok(())
        }
        async fn wait(&mut self) -> Result<bool, ProcessError> {
            Ok(true)
        }
        fn has_exited(&mut self) -> bool {
            self.exited
        }
    }

    struct FakeLauncher {
        spawn_count: AtomicUsize,
    }

    #[async_trait]
    impl ProcessLauncher for FakeLauncher {
        async fn spawn(
            &self,
            _executable: &str,
            _args: &[String],
            _env: &HashMap<String, String>,
        ) -> Result<Box<dyn ManagedProcess>, ProcessError> {
            self.spawn_count.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(FakeProcess { exited: false }))
        }
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            start_grace: Duration::from_millis(50),
            shutdown_grace: Duration::from_millis(50),
            restart_initial_backoff: Duration::from_millis(1),
            restart_backoff_cap: Duration::from_millis(10),
            max_restart_attempts: 3,
        }
    }

    const YAML: &str = r"
core_services:
  - name: registry
    executable: /bin/registry
    host_affinity: primary
    port: 7000
    required: true
  - name: asr
    executable: /bin/asr
    host_affinity: primary
    port: 9001
    dependencies: [registry]
    required: true
    startup_priority: 1
";

    #[tokio::test]
    async fn dependent_cannot_start_before_dependency_is_ready() {
        let topology = parse_topology(YAML).unwrap();
        let launcher = Arc::new(FakeLauncher {
            spawn_count: AtomicUsize::new(0),
        });
        let supervisor = Supervisor::new(
            topology,
            config(),
            launcher,
            test_time_provider(),
            ErrorBus::new(16, test_time_provider()),
        );

        assert!(!supervisor.dependencies_ready("asr"));
        assert!(supervisor.dependencies_ready("registry"));

        supervisor.launch("registry").await.unwrap();
        assert!(!supervisor.dependencies_ready("asr"));
        supervisor.mark_ready("registry");
        assert!(supervisor.dependencies_ready("asr"));
    }

    #[tokio::test]
    async fn restart_backoff_grows_and_is_capped() {
        let cfg = config();
        let first = restart_backoff(&cfg, 1);
        let second = restart_backoff(&cfg, 2);
        let far = restart_backoff(&cfg, 10);
        assert!(second >= first);
        assert_eq!(far, cfg.restart_backoff_cap);
    }

    #[tokio::test]
    async fn required_agent_restarts_after_failure() {
        let topology = parse_topology(YAML).unwrap();
        let launcher = Arc::new(FakeLauncher {
            spawn_count: AtomicUsize::new(0),
        });
        let supervisor = Supervisor::new(
            topology,
            config(),
            launcher.clone(),
            test_time_provider(),
            ErrorBus::new(16, test_time_provider()),
        );

        supervisor.launch("registry").await.unwrap();
        supervisor.mark_ready("registry");
        // Escape the start grace window before reporting failure.
        supervisor.observe_health("registry", AgentHealthState::Ready).await;

        supervisor.observe_health("registry", AgentHealthState::Failed).await;
        let state = supervisor.state_of("registry").unwrap();
        assert_eq!(state.restart_count.into_inner(), 1);
        assert_eq!(launcher.spawn_count.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn exhausting_restart_attempts_broadcasts_fatal_and_publishes_to_error_bus() {
        let topology = parse_topology(YAML).unwrap();
        let launcher = Arc::new(FakeLauncher {
            spawn_count: AtomicUsize::new(0),
        });
        let error_bus = ErrorBus::new(16, test_time_provider());
        let supervisor = Supervisor::new(
            topology,
            config(),
            launcher.clone(),
            test_time_provider(),
            error_bus.clone(),
        );
        let mut fatal_rx = supervisor.subscribe_fatal();
        let mut error_rx = error_bus.subscribe();

        supervisor.launch("registry").await.unwrap();

        for _ in 0..=config().max_restart_attempts {
            // mark_ready bypasses the start-grace early return so each
            // failure in the loop is actually observed, mirroring how a
            // real agent would alternate between probes succeeding and
            // then failing across restarts.
            supervisor.mark_ready("registry");
            supervisor.observe_health("registry", AgentHealthState::Failed).await;
        }

        let fatal = fatal_rx.try_recv().expect("a fatal error should have been broadcast");
        assert!(matches!(fatal, SupervisorError::RequiredAgentFailed { name } if name == "registry"));

        let mut saw_required_agent_failed = false;
        while let Ok(record) = error_rx.try_recv() {
            if record.kind == "required_agent_failed" {
                saw_required_agent_failed = true;
            }
        }
        assert!(saw_required_agent_failed);

        let state = supervisor.state_of("registry").unwrap();
        assert!(state.last_failure_reason.is_some());
    }

    #[tokio::test]
    async fn non_required_agent_is_not_auto_restarted() {
        let yaml = r"
group:
  - name: optional
    executable: /bin/optional
    host_affinity: any
    port: 9000
    required: false
";
        let topology = parse_topology(yaml).unwrap();
        let launcher = Arc::new(FakeLauncher {
            spawn_count: AtomicUsize::new(0),
        });
        let supervisor = Supervisor::new(
            topology,
            config(),
            launcher.clone(),
            test_time_provider(),
            ErrorBus::new(16, test_time_provider()),
        );

        supervisor.launch("optional").await.unwrap();
        supervisor.observe_health("optional", AgentHealthState::Ready).await;
        supervisor.observe_health("optional", AgentHealthState::Failed).await;

        assert_eq!(launcher.spawn_count.load(Ordering::Relaxed), 1);
    }
}
