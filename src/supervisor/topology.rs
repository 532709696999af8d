//! Topology parsing and DAG validation (C6, `SPEC_FULL.md` §4.6, §6).

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain_types::{HostAffinity, PortNumber, StartupPriority, VramMb};

/// Errors raised while loading or validating a topology.
#[derive(Debug, Error, Clone)]
pub enum TopologyError {
    /// The document could not be parsed as YAML.
    #[error("failed to parse topology document: {0}")]
    Parse(String),

    /// `TOPOLOGY_PATH` resolved to a directory containing more than one
    /// candidate file.
    #[error("ambiguous topology path {0}: multiple candidate files found")]
    AmbiguousPath(PathBuf),

    /// The named file does not exist.
    #[error("topology file not found: {0}")]
    NotFound(PathBuf),

    /// Two agents declared the same name.
    #[error("duplicate agent name: {0}")]
    DuplicateName(String),

    /// An agent declared a dependency on an unknown name.
    #[error("agent {agent} depends on unknown agent {dependency}")]
    UnknownDependency {
        /// The agent with the bad dependency.
        agent: String,
        /// The dependency name that does not resolve.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("topology contains a dependency cycle among: {0:?}")]
    Cycle(Vec<String>),
}

/// One agent's declarative specification, as parsed from the topology
/// document (`SPEC_FULL.md` §3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSpec {
    /// Unique, stable name.
    pub name: String,
    /// Path or command used to launch the agent.
    pub executable: String,
    /// Arguments passed to `executable`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Which machine this agent must (or may) run on.
    pub host_affinity: HostAffinity,
    /// Request port.
    pub port: PortNumber,
    /// Health-probe port; defaults to `port + 1000`.
    pub health_port: Option<PortNumber>,
    /// Names of agents that must be `Ready` before this one starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Whether a start/restart failure of this agent is fatal to the system.
    #[serde(default)]
    pub required: bool,
    /// Tie-breaker among agents at the same topological level.
    #[serde(default)]
    pub startup_priority: StartupPriority,
    /// Opaque parameters passed to the agent.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Environment variable overlay for this agent's process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Resource hints used by placement/admission decisions.
    #[serde(default)]
    pub resource_hints: ResourceHints,
}

impl AgentSpec {
    /// Resolves the effective health port: the declared one, or
    /// `port + 1000`.
    #[must_use]
    pub fn health_port(&self) -> u16 {
        self.health_port
            .map(PortNumber::into_inner)
            .unwrap_or_else(|| self.port.into_inner().saturating_add(1000))
    }
}

/// Hints about the resources an agent is expected to need.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceHints {
    /// Whether this agent requires GPU/VRAM capacity.
    #[serde(default)]
    pub gpu_required: bool,
    /// Estimated VRAM usage, if `gpu_required`.
    pub est_vram_mb: Option<VramMb>,
}

/// Global topology sections alongside the per-group agent lists.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Environment overlay applied to every agent unless overridden.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Health-check tuning shared by all agents.
    #[serde(default)]
    pub health_checks: Option<HealthCheckSettings>,
    /// Network-level settings (bind addresses, peer endpoint).
    #[serde(default)]
    pub network: Option<NetworkSettings>,
}

/// Shared health-check tuning.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckSettings {
    /// Seconds between probes.
    pub interval_s: u64,
    /// Probe round-trip timeout, seconds.
    pub timeout_s: u64,
    /// Consecutive failures before escalation.
    pub retries: u32,
    /// Grace window after start before failures count.
    pub start_period_seconds: u64,
}

/// Network-level topology settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkSettings {
    /// Local bind address.
    pub bind_address: String,
    /// Peer node's endpoint, for cross-machine routing.
    pub peer_endpoint: Option<String>,
}

/// A fully parsed topology: every agent group flattened, plus global
/// settings and any unrecognized top-level groups preserved verbatim.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    /// All agents across every declared group.
    pub agents: Vec<AgentSpec>,
    /// Global settings section.
    pub global: GlobalSettings,
    /// Unknown top-level keys, preserved but not interpreted (§6).
    pub passthrough: HashMap<String, serde_yaml::Value>,
}

const KNOWN_GLOBAL_KEYS: &[&str] = &["environment", "resource_limits", "health_checks", "network"];

/// Loads and validates the topology named by `path`. If `path` is a
/// directory, exactly one `*.yaml`/`*.yml` file must be present in it
/// (resolves the "canonical topology" open question, `SPEC_FULL.md` §9).
pub fn load_topology(path: &Path) -> Result<Topology, TopologyError> {
    let file_path = resolve_file(path)?;
    let contents = std::fs::read_to_string(&file_path)
        .map_err(|e| TopologyError::Parse(e.to_string()))?;
    parse_topology(&contents)
}

fn resolve_file(path: &Path) -> Result<PathBuf, TopologyError> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if path.is_dir() {
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(path)
            .map_err(|e| TopologyError::Parse(e.to_string()))?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext == "yaml" || ext == "yml")
            })
            .collect();
        candidates.sort();
        return match candidates.len() {
            0 => Err(TopologyError::NotFound(path.to_path_buf())),
            1 => Ok(candidates.remove(0)),
            _ => Err(TopologyError::AmbiguousPath(path.to_path_buf())),
        };
    }
    Err(TopologyError::NotFound(path.to_path_buf()))
}

/// Parses a topology document's raw YAML text (split out from
/// [`load_topology`] so tests can exercise it without a filesystem fixture).
pub fn parse_topology(contents: &str) -> Result<Topology, TopologyError> {
    let document: serde_yaml::Value =
        serde_yaml::from_str(contents).map_err(|e| TopologyError::Parse(e.to_string()))?;
    let mapping = document
        .as_mapping()
        .ok_or_else(|| TopologyError::Parse("top-level document must be a mapping".to_string()))?;

    let mut agents = Vec::new();
    let mut passthrough = HashMap::new();
    let mut global = GlobalSettings::default();

    for (key, value) in mapping {
        let key_str = key
            .as_str()
            .ok_or_else(|| TopologyError::Parse("top-level keys must be strings".to_string()))?;

        if key_str == "environment" {
            global.environment = serde_yaml::from_value(value.clone())
                .map_err(|e| TopologyError::Parse(e.to_string()))?;
        } else if key_str == "health_checks" {
            global.health_checks = Some(
                serde_yaml::from_value(value.clone())
                    .map_err(|e| TopologyError::Parse(e.to_string()))?,
            );
        } else if key_str == "network" {
            global.network = Some(
                serde_yaml::from_value(value.clone())
                    .map_err(|e| TopologyError::Parse(e.to_string()))?,
            );
        } else if key_str == "resource_limits" {
            // Global CPU/RAM/thread soft limits are accepted and preserved
            // verbatim; they are a deployment concern outside the agent
            // DAG, so they are not interpreted by the supervisor itself.
            passthrough.insert(key_str.to_string(), value.clone());
        } else if KNOWN_GLOBAL_KEYS.contains(&key_str) {
            // unreachable given the checks above, kept for clarity when a
            // new known key is added without a matching branch.
        } else {
            let group: Vec<AgentSpec> = serde_yaml::from_value(value.clone())
                .map_err(|e| TopologyError::Parse(format!("group {key_str}: {e}")))?;
            agents.extend(group);
        }
    }

    validate_unique_names(&agents)?;
    validate_dependencies_resolve(&agents)?;
    topological_order(&agents)?;

    Ok(Topology {
        agents,
        global,
        passthrough,
    })
}

fn validate_unique_names(agents: &[AgentSpec]) -> Result<(), TopologyError> {
    let mut seen = HashSet::new();
    for agent in agents {
        if !seen.insert(agent.name.clone()) {
            return Err(TopologyError::DuplicateName(agent.name.clone()));
        }
    }
    Ok(())
}

fn validate_dependencies_resolve(agents: &[AgentSpec]) -> Result<(), TopologyError> {
    let names: HashSet<&str> = agents.iter().map(|a| a.name.as_str()).collect();
    for agent in agents {
        for dep in &agent.dependencies {
            if !names.contains(dep.as_str()) {
                return Err(TopologyError::UnknownDependency {
                    agent: agent.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Computes a topological launch order via Kahn's algorithm, tie-broken by
/// `startup_priority` ascending then `name` ascending (§5). Returns the
/// ordered agent names, or [`TopologyError::Cycle`] naming every node left
/// with unresolved in-degree.
pub fn topological_order(agents: &[AgentSpec]) -> Result<Vec<String>, TopologyError> {
    let by_name: HashMap<&str, &AgentSpec> = agents.iter().map(|a| (a.name.as_str(), a)).collect();
    let mut in_degree: HashMap<&str, usize> =
        agents.iter().map(|a| (a.name.as_str(), a.dependencies.len())).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for agent in agents {
        for dep in &agent.dependencies {
            dependents.entry(dep.as_str()).or_default().push(&agent.name);
        }
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(name, _)| *name)
        .collect();
    sort_ready(&mut ready, &by_name);

    let mut order = Vec::with_capacity(agents.len());
    while let Some(name) = ready.first().copied() {
        ready.remove(0);
        order.push(name.to_string());
        if let Some(next) = dependents.get(name) {
            let mut newly_ready = Vec::new();
            for &dependent in next {
                let degree = in_degree.get_mut(dependent).expect("known agent");
                *degree -= 1;
                if *degree == 0 {
                    newly_ready.push(dependent);
                }
            }
            ready.extend(newly_ready);
        }
        sort_ready(&mut ready, &by_name);
    }

    if order.len() != agents.len() {
        let remaining: Vec<String> = in_degree
            .iter()
            .filter(|(_, &deg)| deg > 0)
            .map(|(name, _)| (*name).to_string())
            .collect();
        return Err(TopologyError::Cycle(remaining));
    }
    Ok(order)
}

fn sort_ready(ready: &mut [&str], by_name: &HashMap<&str, &AgentSpec>) {
    ready.sort_by(|a, b| {
        let spec_a = by_name[a];
        let spec_b = by_name[b];
        spec_a
            .startup_priority
            .cmp(&spec_b.startup_priority)
            .then_with(|| spec_a.name.cmp(&spec_b.name))
    });
}

/// Computes the transitive closure of every `required = true` agent's
/// dependencies. Any agent in that closure is *effectively required* even
/// if its own `required` flag is `false` (`SPEC_FULL.md` §4.6).
#[must_use]
pub fn effectively_required_closure(agents: &[AgentSpec]) -> HashSet<String> {
    let by_name: HashMap<&str, &AgentSpec> = agents.iter().map(|a| (a.name.as_str(), a)).collect();
    let mut closure = HashSet::new();
    let mut queue: VecDeque<&str> = agents
        .iter()
        .filter(|a| a.required)
        .map(|a| a.name.as_str())
        .collect();

    while let Some(name) = queue.pop_front() {
        if let Some(spec) = by_name.get(name) {
            for dep in &spec.dependencies {
                if closure.insert(dep.clone()) {
                    queue.push_back(dep.as_str());
                }
            }
        }
    }
    closure
}
