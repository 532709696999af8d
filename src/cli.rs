//! Command-line surface for the supervisor binary: a top-level `Cli`
//! wrapping a `Command` enum, one variant per subcommand.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Meridian runtime supervisor: launches, probes, and restarts the agents
/// named in a topology document.
#[derive(Debug, Parser)]
#[command(name = "meridian-cli", version, about)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands (§6 "CLI surface").
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Starts the supervisor against a topology document, blocking until
    /// shutdown.
    Start {
        /// Path to the topology YAML document, or a directory containing
        /// exactly one.
        topology: PathBuf,
    },
    /// Requests orderly shutdown of a running supervisor.
    Stop,
    /// Prints the current lifecycle phase of every known agent.
    Status,
    /// Forces an immediate restart of one agent, bypassing its backoff
    /// schedule.
    Restart {
        /// Name of the agent to restart.
        agent: String,
    },
    /// Prints detailed runtime state for one agent.
    Inspect {
        /// Name of the agent to inspect.
        agent: String,
    },
    /// Topology-document operations.
    Topology {
        #[command(subcommand)]
        command: TopologyCommand,
    },
}

/// `meridian-cli topology ...` subcommands.
#[derive(Debug, Subcommand)]
pub enum TopologyCommand {
    /// Parses and validates a topology document without launching anything.
    Validate {
        /// Path to the topology document.
        file: PathBuf,
    },
}
