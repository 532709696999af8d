//! `meridian-cli` — operator front end for a `meridian-supervisor` process:
//! starts one in the foreground, or sends a control-plane request to one
//! already running (`SPEC_FULL.md` §6 "CLI surface").

use std::process::ExitCode;

use clap::Parser;
use meridian_runtime::cli::{Cli, Command, TopologyCommand};
use meridian_runtime::config::RuntimeConfig;
use meridian_runtime::entry::{control_connect_addr, run_supervisor, send_control_request};
use meridian_runtime::supervisor::topology::load_topology;
use meridian_runtime::transport::wire::{ControlRequest, ControlResponse};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Start { topology } => start(topology).await,
        Command::Stop => control(ControlRequest::Stop).await,
        Command::Status => control(ControlRequest::Status).await,
        Command::Restart { agent } => control(ControlRequest::Restart { agent }).await,
        Command::Inspect { agent } => control(ControlRequest::Inspect { agent }).await,
        Command::Topology {
            command: TopologyCommand::Validate { file },
        } => validate_topology(&file),
    }
}

async fn start(topology_path: std::path::PathBuf) -> ExitCode {
    let mut config = RuntimeConfig::development();
    config.topology_path = topology_path;
    let config = match config.apply_env_overlay() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::from(2);
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.log_level.clone()))
        .init();

    match run_supervisor(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("supervisor exited with an error: {e}");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}

async fn control(request: ControlRequest) -> ExitCode {
    let config = RuntimeConfig::development();
    let addr = control_connect_addr(&config);
    match send_control_request(&addr, &request).await {
        Ok(ControlResponse::Ok { data }) => {
            println!("{}", serde_json::to_string_pretty(&data).unwrap_or_default());
            ExitCode::SUCCESS
        }
        Ok(ControlResponse::UnknownAgent { name }) => {
            eprintln!("unknown agent: {name}");
            ExitCode::FAILURE
        }
        Ok(ControlResponse::Error { message }) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("could not reach the supervisor at {addr}: {e}");
            ExitCode::FAILURE
        }
    }
}

fn validate_topology(file: &std::path::Path) -> ExitCode {
    match load_topology(file) {
        Ok(topology) => {
            println!("topology valid: {} agents", topology.agents.len());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("topology invalid: {e}");
            ExitCode::from(3)
        }
    }
}
