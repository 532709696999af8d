//! Meridian supervisor — the long-running process that loads a topology
//! document and launches, probes, and restarts the agents it names.
//!
//! For interactive operator commands (`stop`, `status`, `restart`,
//! `inspect`, `topology validate`), see the separate `meridian-cli` binary;
//! this process is the one they talk to.

use std::process::ExitCode;

use meridian_runtime::config::{ConfigError, RuntimeConfig};
use meridian_runtime::entry::run_supervisor;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::from(2);
        }
    };

    init_tracing(&config);

    match run_supervisor(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "supervisor exited with an error");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}

fn load_config() -> Result<RuntimeConfig, ConfigError> {
    let base = if std::env::var("MERIDIAN_ENV").as_deref() == Ok("production") {
        RuntimeConfig::production()
    } else {
        RuntimeConfig::development()
    };
    base.apply_env_overlay()
}

fn init_tracing(config: &RuntimeConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
