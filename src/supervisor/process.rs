//! Process lifecycle primitives: spawn, orderly-shutdown signal, and
//! force-terminate, abstracted behind [`ProcessLauncher`] so the supervisor's
//! scheduling logic can be tested without spawning real OS processes.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::process::{Child, Command};

/// Errors raised while launching or controlling a process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The executable could not be spawned.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// Sending the orderly-shutdown signal failed.
    #[error("failed to signal process: {0}")]
    SignalFailed(String),
}

/// A handle to a running (or exited) agent process.
#[async_trait]
pub trait ManagedProcess: Send + Sync {
    /// OS process id, where applicable.
    fn pid(&self) -> Option<u32>;

    /// Requests an orderly shutdown (SIGTERM on Unix platforms; the
    /// platform equivalent elsewhere).
    async fn request_shutdown(&mut self) -> Result<(), ProcessError>;

    /// Forcibly terminates the process.
    async fn kill(&mut self) -> Result<(), ProcessError>;

    /// Waits for the process to exit, returning whether it exited cleanly.
    async fn wait(&mut self) -> Result<bool, ProcessError>;

    /// True if the process has already exited.
    fn has_exited(&mut self) -> bool;
}

/// Spawns agent processes. The production implementation
/// ([`TokioProcessLauncher`]) wraps `tokio::process::Command`; tests inject
/// an in-memory fake so restart/backoff logic can be exercised without
/// touching the OS.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Spawns `executable` with `args` and `env`, returning a handle.
    async fn spawn(
        &self,
        executable: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Box<dyn ManagedProcess>, ProcessError>;
}

/// Wraps a real `tokio::process::Child`.
pub struct TokioManagedProcess {
    child: Child,
}

#[async_trait]
impl ManagedProcess for TokioManagedProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn request_shutdown(&mut self) -> Result<(), ProcessError> {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                let status = std::process::Command::new("kill")
                    .args(["-TERM", &pid.to_string()])
                    .status();
                if status.is_ok_and(|s| s.success()) {
                    return Ok(());
                }
            }
            self.kill().await
        }
        #[cfg(not(unix))]
        {
            self.kill().await
        }
    }

    async fn kill(&mut self) -> Result<(), ProcessError> {
        self.child
            .kill()
            .await
            .map_err(|e| ProcessError::SignalFailed(e.to_string()))
    }

    async fn wait(&mut self) -> Result<bool, ProcessError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;
        Ok(status.success())
    }

    fn has_exited(&mut self) -> bool {
        self.child.try_wait().ok().flatten().is_some()
    }
}

/// Production [`ProcessLauncher`], spawning real child processes.
#[derive(Debug, Default)]
pub struct TokioProcessLauncher;

#[async_trait]
impl ProcessLauncher for TokioProcessLauncher {
    async fn spawn(
        &self,
        executable: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Box<dyn ManagedProcess>, ProcessError> {
        let child = Command::new(executable)
            .args(args)
            .envs(env)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;
        Ok(Box::new(TokioManagedProcess { child }))
    }
}
