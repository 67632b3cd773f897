//! wgswap Service - systemd Unit Control
//!
//! Stops and starts the proxy around a configuration rewrite. Every
//! `systemctl` invocation is bounded by a timeout and the child is killed
//! if the timeout fires.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Default bound on a single `systemctl` call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(11);

/// Service control errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("Failed to run {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("{action} {unit} timed out after {timeout:?}")]
    Timeout {
        action: &'static str,
        unit: String,
        timeout: Duration,
    },

    #[error("{action} {unit} failed ({status}): {stderr}")]
    Failed {
        action: &'static str,
        unit: String,
        status: String,
        stderr: String,
    },
}

/// Lifecycle operations on a service unit
pub trait ServiceManager {
    /// Whether the unit is currently active
    fn is_active(&self, unit: &str) -> impl Future<Output = Result<bool, ServiceError>> + Send;

    /// Stop the unit, waiting for the stop job to finish
    fn stop(&self, unit: &str) -> impl Future<Output = Result<(), ServiceError>> + Send;

    /// Start the unit, waiting for the start job to finish
    fn start(&self, unit: &str) -> impl Future<Output = Result<(), ServiceError>> + Send;
}

/// `systemctl`-backed [`ServiceManager`]
#[derive(Debug, Clone)]
pub struct Systemctl {
    program: PathBuf,
    timeout: Duration,
}

struct CommandOutput {
    success: bool,
    status: String,
    stdout: String,
    stderr: String,
}

impl Systemctl {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: PathBuf::from("systemctl"),
            timeout,
        }
    }

    /// Use a different executable in place of `systemctl`
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, action: &'static str, unit: &str) -> Result<CommandOutput, ServiceError> {
        debug!("Running {} {} {}", self.program.display(), action, unit);

        let child = Command::new(&self.program)
            .args([action, unit])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ServiceError::Spawn {
                program: self.program.display().to_string(),
                reason: e.to_string(),
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ServiceError::Timeout {
                action,
                unit: unit.to_string(),
                timeout: self.timeout,
            })?
            .map_err(|e| ServiceError::Spawn {
                program: self.program.display().to_string(),
                reason: e.to_string(),
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            status: output.status.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn run_checked(&self, action: &'static str, unit: &str) -> Result<(), ServiceError> {
        let output = self.run(action, unit).await?;
        if !output.success {
            return Err(ServiceError::Failed {
                action,
                unit: unit.to_string(),
                status: output.status,
                stderr: output.stderr,
            });
        }
        Ok(())
    }
}

impl Default for Systemctl {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

/// `systemctl is-active` prints the unit state on stdout
fn reports_active(stdout: &str) -> bool {
    stdout.trim() == "active"
}

impl ServiceManager for Systemctl {
    async fn is_active(&self, unit: &str) -> Result<bool, ServiceError> {
        // Non-zero exit just means "not active"
        let output = self.run("is-active", unit).await?;
        let active = reports_active(&output.stdout);
        debug!("{} is-active: {}", unit, output.stdout.trim());
        Ok(active)
    }

    async fn stop(&self, unit: &str) -> Result<(), ServiceError> {
        self.run_checked("stop", unit).await?;
        info!("Stopped {}", unit);
        Ok(())
    }

    async fn start(&self, unit: &str) -> Result<(), ServiceError> {
        self.run_checked("start", unit).await?;
        info!("Started {}", unit);
        Ok(())
    }
}
