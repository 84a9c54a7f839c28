//! Managed child process wrapper

use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, warn};

use crate::{
    config::ProcessConfig,
    error::{ProcessError, Result},
};

/// Delay between SIGTERM and SIGKILL when killing a process group
#[cfg(unix)]
const SIGKILL_ESCALATION_MS: u64 = 200;

/// Wrapper around `tokio::process::Child` with lifecycle management
#[derive(Debug)]
pub struct ManagedChild {
    child: Child,
    config: ProcessConfig,
    pid: u32,
}

impl ManagedChild {
    pub(crate) fn new(child: Child, pid: u32, config: ProcessConfig) -> Self {
        Self { child, config, pid }
    }

    /// Process ID
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Process configuration
    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Check if process is still running
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit status if the process has already exited
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Wait for process to exit, honouring the configured timeout
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        match self.config.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.child.wait())
                .await
                .map_err(|_| ProcessError::Timeout {
                    seconds: timeout.as_secs(),
                })?
                .map_err(Into::into),
            None => self.child.wait().await.map_err(Into::into),
        }
    }

    /// Kill the process and wait for it to exit
    pub async fn shutdown(&mut self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        debug!(pid = %self.pid, "Shutting down process");

        if let Err(e) = self.child.start_kill() {
            warn!(pid = %self.pid, error = %e, "Failed to kill process");
            return Err(ProcessError::KillFailed(e.to_string()));
        }

        self.reap(self.config.shutdown_grace).await
    }

    /// Kill process tree (process and all descendants)
    ///
    /// - Windows: `taskkill /pid <pid> /f /t`
    /// - Unix: SIGTERM then SIGKILL to the process group
    pub async fn kill_tree(&mut self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        debug!(pid = %self.pid, "Killing process tree");

        #[cfg(windows)]
        {
            use tokio::process::Command;

            let status = Command::new("taskkill")
                .args(["/pid", &self.pid.to_string(), "/f", "/t"])
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status()
                .await
                .map_err(|e| ProcessError::KillFailed(e.to_string()))?;
            if !status.success() {
                warn!(pid = %self.pid, "taskkill failed, killing process only");
                let _ = self.child.start_kill();
            }
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let pgid = Pid::from_raw(self.pid as i32);

            if let Err(e) = killpg(pgid, Signal::SIGTERM) {
                warn!(pid = %self.pid, error = %e, "Failed to send SIGTERM, killing process only");
                let _ = self.child.start_kill();
            }

            let escalation = Duration::from_millis(SIGKILL_ESCALATION_MS);
            if tokio::time::timeout(escalation, self.child.wait()).await.is_err() {
                debug!(pid = %self.pid, "Escalating to SIGKILL");
                if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                    warn!(pid = %self.pid, error = %e, "Failed to send SIGKILL, killing process only");
                    let _ = self.child.start_kill();
                }
            }
        }

        self.reap(self.config.shutdown_grace).await
    }

    async fn reap(&mut self, grace: Duration) -> Result<()> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = %self.pid, status = %status, "Process exited");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(pid = %self.pid, error = %e, "Error waiting for process");
                Err(ProcessError::KillFailed(e.to_string()))
            }
            Err(_) => {
                warn!(pid = %self.pid, "Timeout waiting for process to exit");
                Err(ProcessError::Timeout {
                    seconds: grace.as_secs(),
                })
            }
        }
    }

    /// Take stdout handle
    pub fn stdout(&mut self) -> Option<tokio::process::ChildStdout> {
        self.child.stdout.take()
    }

    /// Take stderr handle
    pub fn stderr(&mut self) -> Option<tokio::process::ChildStderr> {
        self.child.stderr.take()
    }
}
