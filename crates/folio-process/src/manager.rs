//! Process manager - spawning and lifecycle orchestration

use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::{
    child::ManagedChild,
    config::ProcessConfig,
    error::{ProcessError, Result},
};

/// Spawns and stops supervised child processes
#[derive(Debug, Clone, Copy)]
pub struct ProcessManager;

impl ProcessManager {
    /// Create new process manager
    pub fn new() -> Self {
        Self
    }

    /// Spawn a managed process
    ///
    /// On Unix the child is placed in its own process group so that
    /// [`ManagedChild::kill_tree`] reaches every descendant. The child is
    /// killed if its handle is dropped.
    ///
    /// # Examples
    /// ```no_run
    /// use folio_process::{ProcessConfig, ProcessManager};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let manager = ProcessManager::new();
    /// let config = ProcessConfig::new("echo").args(["hello"]);
    /// let child = manager.spawn(config).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn spawn(&self, config: ProcessConfig) -> Result<ManagedChild> {
        if config.command.trim().is_empty() {
            return Err(ProcessError::InvalidConfig(
                "command cannot be empty".to_string(),
            ));
        }

        debug!(
            command = %config.command,
            args = ?config.args,
            "Spawning process"
        );

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);

        if let Some(ref dir) = config.working_dir {
            cmd.current_dir(dir);
        }

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(if config.capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stderr(if config.capture_stderr {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            ProcessError::SpawnFailed(std::io::Error::new(
                std::io::ErrorKind::Other,
                "Failed to get process ID",
            ))
        })?;

        info!(pid = %pid, command = %config.command, "Process spawned");

        Ok(ManagedChild::new(child, pid, config))
    }

    /// Gracefully shutdown a process
    pub async fn shutdown(&self, mut child: ManagedChild) -> Result<()> {
        child.shutdown().await
    }

    /// Kill a process tree (process and all descendants)
    pub async fn kill_tree(&self, mut child: ManagedChild) -> Result<()> {
        child.kill_tree().await
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}
