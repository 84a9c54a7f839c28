//! Inference server backends
//!
//! The manager only needs to start a server against a model file, ask it
//! whether it is healthy and stop it. `LlamafileBackend` does this with a
//! llamafile child process; tests substitute an in-process backend.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use folio_process::{ManagedChild, ProcessConfig, ProcessManager};
use reqwest::{Client, StatusCode};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{config::RuntimeConfig, error::RuntimeError, Result};

/// Health of a started inference server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    /// Accepting requests
    Ready,
    /// Running but not serving yet (loading weights)
    Starting,
    /// The process is gone
    Exited(String),
}

/// Starts inference servers
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Start a server for `model_path` listening on `port`
    ///
    /// Returns as soon as the server process exists; readiness is observed
    /// through [`InferenceHandle::health`].
    async fn start(&self, model_path: &Path, port: u16) -> Result<Arc<dyn InferenceHandle>>;
}

/// A started inference server
#[async_trait]
pub trait InferenceHandle: Send + Sync {
    fn port(&self) -> u16;

    fn pid(&self) -> Option<u32>;

    async fn health(&self) -> Health;

    /// Stop the server. Calling it twice is a no-op.
    async fn stop(&self) -> Result<()>;
}

/// Backend that runs the llamafile executable in server mode
pub struct LlamafileBackend {
    config: RuntimeConfig,
    processes: ProcessManager,
    client: Client,
}

impl LlamafileBackend {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.health_timeout())
            .build()
            .map_err(|e| RuntimeError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            processes: ProcessManager::new(),
            client,
        })
    }

    /// Command line for serving `model_path` on `port`
    pub fn process_config(&self, model_path: &Path, port: u16) -> ProcessConfig {
        let mut process = ProcessConfig::new(self.config.llamafile_path.to_string_lossy())
            .args([
                "--server",
                "--nobrowser",
                "--host",
                self.config.host.as_str(),
            ])
            .arg("--port")
            .arg(port.to_string())
            .arg("-m")
            .arg(model_path.to_string_lossy());

        if let Some(ctx) = self.config.context_size {
            process = process.arg("-c").arg(ctx.to_string());
        }
        if let Some(layers) = self.config.gpu_layers {
            process = process.arg("-ngl").arg(layers.to_string());
        }
        for extra in &self.config.extra_args {
            process = process.arg(extra.as_str());
        }
        if let Some(dir) = model_path.parent() {
            process = process.working_dir(dir);
        }

        process
            .capture_stdout(false)
            .capture_stderr(true)
            .shutdown_grace(Duration::from_secs(5))
    }
}

#[async_trait]
impl InferenceBackend for LlamafileBackend {
    async fn start(&self, model_path: &Path, port: u16) -> Result<Arc<dyn InferenceHandle>> {
        let process = self.process_config(model_path, port);
        info!(
            model = %model_path.display(),
            port,
            command = %process.command_line(),
            "Starting llamafile server"
        );

        let mut child = self.processes.spawn(process).await?;
        let pid = child.pid();

        if let Some(stderr) = child.stderr() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "llamafile", pid, "{}", line);
                }
            });
        }

        Ok(Arc::new(LlamafileHandle {
            child: Mutex::new(Some(child)),
            pid,
            port,
            health_url: format!("http://{}:{}/health", self.config.host, port),
            client: self.client.clone(),
        }))
    }
}

struct LlamafileHandle {
    child: Mutex<Option<ManagedChild>>,
    pid: u32,
    port: u16,
    health_url: String,
    client: Client,
}

#[async_trait]
impl InferenceHandle for LlamafileHandle {
    fn port(&self) -> u16 {
        self.port
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn health(&self) -> Health {
        {
            let mut guard = self.child.lock().await;
            match guard.as_mut() {
                None => return Health::Exited("server was stopped".to_string()),
                Some(child) => {
                    if let Some(status) = child.exit_status() {
                        return Health::Exited(format!("llamafile exited with {}", status));
                    }
                }
            }
        }

        match self.client.get(&self.health_url).send().await {
            Ok(response) if response.status().is_success() => Health::Ready,
            Ok(response) if response.status() == StatusCode::SERVICE_UNAVAILABLE => {
                debug!(port = self.port, "llamafile still loading model");
                Health::Starting
            }
            Ok(response) => {
                debug!(port = self.port, status = %response.status(), "Unexpected health status");
                Health::Starting
            }
            Err(e) => {
                debug!(port = self.port, error = %e, "Health probe failed");
                Health::Starting
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            info!(pid = self.pid, port = self.port, "Stopping llamafile server");
            if let Err(e) = child.kill_tree().await {
                warn!(pid = self.pid, error = %e, "Failed to stop llamafile cleanly");
                return Err(e.into());
            }
        }
        Ok(())
    }
}

/// Ask the OS for a free TCP port on `host`
pub fn pick_free_port(host: &str) -> Result<u16> {
    let listener = std::net::TcpListener::bind((host, 0))?;
    Ok(listener.local_addr()?.port())
}
