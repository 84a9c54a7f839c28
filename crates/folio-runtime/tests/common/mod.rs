//! Shared fixtures for runtime integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use folio_runtime::{
    DownloadState, Health, InferenceBackend, InferenceHandle, ModelCatalog, ModelDescriptor,
    ModelRuntimeManager, ModelStatus, RuntimeConfig,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// In-process stand-in for the llamafile server
#[derive(Default)]
pub struct FakeBackend {
    starts: AtomicUsize,
    live: Arc<AtomicUsize>,
    broken_files: Mutex<HashSet<String>>,
    stalled_files: Mutex<HashSet<String>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Servers started for this file never become healthy
    pub fn break_model(&self, filename: &str) {
        self.broken_files.lock().unwrap().insert(filename.to_string());
    }

    pub fn fix_model(&self, filename: &str) {
        self.broken_files.lock().unwrap().remove(filename);
        self.stalled_files.lock().unwrap().remove(filename);
    }

    /// Servers started for this file report `Starting` forever
    pub fn stall_model(&self, filename: &str) {
        self.stalled_files.lock().unwrap().insert(filename.to_string());
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Servers started and not yet stopped
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for FakeBackend {
    async fn start(
        &self,
        model_path: &Path,
        port: u16,
    ) -> folio_runtime::Result<Arc<dyn InferenceHandle>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);

        let filename = model_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let health = if self.broken_files.lock().unwrap().contains(&filename) {
            Health::Exited("failed to load model".to_string())
        } else if self.stalled_files.lock().unwrap().contains(&filename) {
            Health::Starting
        } else {
            Health::Ready
        };

        Ok(Arc::new(FakeHandle {
            port,
            health,
            alive: AtomicBool::new(true),
            live: self.live.clone(),
        }))
    }
}

struct FakeHandle {
    port: u16,
    health: Health,
    alive: AtomicBool,
    live: Arc<AtomicUsize>,
}

#[async_trait]
impl InferenceHandle for FakeHandle {
    fn port(&self) -> u16 {
        self.port
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    async fn health(&self) -> Health {
        if !self.alive.load(Ordering::SeqCst) {
            Health::Exited("stopped".to_string())
        } else {
            self.health.clone()
        }
    }

    async fn stop(&self) -> folio_runtime::Result<()> {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Descriptor served from `base_url`
pub fn descriptor(base_url: &str, id: &str, body: &[u8]) -> ModelDescriptor {
    let filename = format!("{}.gguf", id);
    ModelDescriptor {
        id: id.to_string(),
        name: id.to_uppercase(),
        url: format!("{}/{}", base_url, filename),
        filename,
        size_bytes: body.len() as u64,
        description: format!("test model {}", id),
        recommended: false,
        sha256: None,
    }
}

/// Fake model weights of a given length
pub fn weights(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

pub fn test_config(root: &Path) -> RuntimeConfig {
    RuntimeConfig {
        startup_timeout_secs: 2,
        health_timeout_ms: 200,
        download_connect_timeout_secs: 2,
        download_idle_timeout_secs: 5,
        restore_active_model: false,
        ..RuntimeConfig::with_root(root)
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub backend: Arc<FakeBackend>,
    pub manager: ModelRuntimeManager,
}

pub fn harness(entries: Vec<ModelDescriptor>) -> Harness {
    let dir = TempDir::new().unwrap();
    harness_in(dir, entries, |config| config)
}

pub fn harness_in(
    dir: TempDir,
    entries: Vec<ModelDescriptor>,
    configure: impl FnOnce(RuntimeConfig) -> RuntimeConfig,
) -> Harness {
    let backend = FakeBackend::new();
    let manager = ModelRuntimeManager::builder(configure(test_config(dir.path())))
        .catalog(ModelCatalog::new(entries).unwrap())
        .backend(backend.clone())
        .build()
        .unwrap();
    Harness {
        dir,
        backend,
        manager,
    }
}

pub async fn status_of(manager: &ModelRuntimeManager, id: &str) -> ModelStatus {
    manager
        .list_models()
        .await
        .into_iter()
        .find(|model| model.id() == id)
        .expect("model should be listed")
}

/// Poll `list_models` until the model reaches `state`
pub async fn wait_for_state(
    manager: &ModelRuntimeManager,
    id: &str,
    state: DownloadState,
) -> ModelStatus {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let status = status_of(manager, id).await;
            if status.download_state == state {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never reached {:?}", id, state))
}

/// Download a model and wait until it is complete
pub async fn install(manager: &ModelRuntimeManager, id: &str) -> ModelStatus {
    manager.download_model(id).await.unwrap();
    wait_for_state(manager, id, DownloadState::Complete).await
}

/// HTTP server that announces `announced` bytes, sends `sent` bytes and then
/// either hangs up or keeps the connection open without sending more.
pub async fn partial_body_server(announced: usize, sent: usize, hang: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut request = [0u8; 4096];
                let _ = socket.read(&mut request).await;

                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\n\r\n",
                    announced
                );
                let _ = socket.write_all(header.as_bytes()).await;
                let _ = socket.write_all(&weights(sent, 7)).await;
                let _ = socket.flush().await;

                if hang {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
            });
        }
    });

    format!("http://{}", addr)
}
