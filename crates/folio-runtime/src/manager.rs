//! Model runtime manager
//!
//! Owns the install state of every catalog entry, the download tasks and the
//! single active inference server.
//!
//! Locking:
//! - `models` (sync `RwLock`) holds install state; every update replaces the
//!   fields of one entry under a single write guard, so readers never see a
//!   half-applied transition. Each entry carries a generation so a disk scan
//!   that raced with a transition is discarded instead of applied.
//! - `op_locks` (one async mutex per model id) serialize download acceptance
//!   and deletion for that id.
//! - `activation` (async mutex) serializes everything that touches the
//!   inference server. Deletion takes it before the per-id lock.
//! - `active` (sync `RwLock`) is the active-model register. It is written only
//!   while `activation` is held and read without waiting by status queries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    backend::{pick_free_port, Health, InferenceBackend, InferenceHandle, LlamafileBackend},
    catalog::{ModelCatalog, ModelDescriptor},
    config::RuntimeConfig,
    download::{Downloader, TransferError},
    error::RuntimeError,
    events::{EventBus, RuntimeEvent},
    models::{DownloadProgress, DownloadState, ModelInstallState, ModelStatus, RuntimeStatus},
    store::{ModelStore, PersistedState},
    Result,
};

/// First delay between health probes while a server starts
const INITIAL_HEALTH_BACKOFF_MS: u64 = 100;

/// Upper bound on the delay between health probes
const MAX_HEALTH_BACKOFF_MS: u64 = 2000;

/// Progress events are published every this many percent
const PROGRESS_EVENT_STEP_PERCENT: f64 = 1.0;

#[derive(Clone)]
struct ActiveRuntime {
    model_id: String,
    handle: Arc<dyn InferenceHandle>,
    started_at: DateTime<Utc>,
}

/// Install state plus a counter bumped on every transition
#[derive(Default)]
struct ModelEntry {
    state: ModelInstallState,
    generation: u64,
}

struct DownloadTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    config: RuntimeConfig,
    catalog: ModelCatalog,
    store: ModelStore,
    downloader: Downloader,
    backend: Arc<dyn InferenceBackend>,
    events: EventBus,
    models: RwLock<HashMap<String, ModelEntry>>,
    downloads: Mutex<HashMap<String, DownloadTask>>,
    op_locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    activation: tokio::sync::Mutex<()>,
    active: RwLock<Option<ActiveRuntime>>,
    shutdown: CancellationToken,
}

/// Builder for [`ModelRuntimeManager`]
pub struct ModelRuntimeManagerBuilder {
    config: RuntimeConfig,
    catalog: Option<ModelCatalog>,
    backend: Option<Arc<dyn InferenceBackend>>,
    events: Option<EventBus>,
}

impl ModelRuntimeManagerBuilder {
    /// Use a catalog other than the built-in one
    pub fn catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Use an inference backend other than llamafile
    pub fn backend(mut self, backend: Arc<dyn InferenceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Publish on an existing event bus
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<ModelRuntimeManager> {
        self.config.validate()?;

        let catalog = self.catalog.unwrap_or_default();
        let backend = match self.backend {
            Some(backend) => backend,
            None => Arc::new(LlamafileBackend::new(self.config.clone())?),
        };
        let downloader = Downloader::new(
            self.config.download_connect_timeout(),
            self.config.download_idle_timeout(),
        )?;

        let op_locks = catalog
            .iter()
            .map(|entry| (entry.id.clone(), Arc::new(tokio::sync::Mutex::new(()))))
            .collect();

        Ok(ModelRuntimeManager {
            inner: Arc::new(Inner {
                store: ModelStore::new(self.config.models_dir.clone()),
                config: self.config,
                catalog,
                downloader,
                backend,
                events: self.events.unwrap_or_default(),
                models: RwLock::new(HashMap::new()),
                downloads: Mutex::new(HashMap::new()),
                op_locks,
                activation: tokio::sync::Mutex::new(()),
                active: RwLock::new(None),
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

/// Lifecycle manager for local inference models
///
/// Cloning is cheap and every clone drives the same runtime.
#[derive(Clone)]
pub struct ModelRuntimeManager {
    inner: Arc<Inner>,
}

impl ModelRuntimeManager {
    /// Manager with the built-in catalog and the llamafile backend
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: RuntimeConfig) -> ModelRuntimeManagerBuilder {
        ModelRuntimeManagerBuilder {
            config,
            catalog: None,
            backend: None,
            events: None,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.inner.catalog
    }

    /// Receive runtime events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RuntimeEvent> {
        self.inner.events.subscribe()
    }

    /// Prepare the models directory, scan it and restore the last active model
    pub async fn initialize(&self) -> Result<()> {
        self.inner.store.ensure_dir().await?;
        self.inner.store.sweep_partials().await?;
        let models = self.list_models().await;
        info!(
            models_dir = %self.inner.store.models_dir().display(),
            downloaded = models.iter().filter(|m| m.downloaded).count(),
            "Model runtime initialized"
        );

        if self.inner.config.restore_active_model {
            self.restore().await;
        }
        Ok(())
    }

    /// Re-activate the model that was active when the app last exited
    ///
    /// Failures are logged and the persisted selection is cleared.
    pub async fn restore(&self) {
        let state_file = self.inner.config.state_file();
        let persisted = PersistedState::load(&state_file).await;
        let Some(model_id) = persisted.active_model else {
            return;
        };

        info!(model_id = %model_id, "Restoring active model");
        if let Err(e) = self.set_active_model(&model_id).await {
            warn!(model_id = %model_id, error = %e, "Could not restore active model");
            if let Err(e) = PersistedState::default().save(&state_file).await {
                warn!(error = %e, "Failed to clear persisted runtime state");
            }
        }
    }

    /// Whether the inference server is running and where
    ///
    /// Never fails: an unreachable server is reported as not running.
    pub async fn get_status(&self) -> RuntimeStatus {
        let Some(active) = self.active_snapshot() else {
            return RuntimeStatus::not_running();
        };

        let running = matches!(
            tokio::time::timeout(self.inner.config.health_timeout(), active.handle.health()).await,
            Ok(Health::Ready)
        );
        let port = active.handle.port();

        RuntimeStatus {
            running,
            port: Some(port),
            endpoint: Some(self.endpoint(port)),
            active_model: Some(active.model_id),
            pid: active.handle.pid(),
            started_at: Some(active.started_at),
        }
    }

    /// Port of the running inference server
    pub async fn get_port(&self) -> Option<u16> {
        self.active_snapshot().map(|active| active.handle.port())
    }

    /// Id of the active model
    pub async fn get_active_model(&self) -> Option<String> {
        self.active_snapshot().map(|active| active.model_id)
    }

    /// Every catalog entry with its current install state, in catalog order
    ///
    /// Entries that are not downloading are re-checked against the disk.
    pub async fn list_models(&self) -> Vec<ModelStatus> {
        let active_id = self.active_snapshot().map(|active| active.model_id);
        let mut statuses = Vec::with_capacity(self.inner.catalog.len());

        for descriptor in self.inner.catalog.iter() {
            if !self.is_downloading(&descriptor.id) {
                let generation = self.generation(&descriptor.id);
                let on_disk = self.inner.store.is_downloaded(descriptor).await;
                self.refresh_from_disk(&descriptor.id, on_disk, generation);
            }

            let state = self.install_state(&descriptor.id);
            let active = active_id.as_deref() == Some(descriptor.id.as_str());
            statuses.push(ModelStatus::new(descriptor, &state, active));
        }

        statuses
    }

    /// Start downloading a model
    ///
    /// Returns once the download is accepted. Already downloading or already
    /// downloaded models are a successful no-op. Transfer failures are
    /// reported through the model's `Error` state, not as an `Err`.
    pub async fn download_model(&self, model_id: &str) -> Result<()> {
        let descriptor = self.inner.catalog.require(model_id)?.clone();
        let _op = self.op_lock(model_id)?.lock_owned().await;

        if self.inner.shutdown.is_cancelled() {
            return Err(RuntimeError::DownloadFailed {
                model_id: model_id.to_string(),
                reason: "runtime is shutting down".to_string(),
            });
        }

        if self.is_downloading(model_id) {
            debug!(model_id = %model_id, "Download already in progress");
            return Ok(());
        }

        if self.inner.store.is_downloaded(&descriptor).await {
            debug!(model_id = %model_id, "Model already downloaded");
            let generation = self.generation(model_id);
            self.refresh_from_disk(model_id, true, generation);
            return Ok(());
        }

        self.inner.store.ensure_dir().await?;

        self.set_state(
            model_id,
            ModelInstallState {
                downloaded: false,
                download_state: DownloadState::Downloading,
                download_progress: Some(DownloadProgress::new(descriptor.size_bytes)),
                error: None,
            },
        );

        let cancel = self.inner.shutdown.child_token();
        let manager = self.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            manager.run_download(descriptor, task_cancel).await;
        });

        self.inner
            .downloads
            .lock()
            .insert(model_id.to_string(), DownloadTask { cancel, handle });

        info!(model_id = %model_id, "Download started");
        Ok(())
    }

    /// Remove a downloaded model
    ///
    /// The active model cannot be deleted. An in-flight download for the
    /// model is cancelled and awaited before the files are removed.
    pub async fn delete_model(&self, model_id: &str) -> Result<()> {
        let descriptor = self.inner.catalog.require(model_id)?.clone();
        let _activation = self.inner.activation.lock().await;

        if self.active_snapshot().map(|a| a.model_id).as_deref() == Some(model_id) {
            return Err(RuntimeError::ModelInUse(model_id.to_string()));
        }

        let _op = self.op_lock(model_id)?.lock_owned().await;

        let task = self.inner.downloads.lock().remove(model_id);
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                error!(model_id = %model_id, error = %e, "Download task panicked");
            }
        }

        let removed = self.inner.store.remove(&descriptor).await?;
        self.set_state(model_id, ModelInstallState::default());

        if removed {
            info!(model_id = %model_id, "Model deleted");
        } else {
            debug!(model_id = %model_id, "Model was not on disk");
        }
        Ok(())
    }

    /// Make `model_id` the model served by the inference server
    ///
    /// The new server must report healthy before the register is switched.
    /// On failure the previously active model stays active.
    pub async fn set_active_model(&self, model_id: &str) -> Result<()> {
        let descriptor = self.inner.catalog.require(model_id)?.clone();
        let _activation = self.inner.activation.lock().await;

        if self.inner.shutdown.is_cancelled() {
            return Err(RuntimeError::ActivationFailed {
                model_id: model_id.to_string(),
                reason: "runtime is shutting down".to_string(),
            });
        }

        let previous = self.active_snapshot();
        if previous.as_ref().map(|a| a.model_id.as_str()) == Some(model_id) {
            debug!(model_id = %model_id, "Model already active");
            return Ok(());
        }

        if self.is_downloading(model_id) || !self.inner.store.is_downloaded(&descriptor).await {
            return Err(RuntimeError::ModelNotDownloaded(model_id.to_string()));
        }

        match (self.inner.config.port, previous) {
            (Some(port), Some(previous)) => {
                self.replace_on_fixed_port(&descriptor, port, previous).await?
            }
            (port, previous) => {
                let port = match port {
                    Some(port) => port,
                    None => pick_free_port(&self.inner.config.host)?,
                };
                let runtime = self.launch(&descriptor, port).await?;
                self.install_active(runtime);
                if let Some(previous) = previous {
                    self.stop_runtime(previous).await;
                }
            }
        }

        self.persist_active(Some(model_id.to_string())).await;
        Ok(())
    }

    /// Stop the inference server and clear the active model
    pub async fn deactivate(&self) -> Result<()> {
        let _activation = self.inner.activation.lock().await;
        let previous = self.inner.active.write().take();

        if let Some(previous) = previous {
            self.inner.events.publish(RuntimeEvent::ActiveModelChanged {
                model_id: None,
                port: None,
            });
            self.stop_runtime(previous).await;
            self.persist_active(None).await;
        }
        Ok(())
    }

    /// Cancel every download and stop the inference server
    ///
    /// Partial files are removed before this returns. The persisted active
    /// model is kept so the next start can restore it.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let tasks: Vec<(String, DownloadTask)> = self.inner.downloads.lock().drain().collect();
        for (model_id, task) in tasks {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                error!(model_id = %model_id, error = %e, "Download task panicked");
            }
        }

        let _activation = self.inner.activation.lock().await;
        let previous = self.inner.active.write().take();
        if let Some(previous) = previous {
            self.stop_runtime(previous).await;
        }

        info!("Model runtime shut down");
    }

    async fn run_download(&self, descriptor: ModelDescriptor, cancel: CancellationToken) {
        let model_id = descriptor.id.clone();
        let partial = self.inner.store.partial_path(&descriptor);
        let target = self.inner.store.model_path(&descriptor);

        let mut last_published = -PROGRESS_EVENT_STEP_PERCENT;
        let result = self
            .inner
            .downloader
            .fetch(&descriptor, &partial, &target, &cancel, |progress| {
                self.update_progress(&model_id, progress);

                let percent = progress.percentage();
                if percent - last_published >= PROGRESS_EVENT_STEP_PERCENT
                    || progress.is_complete()
                {
                    last_published = percent;
                    self.inner.events.publish(RuntimeEvent::DownloadProgress {
                        model_id: model_id.clone(),
                        progress,
                    });
                }
            })
            .await;

        match result {
            Ok(done) => {
                let recorded = self
                    .inner
                    .store
                    .record_download(&descriptor, done.size_bytes, done.sha256)
                    .await;
                match recorded {
                    Ok(()) => self.set_state(&model_id, ModelInstallState::from_disk(true)),
                    Err(e) => {
                        // Without a record a file whose size differs from the
                        // catalog would not be recognized later
                        if let Err(remove_err) = self.inner.store.remove(&descriptor).await {
                            warn!(model_id = %model_id, error = %remove_err, "Failed to remove unrecorded download");
                        }
                        self.fail_download(&model_id, format!("failed to record download: {}", e));
                    }
                }
            }
            Err(TransferError::Cancelled) => {
                info!(model_id = %model_id, "Download cancelled");
                self.set_state(&model_id, ModelInstallState::default());
            }
            Err(TransferError::Failed(reason)) => self.fail_download(&model_id, reason),
        }
    }

    fn fail_download(&self, model_id: &str, reason: String) {
        warn!(model_id = %model_id, reason = %reason, "Download failed");
        self.set_state(
            model_id,
            ModelInstallState {
                downloaded: false,
                download_state: DownloadState::Error,
                download_progress: None,
                error: Some(reason),
            },
        );
    }

    /// Start a server and wait for it to become healthy
    async fn launch(&self, descriptor: &ModelDescriptor, port: u16) -> Result<ActiveRuntime> {
        let model_path = self.inner.store.model_path(descriptor);
        let activation_failed = |reason: String| RuntimeError::ActivationFailed {
            model_id: descriptor.id.clone(),
            reason,
        };

        let handle = self
            .inner
            .backend
            .start(&model_path, port)
            .await
            .map_err(|e| activation_failed(e.to_string()))?;

        if let Err(reason) = self.wait_healthy(handle.as_ref()).await {
            warn!(model_id = %descriptor.id, reason = %reason, "Inference server did not become healthy");
            if let Err(e) = handle.stop().await {
                warn!(model_id = %descriptor.id, error = %e, "Failed to stop unhealthy server");
            }
            return Err(activation_failed(reason));
        }

        info!(model_id = %descriptor.id, port, "Inference server ready");
        Ok(ActiveRuntime {
            model_id: descriptor.id.clone(),
            handle,
            started_at: Utc::now(),
        })
    }

    /// Poll health with exponential backoff until ready or the startup timeout
    async fn wait_healthy(&self, handle: &dyn InferenceHandle) -> std::result::Result<(), String> {
        let timeout = self.inner.config.startup_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff = Duration::from_millis(INITIAL_HEALTH_BACKOFF_MS);

        loop {
            let probe = tokio::time::timeout(self.inner.config.health_timeout(), handle.health());
            match probe.await {
                Ok(Health::Ready) => return Ok(()),
                Ok(Health::Exited(reason)) => return Err(reason),
                Ok(Health::Starting) | Err(_) => {}
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(format!("not healthy after {}s", timeout.as_secs()));
            }

            tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    return Err("runtime is shutting down".to_string());
                }
                _ = tokio::time::sleep(backoff.min(deadline - now)) => {}
            }
            backoff = (backoff * 2).min(Duration::from_millis(MAX_HEALTH_BACKOFF_MS));
        }
    }

    /// Swap servers when both must use the same configured port
    ///
    /// The old server is stopped first. If the new one fails, the old model is
    /// started again so it stays active.
    async fn replace_on_fixed_port(
        &self,
        descriptor: &ModelDescriptor,
        port: u16,
        previous: ActiveRuntime,
    ) -> Result<()> {
        *self.inner.active.write() = None;
        self.stop_runtime(previous.clone()).await;

        match self.launch(descriptor, port).await {
            Ok(runtime) => {
                self.install_active(runtime);
                Ok(())
            }
            Err(err) => {
                let restored = match self.inner.catalog.get(&previous.model_id) {
                    Some(prev_descriptor) => self.launch(prev_descriptor, port).await,
                    None => Err(RuntimeError::UnknownModel(previous.model_id.clone())),
                };
                match restored {
                    Ok(runtime) => self.install_active(runtime),
                    Err(e) => {
                        error!(
                            model_id = %previous.model_id,
                            error = %e,
                            "Could not restart previous model"
                        );
                        self.inner.events.publish(RuntimeEvent::ActiveModelChanged {
                            model_id: None,
                            port: None,
                        });
                        self.persist_active(None).await;
                    }
                }
                Err(err)
            }
        }
    }

    fn install_active(&self, runtime: ActiveRuntime) {
        let event = RuntimeEvent::ActiveModelChanged {
            model_id: Some(runtime.model_id.clone()),
            port: Some(runtime.handle.port()),
        };
        *self.inner.active.write() = Some(runtime);
        self.inner.events.publish(event);
    }

    async fn stop_runtime(&self, runtime: ActiveRuntime) {
        if let Err(e) = runtime.handle.stop().await {
            warn!(model_id = %runtime.model_id, error = %e, "Failed to stop inference server");
        }
        self.inner.events.publish(RuntimeEvent::RuntimeStopped {
            model_id: runtime.model_id,
        });
    }

    async fn persist_active(&self, model_id: Option<String>) {
        let state = PersistedState {
            active_model: model_id,
        };
        if let Err(e) = state.save(&self.inner.config.state_file()).await {
            warn!(error = %e, "Failed to persist runtime state");
        }
    }

    fn endpoint(&self, port: u16) -> String {
        format!("http://{}:{}", self.inner.config.host, port)
    }

    fn active_snapshot(&self) -> Option<ActiveRuntime> {
        self.inner.active.read().clone()
    }

    fn op_lock(&self, model_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        self.inner
            .op_locks
            .get(model_id)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownModel(model_id.to_string()))
    }

    fn install_state(&self, model_id: &str) -> ModelInstallState {
        self.inner
            .models
            .write()
            .entry(model_id.to_string())
            .or_default()
            .state
            .clone()
    }

    fn generation(&self, model_id: &str) -> u64 {
        self.inner
            .models
            .read()
            .get(model_id)
            .map(|entry| entry.generation)
            .unwrap_or(0)
    }

    fn is_downloading(&self, model_id: &str) -> bool {
        self.inner
            .models
            .read()
            .get(model_id)
            .map(|entry| entry.state.is_downloading())
            .unwrap_or(false)
    }

    /// Replace the state of a model and announce the transition
    fn set_state(&self, model_id: &str, state: ModelInstallState) {
        let event = RuntimeEvent::DownloadStateChanged {
            model_id: model_id.to_string(),
            state: state.download_state,
            downloaded: state.downloaded,
            error: state.error.clone(),
        };
        {
            let mut models = self.inner.models.write();
            let entry = models.entry(model_id.to_string()).or_default();
            entry.state = state;
            entry.generation += 1;
        }
        self.inner.events.publish(event);
    }

    /// Align `downloaded` with the disk unless a download owns the entry
    ///
    /// `generation` is the value read before the disk was checked. If any
    /// transition happened since, the disk reading is stale and is dropped.
    fn refresh_from_disk(&self, model_id: &str, on_disk: bool, generation: u64) {
        let mut models = self.inner.models.write();
        let entry = models.entry(model_id.to_string()).or_default();
        if entry.generation != generation {
            return;
        }

        let state = &mut entry.state;
        if state.is_downloading() || state.downloaded == on_disk {
            return;
        }

        if on_disk {
            *state = ModelInstallState::from_disk(true);
        } else {
            state.downloaded = false;
            if state.download_state == DownloadState::Complete {
                state.download_state = DownloadState::Idle;
            }
        }
    }

    fn update_progress(&self, model_id: &str, progress: DownloadProgress) {
        let mut models = self.inner.models.write();
        if let Some(entry) = models.get_mut(model_id) {
            if entry.state.is_downloading() {
                entry.state.download_progress = Some(progress);
            }
        }
    }

    /// Path a model is (or would be) stored at
    pub fn model_path(&self, model_id: &str) -> Result<PathBuf> {
        let descriptor = self.inner.catalog.require(model_id)?;
        Ok(self.inner.store.model_path(descriptor))
    }
}
