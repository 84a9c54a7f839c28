//! Local model runtime for FOLIO Mapper
//!
//! This crate manages the local language model used for semantic
//! pre-scanning: the catalog of downloadable models, downloads with progress,
//! on-disk storage, selection of the single active model and the llamafile
//! inference server that serves it.
//!
//! ```rust,no_run
//! use folio_runtime::{ModelRuntimeManager, RuntimeConfig};
//!
//! # async fn run() -> folio_runtime::Result<()> {
//! let manager = ModelRuntimeManager::new(RuntimeConfig::load()?)?;
//! manager.initialize().await?;
//!
//! manager.download_model("qwen2.5-1.5b-instruct").await?;
//! for model in manager.list_models().await {
//!     println!("{} downloaded={}", model.id(), model.downloaded);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod catalog;
pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod manager;
pub mod models;
pub mod store;

pub use backend::{Health, InferenceBackend, InferenceHandle, LlamafileBackend};
pub use catalog::{ModelCatalog, ModelDescriptor};
pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use events::{EventBus, RuntimeEvent};
pub use manager::{ModelRuntimeManager, ModelRuntimeManagerBuilder};
pub use models::{DownloadProgress, DownloadState, ModelInstallState, ModelStatus, RuntimeStatus};

/// Result type for model runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;
