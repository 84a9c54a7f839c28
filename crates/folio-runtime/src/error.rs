//! Error types for model runtime operations

use thiserror::Error;

/// Errors that can occur while managing the local model runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Model is not downloaded: {0}")]
    ModelNotDownloaded(String),

    #[error("Model activation failed for {model_id}: {reason}")]
    ActivationFailed { model_id: String, reason: String },

    #[error("Download failed for {model_id}: {reason}")]
    DownloadFailed { model_id: String, reason: String },

    #[error("Model is currently active: {0}")]
    ModelInUse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(#[from] folio_process::ProcessError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RuntimeError {
    /// Stable name of the error kind, used on the IPC wire
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::UnknownModel(_) => "UnknownModel",
            RuntimeError::ModelNotDownloaded(_) => "ModelNotDownloaded",
            RuntimeError::ActivationFailed { .. } => "ActivationFailed",
            RuntimeError::DownloadFailed { .. } => "DownloadFailed",
            RuntimeError::ModelInUse(_) => "ModelInUse",
            RuntimeError::Config(_) => "Config",
            RuntimeError::Process(_) => "Process",
            RuntimeError::Io(_) => "Io",
            RuntimeError::Serialization(_) => "Serialization",
        }
    }
}

impl From<config::ConfigError> for RuntimeError {
    fn from(err: config::ConfigError) -> Self {
        RuntimeError::Config(err.to_string())
    }
}
