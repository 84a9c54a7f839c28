//! Data models shared with the UI process

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::ModelDescriptor;

/// Per-model download lifecycle
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    #[default]
    Idle,
    Downloading,
    Complete,
    Error,
}

/// Progress of an in-flight download
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    /// Bytes written to the partial file so far
    pub bytes_downloaded: u64,

    /// Expected total, server-reported when known
    pub bytes_total: u64,
}

impl DownloadProgress {
    pub fn new(bytes_total: u64) -> Self {
        Self {
            bytes_downloaded: 0,
            bytes_total,
        }
    }

    /// Record a received chunk. `bytes_downloaded` never exceeds `bytes_total`;
    /// returns false if the chunk overflows the expected total.
    pub fn advance(&mut self, chunk_len: u64) -> bool {
        let next = self.bytes_downloaded.saturating_add(chunk_len);
        if next > self.bytes_total {
            return false;
        }
        self.bytes_downloaded = next;
        true
    }

    /// Get the progress percentage (0-100)
    pub fn percentage(&self) -> f64 {
        if self.bytes_total == 0 {
            0.0
        } else {
            (self.bytes_downloaded as f64 / self.bytes_total as f64) * 100.0
        }
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_total > 0 && self.bytes_downloaded == self.bytes_total
    }
}

/// Runtime install state of one catalog entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelInstallState {
    pub downloaded: bool,
    pub download_state: DownloadState,
    pub download_progress: Option<DownloadProgress>,
    pub error: Option<String>,
}

impl ModelInstallState {
    /// Fresh state for a model whose file is or is not on disk
    pub fn from_disk(downloaded: bool) -> Self {
        Self {
            downloaded,
            download_state: if downloaded {
                DownloadState::Complete
            } else {
                DownloadState::Idle
            },
            download_progress: None,
            error: None,
        }
    }

    pub fn is_downloading(&self) -> bool {
        self.download_state == DownloadState::Downloading
    }
}

/// Catalog entry merged with its install state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatus {
    #[serde(flatten)]
    pub descriptor: ModelDescriptor,
    pub downloaded: bool,
    pub active: bool,
    pub download_state: DownloadState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_progress: Option<DownloadProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModelStatus {
    pub fn new(descriptor: &ModelDescriptor, state: &ModelInstallState, active: bool) -> Self {
        Self {
            descriptor: descriptor.clone(),
            downloaded: state.downloaded,
            active,
            download_state: state.download_state,
            download_progress: state.download_progress,
            error: state.error.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

/// Inference runtime status reported to the UI
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
    pub running: bool,
    pub port: Option<u16>,
    pub endpoint: Option<String>,
    pub active_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl RuntimeStatus {
    pub fn not_running() -> Self {
        Self::default()
    }
}
