//! Push notifications from the runtime manager to the UI
//!
//! Every state change the UI would otherwise poll for is published on a
//! tokio broadcast channel. Slow subscribers lose the oldest events and can
//! recover with a `list_models` / `get_status` call.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{DownloadProgress, DownloadState};

/// Channel capacity for broadcast events
const CHANNEL_CAPACITY: usize = 256;

/// Runtime state change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuntimeEvent {
    /// Bytes arrived for an in-flight download
    #[serde(rename_all = "camelCase")]
    DownloadProgress {
        model_id: String,
        progress: DownloadProgress,
    },

    /// A model moved to a new download state
    #[serde(rename_all = "camelCase")]
    DownloadStateChanged {
        model_id: String,
        state: DownloadState,
        downloaded: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The active model changed (None = nothing active)
    #[serde(rename_all = "camelCase")]
    ActiveModelChanged {
        model_id: Option<String>,
        port: Option<u16>,
    },

    /// The inference process stopped
    #[serde(rename_all = "camelCase")]
    RuntimeStopped { model_id: String },
}

impl RuntimeEvent {
    /// Notification channel name used by the desktop shell
    pub fn channel(&self) -> &'static str {
        match self {
            RuntimeEvent::DownloadProgress { .. } => "llamafile:download-progress",
            RuntimeEvent::DownloadStateChanged { .. } => "llamafile:download-state",
            RuntimeEvent::ActiveModelChanged { .. } => "llamafile:active-model-changed",
            RuntimeEvent::RuntimeStopped { .. } => "llamafile:runtime-stopped",
        }
    }
}

/// Broadcast bus for runtime events
///
/// Cloning shares the underlying channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: RuntimeEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
