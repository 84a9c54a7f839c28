//! On-disk model storage
//!
//! Layout of the models directory:
//!
//! ```text
//! models/
//!   manifest.json           completed downloads: file name -> size, digest
//!   <filename>              finished model files
//!   <filename>.part         in-flight downloads, never loaded
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{catalog::ModelDescriptor, Result};

/// Suffix of in-flight download files
pub const PARTIAL_SUFFIX: &str = ".part";

/// Download records, kept next to the model files
pub const MANIFEST_FILE: &str = "manifest.json";

/// Record of a completed download
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub size_bytes: u64,
    pub sha256: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    files: BTreeMap<String, DownloadRecord>,
}

/// State persisted across restarts
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub active_model: Option<String>,
}

impl PersistedState {
    /// Load from disk, falling back to the default on a missing or unreadable file
    pub async fn load(path: &Path) -> Self {
        match read_json::<Self>(path).await {
            Ok(Some(state)) => state,
            Ok(None) => Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable runtime state");
                Self::default()
            }
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self).await
    }
}

/// Model files and their download records
#[derive(Debug)]
pub struct ModelStore {
    models_dir: PathBuf,
    manifest_lock: Mutex<()>,
}

impl ModelStore {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            manifest_lock: Mutex::new(()),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Create the models directory if needed
    pub async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.models_dir).await?;
        Ok(())
    }

    /// Final location of a model file
    pub fn model_path(&self, descriptor: &ModelDescriptor) -> PathBuf {
        self.models_dir.join(&descriptor.filename)
    }

    /// Location of the in-flight download for a model
    pub fn partial_path(&self, descriptor: &ModelDescriptor) -> PathBuf {
        self.models_dir
            .join(format!("{}{}", descriptor.filename, PARTIAL_SUFFIX))
    }

    /// True iff the model file exists and has the expected size
    ///
    /// The expected size is the recorded size of a completed download, or the
    /// declared catalog size for files that were placed by hand.
    pub async fn is_downloaded(&self, descriptor: &ModelDescriptor) -> bool {
        let path = self.model_path(descriptor);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => return false,
        };

        let expected = match self.record(descriptor).await {
            Some(record) => record.size_bytes,
            None => descriptor.size_bytes,
        };

        if metadata.len() != expected {
            debug!(
                model_id = %descriptor.id,
                actual = metadata.len(),
                expected,
                "Model file size mismatch"
            );
            return false;
        }
        true
    }

    /// Download record for a model, if any
    pub async fn record(&self, descriptor: &ModelDescriptor) -> Option<DownloadRecord> {
        let _guard = self.manifest_lock.lock().await;
        match self.load_manifest().await {
            Ok(manifest) => manifest.files.get(&descriptor.filename).cloned(),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable model manifest");
                None
            }
        }
    }

    /// Remember a completed download
    pub async fn record_download(
        &self,
        descriptor: &ModelDescriptor,
        size_bytes: u64,
        sha256: String,
    ) -> Result<()> {
        let _guard = self.manifest_lock.lock().await;
        let mut manifest = self.load_manifest().await.unwrap_or_default();
        manifest.files.insert(
            descriptor.filename.clone(),
            DownloadRecord {
                size_bytes,
                sha256,
                completed_at: Utc::now(),
            },
        );
        write_json_atomic(&self.manifest_path(), &manifest).await
    }

    /// Remove a model file, its partial file and its record
    ///
    /// Returns true if a finished model file was removed.
    pub async fn remove(&self, descriptor: &ModelDescriptor) -> Result<bool> {
        self.remove_partial(descriptor).await;

        let removed = match tokio::fs::remove_file(self.model_path(descriptor)).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        let _guard = self.manifest_lock.lock().await;
        let mut manifest = self.load_manifest().await.unwrap_or_default();
        if manifest.files.remove(&descriptor.filename).is_some() {
            write_json_atomic(&self.manifest_path(), &manifest).await?;
        }

        Ok(removed)
    }

    /// Best-effort removal of a partial download
    pub async fn remove_partial(&self, descriptor: &ModelDescriptor) {
        let path = self.partial_path(descriptor);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "Removed partial download"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial download"),
        }
    }

    /// Delete partial files left behind by a previous run
    pub async fn sweep_partials(&self) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.models_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(PARTIAL_SUFFIX) {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to remove stale partial"),
                }
            }
        }

        if removed > 0 {
            debug!(removed, "Swept stale partial downloads");
        }
        Ok(removed)
    }

    fn manifest_path(&self) -> PathBuf {
        self.models_dir.join(MANIFEST_FILE)
    }

    async fn load_manifest(&self) -> Result<Manifest> {
        Ok(read_json(&self.manifest_path()).await?.unwrap_or_default())
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write JSON to a temp file, then rename over the target
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
