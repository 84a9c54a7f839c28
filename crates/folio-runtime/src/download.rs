//! Streaming model downloads
//!
//! Bytes are written to `<filename>.part` and only renamed into place after
//! the size (and digest, when the catalog declares one) has been verified.
//! Any failure or cancellation removes the partial file.

use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{catalog::ModelDescriptor, error::RuntimeError, models::DownloadProgress, Result};

/// Pool idle timeout for the download client
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

/// Why a transfer did not complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Shutdown or delete asked the transfer to stop
    Cancelled,
    /// Network, disk or integrity failure
    Failed(String),
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::Cancelled => write!(f, "download cancelled"),
            TransferError::Failed(reason) => write!(f, "{}", reason),
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Failed(format!("disk error: {}", err))
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        TransferError::Failed(format!("network error: {}", err))
    }
}

/// A verified, renamed model file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedDownload {
    pub size_bytes: u64,
    pub sha256: String,
}

/// HTTP downloader for model files
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    idle_timeout: Duration,
}

impl Downloader {
    /// Create a downloader
    ///
    /// There is no overall request timeout since model files are gigabytes;
    /// a stalled body is caught by `idle_timeout` instead.
    pub fn new(connect_timeout: Duration, idle_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS))
            .user_agent(concat!("folio-runtime/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RuntimeError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            idle_timeout,
        })
    }

    /// Download `descriptor` to `final_path`, staging through `partial_path`
    ///
    /// `on_progress` is called after every chunk with the running totals.
    pub async fn fetch<F>(
        &self,
        descriptor: &ModelDescriptor,
        partial_path: &Path,
        final_path: &Path,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> std::result::Result<CompletedDownload, TransferError>
    where
        F: FnMut(DownloadProgress),
    {
        let result = self
            .transfer(descriptor, partial_path, final_path, cancel, on_progress)
            .await;

        if result.is_err() {
            match tokio::fs::remove_file(partial_path).await {
                Ok(()) => debug!(model_id = %descriptor.id, "Removed partial download"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(model_id = %descriptor.id, error = %e, "Failed to remove partial download"),
            }
        }

        result
    }

    async fn transfer<F>(
        &self,
        descriptor: &ModelDescriptor,
        partial_path: &Path,
        final_path: &Path,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> std::result::Result<CompletedDownload, TransferError>
    where
        F: FnMut(DownloadProgress),
    {
        debug!(model_id = %descriptor.id, url = %descriptor.url, "Starting download");

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            response = self.client.get(&descriptor.url).send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Failed(format!(
                "HTTP {} from {}",
                status, descriptor.url
            )));
        }

        let bytes_total = match response.content_length() {
            Some(len) => {
                if len != descriptor.size_bytes {
                    warn!(
                        model_id = %descriptor.id,
                        declared = descriptor.size_bytes,
                        reported = len,
                        "Server size differs from catalog, using server size"
                    );
                }
                len
            }
            None => descriptor.size_bytes,
        };

        let mut progress = DownloadProgress::new(bytes_total);
        on_progress(progress);

        let mut file = File::create(partial_path).await?;
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(model_id = %descriptor.id, "Download cancelled");
                    return Err(TransferError::Cancelled);
                }
                next = tokio::time::timeout(self.idle_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    return Err(TransferError::Failed(format!(
                        "no data received for {}s",
                        self.idle_timeout.as_secs()
                    )))
                }
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };

            if !progress.advance(chunk.len() as u64) {
                return Err(TransferError::Failed(format!(
                    "download exceeded expected size of {} bytes",
                    bytes_total
                )));
            }

            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            on_progress(progress);
        }

        if progress.bytes_downloaded != bytes_total {
            return Err(TransferError::Failed(format!(
                "size mismatch: received {} of {} bytes",
                progress.bytes_downloaded, bytes_total
            )));
        }

        let digest = hex::encode(hasher.finalize());
        if let Some(expected) = &descriptor.sha256 {
            if !expected.eq_ignore_ascii_case(&digest) {
                return Err(TransferError::Failed(format!(
                    "checksum mismatch: expected {}, got {}",
                    expected, digest
                )));
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        tokio::fs::rename(partial_path, final_path).await?;

        info!(
            model_id = %descriptor.id,
            bytes = progress.bytes_downloaded,
            "Download complete"
        );

        Ok(CompletedDownload {
            size_bytes: progress.bytes_downloaded,
            sha256: digest,
        })
    }
}
