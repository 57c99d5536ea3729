//! Chunked, parallel, resumable transfers
//!
//! This module provides:
//! - `UploadEngine`: multipart upload with per-part retry and remote abort
//! - `DownloadEngine`: parallel ranged download into a preallocated file
//! - `TransferStateStore`: persisted chunk maps for resume across restarts
//! - `RetryPolicy`: exponential backoff with classified retry
//! - `ProgressSink` / `EventQueue`: lifecycle events for the host

pub mod download;
pub mod progress;
pub mod remote;
pub mod retry;
pub mod state;
pub mod store;
pub mod upload;

use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::{Result, TransferError};

pub use download::{DownloadEngine, MAX_DOWNLOAD_CONCURRENCY};
pub use progress::{EventQueue, EventReceiver, NoopSink, ProgressEvent, ProgressSink, ProgressTracker};
pub use remote::{ObjectStore, UploadPartRequest};
pub use retry::{RetryMode, RetryPolicy};
pub use state::{ChunkRecord, SourceFingerprint, TransferIdentity, TransferState, TransferType};
pub use store::TransferStateStore;
pub use upload::{UploadEngine, MAX_UPLOAD_CONCURRENCY};

/// Default number of concurrent chunk workers
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Engine tuning shared by uploads and downloads
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Compare plain-MD5 part ETags against the local digest
    pub verify_part_etag: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            verify_part_etag: true,
        }
    }
}

impl TransferOptions {
    /// Concurrency clamped to `1..=max`
    pub(crate) fn worker_count(&self, max: usize) -> usize {
        let clamped = self.concurrency.clamp(1, max);
        if clamped != self.concurrency {
            warn!(
                requested = self.concurrency,
                using = clamped,
                "concurrency_clamped"
            );
        }
        clamped
    }
}

/// Outcome of one engine run
#[derive(Debug)]
pub struct TransferSummary {
    pub transfer_type: TransferType,
    pub bucket: String,
    pub key: String,
    pub local_path: PathBuf,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub duration: Duration,
    pub chunks_completed: usize,
    pub chunks_total: usize,
    /// Final object ETag (uploads)
    pub etag: Option<String>,
    pub location: Option<String>,
    pub version_id: Option<String>,
    /// Terminal error, `None` on success
    pub error: Option<TransferError>,
    /// Chunk whose failure ended the transfer
    pub failed_chunk: Option<usize>,
}

impl TransferSummary {
    pub(crate) fn from_state(state: &TransferState, duration: Duration) -> Self {
        Self {
            transfer_type: state.identity.transfer_type,
            bucket: state.identity.bucket.clone(),
            key: state.identity.key.clone(),
            local_path: state.identity.local_path.clone(),
            bytes_transferred: state.bytes_transferred(),
            total_bytes: state.total_size,
            duration,
            chunks_completed: state.completed_count(),
            chunks_total: state.chunk_count(),
            etag: None,
            location: None,
            version_id: None,
            error: None,
            failed_chunk: None,
        }
    }

    /// Summary for a transfer that failed before any state existed
    pub(crate) fn failed(identity: &TransferIdentity, error: TransferError, duration: Duration) -> Self {
        Self {
            transfer_type: identity.transfer_type,
            bucket: identity.bucket.clone(),
            key: identity.key.clone(),
            local_path: identity.local_path.clone(),
            bytes_transferred: 0,
            total_bytes: 0,
            duration,
            chunks_completed: 0,
            chunks_total: 0,
            etag: None,
            location: None,
            version_id: None,
            error: Some(error),
            failed_chunk: None,
        }
    }

    pub(crate) fn with_error(mut self, error: TransferError, failed_chunk: Option<usize>) -> Self {
        self.error = Some(error);
        self.failed_chunk = failed_chunk;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.as_ref().is_some_and(TransferError::is_cancelled)
    }

    /// Average throughput in bytes per second
    pub fn throughput(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.bytes_transferred as f64 / secs
        } else {
            0.0
        }
    }

    /// `Ok(self)` on success, the terminal error otherwise
    pub fn into_result(mut self) -> Result<Self> {
        match self.error.take() {
            None => Ok(self),
            Some(e) => Err(e),
        }
    }
}

pub(crate) fn check_identifiers(bucket: &str, key: &str) -> Result<()> {
    if bucket.is_empty() {
        return Err(TransferError::validation("bucket name cannot be empty"));
    }
    if key.is_empty() {
        return Err(TransferError::validation("object key cannot be empty"));
    }
    Ok(())
}

/// Absolute, lexically normalized form of `path` so `./a`, `a` and `b/../a`
/// name the same transfer. Symlinks are not resolved.
pub(crate) fn absolute_path(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(normalize_path(&joined))
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` above the root stays at the root
                if !matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    continue;
                }
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
