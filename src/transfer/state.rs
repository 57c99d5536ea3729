//! Resumable transfer state and chunk planning
//!
//! A `TransferState` is the persisted record of one logical transfer: its
//! identity, the source fingerprint captured when it started, and the chunk
//! map. Chunk ranges always partition `[0, total_size)` without gaps or
//! overlaps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::{Result, TransferError};
use crate::s3::types::{CompletedPart, ObjectMetadata};

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    Upload,
    Download,
}

impl TransferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferType::Upload => "upload",
            TransferType::Download => "download",
        }
    }
}

impl std::fmt::Display for TransferType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of a logical transfer
///
/// Two transfers are the same transfer exactly when all four fields are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferIdentity {
    pub bucket: String,
    pub key: String,
    pub local_path: PathBuf,
    pub transfer_type: TransferType,
}

impl TransferIdentity {
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        local_path: impl Into<PathBuf>,
        transfer_type: TransferType,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            local_path: local_path.into(),
            transfer_type,
        }
    }

    /// Content-addressed name for the state record.
    ///
    /// SHA-256 over the length-prefixed fields, so no two distinct identities
    /// share an encoding. The store also compares the full identity on load.
    pub fn state_key(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [
            self.bucket.as_bytes(),
            self.key.as_bytes(),
            self.local_path.as_os_str().as_encoded_bytes(),
            self.transfer_type.as_str().as_bytes(),
        ] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field);
        }
        format!("{}-{}", self.transfer_type, hex::encode(hasher.finalize()))
    }
}

/// Snapshot of the source used to detect changes between runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceFingerprint {
    /// Local file being uploaded: size and modification time
    Local { size: u64, modified: DateTime<Utc> },
    /// Remote object being downloaded: size and ETag (or Last-Modified)
    Remote { size: u64, tag: String },
}

impl SourceFingerprint {
    pub async fn of_local_file(path: &Path) -> Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(TransferError::validation(format!(
                "not a regular file: {}",
                path.display()
            )));
        }
        Ok(SourceFingerprint::Local {
            size: metadata.len(),
            modified: DateTime::<Utc>::from(metadata.modified()?),
        })
    }

    pub fn of_object(metadata: &ObjectMetadata) -> Self {
        SourceFingerprint::Remote {
            size: metadata.content_length,
            tag: metadata.fingerprint_tag(),
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            SourceFingerprint::Local { size, .. } | SourceFingerprint::Remote { size, .. } => *size,
        }
    }
}

/// One chunk of a transfer. `end` is inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub size: u64,
    pub completed: bool,
    /// Part ETag (uploads only)
    pub etag: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl ChunkRecord {
    fn new(index: usize, start: u64, size: u64) -> Self {
        Self {
            index,
            start,
            end: start + size - 1,
            size,
            completed: false,
            etag: None,
            completed_at: None,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Multipart part number (1-based)
    pub fn part_number(&self) -> u32 {
        self.index as u32 + 1
    }

    pub fn mark_completed(&mut self, etag: Option<String>) {
        self.completed = true;
        self.etag = etag;
        self.completed_at = Some(Utc::now());
        self.last_error = None;
    }

    pub fn record_failure(&mut self, error: &TransferError) {
        self.retry_count += 1;
        self.last_error = Some(error.to_string());
    }

    fn reset(&mut self) {
        self.completed = false;
        self.etag = None;
        self.completed_at = None;
    }
}

/// Split `[0, total_size)` into `ceil(total_size / chunk_size)` contiguous chunks.
///
/// Every chunk but the last is exactly `chunk_size` bytes. An empty object has
/// no chunks.
pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Result<Vec<ChunkRecord>> {
    if chunk_size == 0 {
        return Err(TransferError::validation("chunk size must be greater than zero"));
    }

    let count = total_size.div_ceil(chunk_size);
    let mut chunks = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    for index in 0..count as usize {
        let size = chunk_size.min(total_size - start);
        chunks.push(ChunkRecord::new(index, start, size));
        start += size;
    }
    Ok(chunks)
}

/// Persisted record of one transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferState {
    pub identity: TransferIdentity,
    pub total_size: u64,
    pub chunk_size: u64,
    pub chunks: Vec<ChunkRecord>,
    /// Server-assigned multipart upload id (uploads only)
    pub upload_id: Option<String>,
    pub fingerprint: SourceFingerprint,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferState {
    /// Fresh state with every chunk pending
    pub fn new(
        identity: TransferIdentity,
        fingerprint: SourceFingerprint,
        chunk_size: u64,
    ) -> Result<Self> {
        let total_size = fingerprint.size();
        let chunks = plan_chunks(total_size, chunk_size)?;
        let now = Utc::now();
        Ok(Self {
            identity,
            total_size,
            chunk_size,
            chunks,
            upload_id: None,
            fingerprint,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn completed_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.completed).count()
    }

    /// Sum of completed chunk sizes
    pub fn bytes_transferred(&self) -> u64 {
        self.chunks.iter().filter(|c| c.completed).map(|c| c.size).sum()
    }

    /// Indices of chunks still to transfer, ascending
    pub fn pending_indices(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .filter(|c| !c.completed)
            .map(|c| c.index)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(|c| c.completed)
    }

    /// Completed parts sorted ascending by part number
    pub fn completed_parts(&self) -> Vec<CompletedPart> {
        let mut parts: Vec<CompletedPart> = self
            .chunks
            .iter()
            .filter(|c| c.completed)
            .map(|c| {
                CompletedPart::new(c.part_number(), c.etag.clone().unwrap_or_default(), c.size)
            })
            .collect();
        parts.sort_by_key(|p| p.part_number);
        parts
    }

    /// Forget the upload id and all chunk completions so the next run starts over.
    /// Retry counts and last errors stay for inspection.
    pub fn reset_progress(&mut self) {
        self.upload_id = None;
        for chunk in &mut self.chunks {
            chunk.reset();
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Time since the state was last written
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.updated_at)
    }
}
