//! On-disk store for resumable transfer state
//!
//! One JSON file per transfer, named by [`TransferIdentity::state_key`], in a
//! directory chosen by the caller. Writes go to a temp file that is renamed
//! into place, and all writes are serialized through one lock.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, TransferError};
use crate::transfer::state::{plan_chunks, SourceFingerprint, TransferIdentity, TransferState};

/// Default maximum age of a resumable state record
pub const DEFAULT_MAX_STATE_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const STATE_EXTENSION: &str = "json";

/// Persists and validates [`TransferState`] records
pub struct TransferStateStore {
    dir: PathBuf,
    max_age: Duration,
    write_lock: Mutex<()>,
}

impl TransferStateStore {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn path_for(&self, identity: &TransferIdentity) -> PathBuf {
        self.dir
            .join(format!("{}.{}", identity.state_key(), STATE_EXTENSION))
    }

    /// Atomically write `state`, replacing any previous record
    pub async fn save(&self, state: &TransferState) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(state)?;
        let path = self.path_for(&state.identity);
        let tmp = path.with_extension("json.tmp");

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&tmp, &encoded).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(
            path = %path.display(),
            completed = state.completed_count(),
            chunks = state.chunk_count(),
            "state_saved"
        );
        Ok(())
    }

    /// Load the record for `identity`, if any.
    ///
    /// A record that cannot be decoded, or that belongs to a different
    /// identity, is treated as absent.
    pub async fn load(&self, identity: &TransferIdentity) -> Result<Option<TransferState>> {
        let path = self.path_for(identity);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let state: TransferState = match serde_json::from_slice(&data) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "state_unreadable");
                return Ok(None);
            }
        };

        if state.identity != *identity {
            warn!(path = %path.display(), "state_identity_mismatch");
            return Ok(None);
        }
        Ok(Some(state))
    }

    /// Remove the record for `identity`. Missing records are not an error.
    pub async fn delete(&self, identity: &TransferIdentity) -> Result<()> {
        let path = self.path_for(identity);
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "state_deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether `state` may be resumed against the current source
    pub fn is_valid(&self, state: &TransferState, current: &SourceFingerprint) -> bool {
        self.validate(state, current).is_ok()
    }

    /// Check fingerprint, age and chunk-map consistency of `state`
    pub fn validate(&self, state: &TransferState, current: &SourceFingerprint) -> Result<()> {
        if state.fingerprint != *current {
            return Err(TransferError::ResumeInvalid(format!(
                "source changed since the transfer started ({:?} -> {:?})",
                state.fingerprint, current
            )));
        }

        let age = state.age(Utc::now());
        let max_age = chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::MAX);
        if age > max_age {
            return Err(TransferError::ResumeInvalid(format!(
                "state is {}s old, limit is {}s",
                age.num_seconds(),
                self.max_age.as_secs()
            )));
        }

        if state.total_size != current.size() {
            return Err(TransferError::ResumeInvalid(
                "chunk map does not match the object size".to_string(),
            ));
        }
        check_partition(state)
    }

    /// All readable records in the store, oldest update first
    pub async fn list(&self) -> Result<Vec<TransferState>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut states = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STATE_EXTENSION) {
                continue;
            }
            let data = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<TransferState>(&data) {
                Ok(state) => states.push(state),
                Err(e) => warn!(path = %path.display(), error = %e, "state_unreadable"),
            }
        }
        states.sort_by_key(|s| s.updated_at);
        Ok(states)
    }
}

/// The chunk map must be exactly the partition `plan_chunks` would produce
fn check_partition(state: &TransferState) -> Result<()> {
    let planned = plan_chunks(state.total_size, state.chunk_size)
        .map_err(|e| TransferError::ResumeInvalid(e.to_string()))?;
    if planned.len() != state.chunks.len() {
        return Err(TransferError::ResumeInvalid(format!(
            "chunk map has {} chunks, expected {}",
            state.chunks.len(),
            planned.len()
        )));
    }
    for (expected, actual) in planned.iter().zip(&state.chunks) {
        if (actual.index, actual.start, actual.end, actual.size)
            != (expected.index, expected.start, expected.end, expected.size)
        {
            return Err(TransferError::ResumeInvalid(format!(
                "chunk {} covers {}-{}, expected {}-{}",
                expected.index, actual.start, actual.end, expected.start, expected.end
            )));
        }
    }
    Ok(())
}
