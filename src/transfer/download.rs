//! Parallel ranged download engine
//!
//! Lifecycle: Initiated -> ChunksInFlight -> Completed | Aborted.
//!
//! The destination is preallocated to the object size and every worker writes
//! its chunk at the chunk's offset through one shared file handle. Each
//! seek+write pair runs under the handle's lock. Resume is driven solely by
//! the persisted chunk map, never by the destination's current length.

use bytes::Bytes;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TransferError};
use crate::s3::transport::ProgressFn;
use crate::transfer::progress::ProgressSink;
use crate::transfer::remote::ObjectStore;
use crate::transfer::retry::RetryPolicy;
use crate::transfer::state::{SourceFingerprint, TransferIdentity, TransferState, TransferType};
use crate::transfer::store::TransferStateStore;
use crate::transfer::{absolute_path, check_identifiers, TransferOptions, TransferSummary};

/// Upper bound on concurrent ranged GETs
pub const MAX_DOWNLOAD_CONCURRENCY: usize = 8;

/// Drives parallel ranged downloads from an [`ObjectStore`]
pub struct DownloadEngine {
    store: Arc<dyn ObjectStore>,
    states: Arc<TransferStateStore>,
    options: TransferOptions,
    sink: Arc<dyn ProgressSink>,
}

impl DownloadEngine {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        states: Arc<TransferStateStore>,
        options: TransferOptions,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            store,
            states,
            options,
            sink,
        }
    }

    /// Prepare and run a download of `bucket/key` into `destination`
    pub async fn download(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
        chunk_size: u64,
        resume: bool,
        cancel: CancellationToken,
    ) -> TransferSummary {
        let started = Instant::now();
        match self
            .prepare(bucket, key, destination, chunk_size, resume, &cancel)
            .await
        {
            Ok(state) => self.run(state, cancel).await,
            Err(e) => {
                if e.is_cancelled() {
                    info!(bucket, key, "download_cancelled");
                }
                let identity =
                    TransferIdentity::new(bucket, key, destination, TransferType::Download);
                self.finish(TransferSummary::failed(&identity, e, started.elapsed()))
            }
        }
    }

    /// Probe the object and build the state for a download.
    ///
    /// A persisted chunk map is reused only when `resume` is set, the remote
    /// fingerprint still matches, the record is young enough, and the
    /// destination still exists at full length. Otherwise it is discarded.
    pub async fn prepare(
        &self,
        bucket: &str,
        key: &str,
        destination: &Path,
        chunk_size: u64,
        resume: bool,
        cancel: &CancellationToken,
    ) -> Result<TransferState> {
        check_identifiers(bucket, key)?;
        if chunk_size == 0 {
            return Err(TransferError::validation("chunk size must be greater than zero"));
        }

        let destination = absolute_path(destination)?;
        let metadata = self
            .options
            .retry
            .retry("head_object", cancel, |_| self.store.head_object(bucket, key))
            .await?;
        let fingerprint = SourceFingerprint::of_object(&metadata);
        debug!(
            bucket,
            key,
            size = metadata.content_length,
            etag = ?metadata.etag,
            "object_probed"
        );

        let identity = TransferIdentity::new(bucket, key, destination, TransferType::Download);
        if let Some(existing) = self.states.load(&identity).await? {
            if resume {
                let valid = match self.states.validate(&existing, &fingerprint) {
                    Ok(()) => check_destination(&existing).await,
                    Err(e) => Err(e),
                };
                match valid {
                    Ok(()) => {
                        info!(
                            bucket,
                            key,
                            completed = existing.completed_count(),
                            chunks = existing.chunk_count(),
                            "download_resume"
                        );
                        return Ok(existing);
                    }
                    Err(e) => warn!(bucket, key, reason = %e, "resume_rejected"),
                }
            }
            self.states.delete(&existing.identity).await?;
        }

        TransferState::new(identity, fingerprint, chunk_size)
    }

    /// Fetch every pending chunk of `state` into the destination file
    pub async fn run(&self, state: TransferState, cancel: CancellationToken) -> TransferSummary {
        let started = Instant::now();
        let bucket = state.identity.bucket.clone();
        let key = state.identity.key.clone();
        let destination = state.identity.local_path.clone();

        // Initiated
        let file = match open_destination(&state).await {
            Ok(file) => file,
            Err(e) => {
                error!(path = %destination.display(), error = %e, "destination_open_failed");
                let summary = TransferSummary::from_state(&state, started.elapsed());
                return self.finish(summary.with_error(e, None));
            }
        };
        if state.chunk_count() > 0 {
            self.persist(&state).await;
        }

        // ChunksInFlight
        self.sink.on_transfer_start(
            TransferType::Download,
            state.total_size,
            state.bytes_transferred(),
        );
        let pending = state.pending_indices();
        let workers = self.options.worker_count(MAX_DOWNLOAD_CONCURRENCY).min(pending.len());
        info!(
            bucket = %bucket,
            key = %key,
            path = %destination.display(),
            chunks = state.chunk_count(),
            pending = pending.len(),
            workers,
            "download_started"
        );

        let chunks = Arc::new(ChunkRun {
            store: self.store.clone(),
            states: self.states.clone(),
            sink: self.sink.clone(),
            retry: self.options.retry.clone(),
            bucket: bucket.clone(),
            key: key.clone(),
            file: Mutex::new(file),
            state: Mutex::new(state),
            pending,
            cursor: AtomicUsize::new(0),
            halted: AtomicBool::new(false),
            failure: Mutex::new(None),
            cancel: cancel.clone(),
        });

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            handles.push(tokio::spawn(chunks.clone().worker(worker_id)));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                chunks
                    .fail(None, TransferError::Io(std::io::Error::other(e.to_string())))
                    .await;
            }
        }

        let state = chunks.state.lock().await.clone();
        let failure = chunks.failure.lock().await.take();
        let sync_result = chunks.file.lock().await.sync_all().await;
        drop(chunks);

        if let Some((chunk, e)) = failure {
            // Aborted: partial file and chunk map stay on disk for resume
            error!(
                bucket = %bucket,
                key = %key,
                chunk = ?chunk,
                completed = state.completed_count(),
                error = %e,
                "download_failed"
            );
            self.persist(&state).await;
            let summary = TransferSummary::from_state(&state, started.elapsed());
            return self.finish(summary.with_error(e, chunk));
        }
        if cancel.is_cancelled() || !state.is_complete() {
            info!(
                bucket = %bucket,
                key = %key,
                completed = state.completed_count(),
                chunks = state.chunk_count(),
                "download_cancelled"
            );
            self.persist(&state).await;
            let summary = TransferSummary::from_state(&state, started.elapsed());
            return self.finish(summary.with_error(TransferError::Cancelled, None));
        }
        if let Err(e) = sync_result {
            error!(path = %destination.display(), error = %e, "destination_sync_failed");
            self.persist(&state).await;
            let summary = TransferSummary::from_state(&state, started.elapsed());
            return self.finish(summary.with_error(e.into(), None));
        }

        // Completed
        if let Err(e) = self.states.delete(&state.identity).await {
            warn!(error = %e, "state_delete_failed");
        }
        info!(
            bucket = %bucket,
            key = %key,
            path = %destination.display(),
            bytes = state.total_size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "download_completed"
        );
        self.finish(TransferSummary::from_state(&state, started.elapsed()))
    }

    async fn persist(&self, state: &TransferState) {
        if let Err(e) = self.states.save(state).await {
            warn!(error = %e, "state_save_failed");
        }
    }

    fn finish(&self, summary: TransferSummary) -> TransferSummary {
        self.sink.on_transfer_complete(&summary);
        summary
    }
}

/// A resumed chunk map is only meaningful over the file it was written into
async fn check_destination(state: &TransferState) -> Result<()> {
    let path = &state.identity.local_path;
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() == state.total_size => Ok(()),
        Ok(meta) => Err(TransferError::ResumeInvalid(format!(
            "destination is {} bytes, expected {}",
            meta.len(),
            state.total_size
        ))),
        Err(_) => Err(TransferError::ResumeInvalid(format!(
            "destination {} is missing",
            path.display()
        ))),
    }
}

/// Open the destination (truncating unless resuming) and preallocate it
async fn open_destination(state: &TransferState) -> Result<File> {
    let path = &state.identity.local_path;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let resuming = state.completed_count() > 0;
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(!resuming)
        .open(path)
        .await?;
    file.set_len(state.total_size).await?;
    Ok(file)
}

/// Shared by the chunk workers of one run
struct ChunkRun {
    store: Arc<dyn ObjectStore>,
    states: Arc<TransferStateStore>,
    sink: Arc<dyn ProgressSink>,
    retry: RetryPolicy,
    bucket: String,
    key: String,
    /// Destination handle; its cursor is shared, so seek+write happen under this lock
    file: Mutex<File>,
    state: Mutex<TransferState>,
    pending: Vec<usize>,
    cursor: AtomicUsize,
    halted: AtomicBool,
    failure: Mutex<Option<(Option<usize>, TransferError)>>,
    cancel: CancellationToken,
}

impl ChunkRun {
    async fn worker(self: Arc<Self>, worker_id: usize) {
        loop {
            if self.cancel.is_cancelled() || self.halted.load(Ordering::SeqCst) {
                break;
            }
            let slot = self.cursor.fetch_add(1, Ordering::SeqCst);
            let Some(&index) = self.pending.get(slot) else {
                break;
            };
            debug!(worker = worker_id, chunk = index, "chunk_claimed");

            match self.download_chunk(index).await {
                Ok(()) => {}
                Err(TransferError::Cancelled) => break,
                Err(e) => {
                    self.fail(Some(index), e).await;
                    break;
                }
            }
        }
    }

    async fn fail(&self, chunk: Option<usize>, error: TransferError) {
        self.halted.store(true, Ordering::SeqCst);
        let mut failure = self.failure.lock().await;
        if failure.is_none() {
            *failure = Some((chunk, error));
        }
    }

    async fn download_chunk(&self, index: usize) -> Result<()> {
        let (start, end, size) = {
            let state = self.state.lock().await;
            let chunk = &state.chunks[index];
            (chunk.start, chunk.end, chunk.size)
        };
        self.sink.on_chunk_start(index, size);

        let mut attempt = 1u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let sink = self.sink.clone();
            let on_bytes: ProgressFn = Arc::new(move |n| sink.on_chunk_progress(index, n));
            let result = match self
                .store
                .get_range(&self.bucket, &self.key, start, end, on_bytes, &self.cancel)
                .await
            {
                Ok(data) if data.len() as u64 == size => Ok(data),
                Ok(data) => Err(TransferError::Integrity(format!(
                    "chunk {} expected {} bytes, received {}",
                    index,
                    size,
                    data.len()
                ))),
                Err(e) => Err(e),
            };

            match result {
                Ok(data) => {
                    self.write_at(start, &data).await?;
                    self.complete_chunk(index).await;
                    return Ok(());
                }
                Err(_) if self.cancel.is_cancelled() => return Err(TransferError::Cancelled),
                Err(TransferError::Cancelled) => return Err(TransferError::Cancelled),
                Err(e) => {
                    self.sink.on_chunk_error(index, &e, attempt);
                    self.state.lock().await.chunks[index].record_failure(&e);

                    if !self.retry.should_retry(&e, attempt, self.retry.max_attempts()) {
                        return Err(e);
                    }
                    let delay = self.retry.backoff_delay(attempt);
                    warn!(
                        chunk = index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "chunk_retry"
                    );
                    self.retry.pause(delay, &self.cancel).await?;
                    attempt += 1;
                }
            }
        }
    }

    async fn write_at(&self, offset: u64, data: &Bytes) -> Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn complete_chunk(&self, index: usize) {
        let mut state = self.state.lock().await;
        state.chunks[index].mark_completed(None);
        state.touch();
        if let Err(e) = self.states.save(&state).await {
            warn!(chunk = index, error = %e, "state_save_failed");
        }
        drop(state);

        debug!(chunk = index, "chunk_completed");
        self.sink.on_chunk_complete(index, None);
    }
}
