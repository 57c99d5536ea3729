//! Multipart upload engine
//!
//! Lifecycle: Initiated -> PartsInFlight -> Finalizing -> Completed | Aborted.
//!
//! - A bounded pool of part workers claims pending chunk indices from one
//!   shared cursor, so no chunk is claimed twice
//! - Each completed part is written to the state store before the next claim
//! - A fatal failure aborts the remote upload and resets the persisted state
//! - Cancellation keeps the upload id and completed parts for a later resume

use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TransferError};
use crate::s3::client::{content_md5, hex_md5};
use crate::s3::transport::ProgressFn;
use crate::s3::types::upload_part_size;
use crate::transfer::progress::ProgressSink;
use crate::transfer::remote::{ObjectStore, UploadPartRequest};
use crate::transfer::retry::RetryPolicy;
use crate::transfer::state::{SourceFingerprint, TransferIdentity, TransferState, TransferType};
use crate::transfer::store::TransferStateStore;
use crate::transfer::{absolute_path, check_identifiers, TransferOptions, TransferSummary};

/// Upper bound on concurrent part uploads
pub const MAX_UPLOAD_CONCURRENCY: usize = 10;

/// Drives multipart uploads against an [`ObjectStore`]
pub struct UploadEngine {
    store: Arc<dyn ObjectStore>,
    states: Arc<TransferStateStore>,
    options: TransferOptions,
    sink: Arc<dyn ProgressSink>,
}

impl UploadEngine {
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

    /// Prepare and run an upload of `source` to `bucket/key`
    pub async fn upload(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        chunk_size: u64,
        resume: bool,
        cancel: CancellationToken,
    ) -> TransferSummary {
        let started = Instant::now();
        match self.prepare(bucket, key, source, chunk_size, resume).await {
            Ok(state) => self.run(state, cancel).await,
            Err(e) => {
                let identity = TransferIdentity::new(bucket, key, source, TransferType::Upload);
                self.finish(TransferSummary::failed(&identity, e, started.elapsed()))
            }
        }
    }

    /// Build the state for an upload: the persisted one when it is still
    /// valid for the current source and `resume` is set, a fresh one otherwise.
    ///
    /// A discarded record that still names a multipart upload has that
    /// upload aborted so it does not linger on the server.
    pub async fn prepare(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        chunk_size: u64,
        resume: bool,
    ) -> Result<TransferState> {
        check_identifiers(bucket, key)?;
        if chunk_size == 0 {
            return Err(TransferError::validation("chunk size must be greater than zero"));
        }

        let source = absolute_path(source)?;
        let fingerprint = SourceFingerprint::of_local_file(&source).await?;
        if fingerprint.size() == 0 {
            return Err(TransferError::validation(format!(
                "source file is empty: {}",
                source.display()
            )));
        }

        let identity = TransferIdentity::new(bucket, key, source, TransferType::Upload);
        if let Some(existing) = self.states.load(&identity).await? {
            if resume {
                match self.states.validate(&existing, &fingerprint) {
                    Ok(()) => {
                        info!(
                            bucket,
                            key,
                            completed = existing.completed_count(),
                            chunks = existing.chunk_count(),
                            "upload_resume"
                        );
                        return Ok(existing);
                    }
                    Err(e) => warn!(bucket, key, reason = %e, "resume_rejected"),
                }
            }
            self.discard(existing).await?;
        }

        let part_size = upload_part_size(fingerprint.size(), chunk_size);
        if part_size != chunk_size {
            debug!(requested = chunk_size, part_size, "part_size_adjusted");
        }
        TransferState::new(identity, fingerprint, part_size)
    }

    async fn discard(&self, state: TransferState) -> Result<()> {
        if let Some(upload_id) = &state.upload_id {
            let identity = &state.identity;
            match self
                .store
                .abort_multipart_upload(&identity.bucket, &identity.key, upload_id)
                .await
            {
                Ok(()) => info!(upload_id = %upload_id, "stale_upload_aborted"),
                Err(e) => warn!(upload_id = %upload_id, error = %e, "stale_upload_abort_failed"),
            }
        }
        self.states.delete(&state.identity).await
    }

    /// Upload every pending part of `state`, then complete the multipart upload
    pub async fn run(&self, mut state: TransferState, cancel: CancellationToken) -> TransferSummary {
        let started = Instant::now();
        let bucket = state.identity.bucket.clone();
        let key = state.identity.key.clone();

        // Initiated
        let upload_id = match state.upload_id.clone() {
            Some(id) => id,
            None => match self.initiate(&mut state, &cancel).await {
                Ok(id) => id,
                Err(e) => {
                    if e.is_cancelled() {
                        info!(bucket = %bucket, key = %key, "upload_cancelled");
                    } else {
                        error!(bucket = %bucket, key = %key, error = %e, "upload_initiate_failed");
                    }
                    let summary = TransferSummary::from_state(&state, started.elapsed());
                    return self.finish(summary.with_error(e, None));
                }
            },
        };

        // PartsInFlight
        self.sink.on_transfer_start(
            TransferType::Upload,
            state.total_size,
            state.bytes_transferred(),
        );
        let pending = state.pending_indices();
        let workers = self.options.worker_count(MAX_UPLOAD_CONCURRENCY).min(pending.len());
        info!(
            bucket = %bucket,
            key = %key,
            upload_id = %upload_id,
            chunks = state.chunk_count(),
            pending = pending.len(),
            workers,
            "upload_started"
        );

        let parts = Arc::new(PartRun {
            store: self.store.clone(),
            states: self.states.clone(),
            sink: self.sink.clone(),
            retry: self.options.retry.clone(),
            verify_etag: self.options.verify_part_etag,
            source: state.identity.local_path.clone(),
            bucket: bucket.clone(),
            key: key.clone(),
            upload_id: upload_id.clone(),
            state: Mutex::new(state),
            pending,
            cursor: AtomicUsize::new(0),
            halted: AtomicBool::new(false),
            failure: Mutex::new(None),
            cancel: cancel.clone(),
        });

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            handles.push(tokio::spawn(parts.clone().worker(worker_id)));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                parts
                    .fail(None, TransferError::Io(std::io::Error::other(e.to_string())))
                    .await;
            }
        }

        let state = parts.state.lock().await.clone();
        let failure = parts.failure.lock().await.take();
        drop(parts);

        if let Some((chunk, e)) = failure {
            return self.abort(state, &upload_id, e, chunk, started).await;
        }
        if cancel.is_cancelled() || !state.is_complete() {
            info!(
                bucket = %bucket,
                key = %key,
                completed = state.completed_count(),
                chunks = state.chunk_count(),
                "upload_cancelled"
            );
            self.persist(&state).await;
            let summary = TransferSummary::from_state(&state, started.elapsed());
            return self.finish(summary.with_error(TransferError::Cancelled, None));
        }

        // Finalizing
        let completed = state.completed_parts();
        let result = self
            .options
            .retry
            .retry("complete_multipart_upload", &cancel, |_| {
                self.store
                    .complete_multipart_upload(&bucket, &key, &upload_id, &completed)
            })
            .await;

        match result {
            Ok(response) => {
                if let Err(e) = self.states.delete(&state.identity).await {
                    warn!(error = %e, "state_delete_failed");
                }
                info!(
                    bucket = %bucket,
                    key = %key,
                    etag = %response.etag,
                    bytes = state.total_size,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "upload_completed"
                );
                let mut summary = TransferSummary::from_state(&state, started.elapsed());
                summary.etag = Some(response.etag);
                summary.location = response.location;
                summary.version_id = response.version_id;
                self.finish(summary)
            }
            Err(TransferError::Cancelled) => {
                info!(bucket = %bucket, key = %key, "upload_cancelled");
                let summary = TransferSummary::from_state(&state, started.elapsed());
                self.finish(summary.with_error(TransferError::Cancelled, None))
            }
            Err(e) => self.abort(state, &upload_id, e, None, started).await,
        }
    }

    async fn initiate(&self, state: &mut TransferState, cancel: &CancellationToken) -> Result<String> {
        let bucket = state.identity.bucket.clone();
        let key = state.identity.key.clone();
        let response = self
            .options
            .retry
            .retry("create_multipart_upload", cancel, |_| {
                self.store.create_multipart_upload(&bucket, &key)
            })
            .await?;

        debug!(upload_id = %response.upload_id, "multipart_upload_created");
        state.upload_id = Some(response.upload_id.clone());
        state.touch();
        self.persist(state).await;
        Ok(response.upload_id)
    }

    /// Aborted: release the remote upload, then reset the record so the next run starts fresh
    async fn abort(
        &self,
        mut state: TransferState,
        upload_id: &str,
        error: TransferError,
        failed_chunk: Option<usize>,
        started: Instant,
    ) -> TransferSummary {
        let bucket = state.identity.bucket.clone();
        let key = state.identity.key.clone();
        error!(
            bucket = %bucket,
            key = %key,
            upload_id,
            chunk = ?failed_chunk,
            error = %error,
            "upload_failed"
        );

        match self.store.abort_multipart_upload(&bucket, &key, upload_id).await {
            Ok(()) => info!(upload_id, "upload_aborted"),
            Err(e) => warn!(upload_id, error = %e, "upload_abort_failed"),
        }

        let summary = TransferSummary::from_state(&state, started.elapsed());
        state.reset_progress();
        self.persist(&state).await;
        self.finish(summary.with_error(error, failed_chunk))
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

/// Shared by the part workers of one run
struct PartRun {
    store: Arc<dyn ObjectStore>,
    states: Arc<TransferStateStore>,
    sink: Arc<dyn ProgressSink>,
    retry: RetryPolicy,
    verify_etag: bool,
    source: PathBuf,
    bucket: String,
    key: String,
    upload_id: String,
    state: Mutex<TransferState>,
    /// Chunk indices to upload, claimed in order through `cursor`
    pending: Vec<usize>,
    cursor: AtomicUsize,
    /// Set after a fatal failure; stops new claims
    halted: AtomicBool,
    failure: Mutex<Option<(Option<usize>, TransferError)>>,
    cancel: CancellationToken,
}

impl PartRun {
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

            match self.upload_chunk(index).await {
                Ok(()) => {}
                Err(TransferError::Cancelled) => break,
                Err(e) => {
                    self.fail(Some(index), e).await;
                    break;
                }
            }
        }
    }

    /// Record the first fatal failure and stop further claims
    async fn fail(&self, chunk: Option<usize>, error: TransferError) {
        self.halted.store(true, Ordering::SeqCst);
        let mut failure = self.failure.lock().await;
        if failure.is_none() {
            *failure = Some((chunk, error));
        }
    }

    async fn upload_chunk(&self, index: usize) -> Result<()> {
        let (start, size, part_number) = {
            let state = self.state.lock().await;
            let chunk = &state.chunks[index];
            (chunk.start, chunk.size, chunk.part_number())
        };

        let data = self.read_chunk(start, size).await?;
        let md5 = content_md5(&data);
        let local_etag = hex_md5(&data);
        self.sink.on_chunk_start(index, size);

        let mut attempt = 1u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let sink = self.sink.clone();
            let on_bytes: ProgressFn = Arc::new(move |n| sink.on_chunk_progress(index, n));
            let request = UploadPartRequest {
                bucket: &self.bucket,
                key: &self.key,
                upload_id: &self.upload_id,
                part_number,
                data: data.clone(),
                content_md5: &md5,
            };

            let result = match self.store.upload_part(request, on_bytes, &self.cancel).await {
                Ok(response) => self.check_etag(index, response.etag, &local_etag),
                Err(e) => Err(e),
            };

            match result {
                Ok(etag) => {
                    self.complete_chunk(index, etag).await;
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
                        part_number,
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

    async fn read_chunk(&self, start: u64, size: u64) -> Result<Bytes> {
        let mut file = tokio::fs::File::open(&self.source).await?;
        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; size as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// A plain 32-hex part ETag is the MD5 of the part and must match ours
    fn check_etag(&self, index: usize, etag: String, local: &str) -> Result<String> {
        let is_plain_md5 = etag.len() == 32 && etag.bytes().all(|b| b.is_ascii_hexdigit());
        if self.verify_etag && is_plain_md5 && !etag.eq_ignore_ascii_case(local) {
            return Err(TransferError::Integrity(format!(
                "part {} ETag {} does not match local MD5 {}",
                index + 1,
                etag,
                local
            )));
        }
        Ok(etag)
    }

    async fn complete_chunk(&self, index: usize, etag: String) {
        let mut state = self.state.lock().await;
        state.chunks[index].mark_completed(Some(etag.clone()));
        state.touch();
        if let Err(e) = self.states.save(&state).await {
            warn!(chunk = index, error = %e, "state_save_failed");
        }
        drop(state);

        debug!(chunk = index, etag = %etag, "chunk_completed");
        self.sink.on_chunk_complete(index, Some(&etag));
    }
}
