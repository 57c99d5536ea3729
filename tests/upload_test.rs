mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{Fault, MemoryStore};
use s3xfer::s3::types::MIN_PART_SIZE;
use s3xfer::transfer::{
    EventQueue, NoopSink, ProgressEvent, RetryMode, RetryPolicy, TransferIdentity,
    TransferOptions, TransferStateStore, TransferType, UploadEngine,
};
use s3xfer::TransferError;

const BUCKET: &str = "bucket";
const KEY: &str = "images/disk.img";

/// Three parts: two full 5 MiB parts and a short tail
const SOURCE_LEN: usize = 2 * MIN_PART_SIZE as usize + 1234;

struct Harness {
    dir: TempDir,
    remote: Arc<MemoryStore>,
    states: Arc<TransferStateStore>,
    source: PathBuf,
    data: Vec<u8>,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let data = common::payload(SOURCE_LEN);
        let source = dir.path().join("disk.img");
        std::fs::write(&source, &data).unwrap();
        let states = Arc::new(TransferStateStore::new(
            dir.path().join("state"),
            Duration::from_secs(3600),
        ));
        Self {
            dir,
            remote: Arc::new(MemoryStore::new()),
            states,
            source,
            data,
        }
    }

    fn engine(&self, concurrency: usize) -> UploadEngine {
        self.engine_with(concurrency, RetryPolicy::new(3, Duration::from_millis(1)))
    }

    fn engine_with(&self, concurrency: usize, retry: RetryPolicy) -> UploadEngine {
        let options = TransferOptions {
            concurrency,
            retry,
            verify_part_etag: true,
        };
        UploadEngine::new(
            self.remote.clone(),
            self.states.clone(),
            options,
            Arc::new(NoopSink),
        )
    }

    fn identity(&self) -> TransferIdentity {
        TransferIdentity::new(BUCKET, KEY, &self.source, TransferType::Upload)
    }

    fn uploaded(&self) -> Vec<u8> {
        self.remote.object(BUCKET, KEY).expect("object not created").to_vec()
    }

    fn attempts_for(&self, part_number: u32) -> usize {
        self.remote
            .part_attempts()
            .into_iter()
            .filter(|p| *p == part_number)
            .count()
    }
}

async fn upload(engine: &UploadEngine, source: &Path, cancel: CancellationToken) -> s3xfer::TransferSummary {
    engine
        .upload(BUCKET, KEY, source, MIN_PART_SIZE, true, cancel)
        .await
}

/// Parts are sent to CompleteMultipartUpload ascending even when they finish out of order
#[tokio::test]
async fn test_upload_completes_parts_in_ascending_order() {
    let h = Harness::new();
    h.remote.delay(1, Duration::from_millis(100));

    let summary = upload(&h.engine(3), &h.source, CancellationToken::new()).await;

    assert!(summary.is_success(), "{:?}", summary.error);
    assert_eq!(summary.chunks_total, 3);
    assert_eq!(summary.chunks_completed, 3);
    assert_eq!(summary.bytes_transferred, SOURCE_LEN as u64);
    assert!(summary.etag.as_deref().unwrap().ends_with("-3"));
    assert_eq!(summary.location.as_deref(), Some("memory://bucket/images/disk.img"));

    assert_eq!(h.remote.completed_orders(), vec![vec![1, 2, 3]]);
    assert_eq!(h.uploaded(), h.data);
    assert!(h.states.load(&h.identity()).await.unwrap().is_none());
}

/// An interrupted upload resumes with the same upload id and sends only the missing parts
#[tokio::test]
async fn test_upload_resumes_remaining_parts() {
    let h = Harness::new();
    let cancel = CancellationToken::new();
    h.remote.cancel_after(1, cancel.clone());

    let first = upload(&h.engine(1), &h.source, cancel).await;
    assert!(first.is_cancelled());
    assert_eq!(first.chunks_completed, 1);

    let saved = h.states.load(&h.identity()).await.unwrap().unwrap();
    assert_eq!(saved.completed_count(), 1);
    assert!(saved.chunks[0].completed);
    assert!(saved.chunks[0].etag.is_some());
    let upload_id = saved.upload_id.clone().unwrap();

    h.remote.reset_logs();
    let second = upload(&h.engine(2), &h.source, CancellationToken::new()).await;

    assert!(second.is_success(), "{:?}", second.error);
    let mut sent = h.remote.part_attempts();
    sent.sort();
    assert_eq!(sent, vec![2, 3]);
    assert_eq!(h.uploaded(), h.data);
    assert!(h.remote.aborted().is_empty());
    assert_eq!(h.remote.open_uploads(), 0);
    assert_eq!(upload_id, "upload-0");
    assert!(h.states.load(&h.identity()).await.unwrap().is_none());
}

/// A differently spelled path to the same source resumes the same record
#[tokio::test]
async fn test_upload_resume_ignores_path_spelling() {
    let h = Harness::new();
    std::fs::create_dir(h.dir.path().join("sub")).unwrap();
    let dotted = h.dir.path().join(".").join("disk.img");
    let detour = h.dir.path().join("sub").join("..").join("disk.img");

    let cancel = CancellationToken::new();
    h.remote.cancel_after(1, cancel.clone());
    let first = upload(&h.engine(1), &dotted, cancel).await;
    assert!(first.is_cancelled());
    assert!(h.states.load(&h.identity()).await.unwrap().is_some());

    h.remote.reset_logs();
    let second = upload(&h.engine(2), &detour, CancellationToken::new()).await;

    assert!(second.is_success(), "{:?}", second.error);
    let mut sent = h.remote.part_attempts();
    sent.sort();
    assert_eq!(sent, vec![2, 3]);
    assert!(h.remote.aborted().is_empty());
    assert_eq!(h.remote.open_uploads(), 0);
    assert_eq!(h.uploaded(), h.data);
}

/// Exhausted retries abort the remote upload and reset the local record
#[tokio::test]
async fn test_upload_exhausted_retries_abort_remote() {
    let h = Harness::new();
    h.remote.inject(2, Fault::Transport, 10);

    let summary = upload(&h.engine(1), &h.source, CancellationToken::new()).await;

    assert!(matches!(summary.error, Some(TransferError::Transport { .. })));
    assert_eq!(summary.failed_chunk, Some(1));
    assert_eq!(h.attempts_for(2), 3);
    assert_eq!(h.attempts_for(3), 0);
    assert_eq!(h.remote.aborted(), vec!["upload-0".to_string()]);
    assert_eq!(h.remote.open_uploads(), 0);
    assert!(h.remote.completed_orders().is_empty());

    let saved = h.states.load(&h.identity()).await.unwrap().unwrap();
    assert!(saved.upload_id.is_none());
    assert_eq!(saved.completed_count(), 0);
    assert_eq!(saved.chunks[1].retry_count, 3);
    assert!(saved.chunks[1].last_error.is_some());
}

/// A part that fails twice succeeds on its third and final attempt
#[tokio::test]
async fn test_upload_recovers_from_transient_failures() {
    let h = Harness::new();
    h.remote.inject(2, Fault::Transport, 2);

    let summary = upload(&h.engine(3), &h.source, CancellationToken::new()).await;

    assert!(summary.is_success(), "{:?}", summary.error);
    assert_eq!(h.attempts_for(2), 3);
    assert_eq!(h.attempts_for(1), 1);
    assert_eq!(h.uploaded(), h.data);
    assert!(h.remote.aborted().is_empty());
}

/// Protocol errors are fatal by default and retried only in uniform mode
#[tokio::test]
async fn test_upload_protocol_error_retry_depends_on_mode() {
    let h = Harness::new();
    h.remote.inject(1, Fault::Protocol, 1);

    let summary = upload(&h.engine(1), &h.source, CancellationToken::new()).await;
    assert!(matches!(summary.error, Some(TransferError::Protocol { .. })));
    assert_eq!(summary.failed_chunk, Some(0));
    assert_eq!(h.attempts_for(1), 1);

    h.remote.reset_logs();
    h.remote.inject(1, Fault::Protocol, 1);
    let uniform = RetryPolicy::new(3, Duration::from_millis(1)).with_mode(RetryMode::Uniform);
    let summary = upload(&h.engine_with(1, uniform), &h.source, CancellationToken::new()).await;

    assert!(summary.is_success(), "{:?}", summary.error);
    assert_eq!(h.attempts_for(1), 2);
    assert_eq!(h.uploaded(), h.data);
}

/// A part ETag that is not the MD5 of the part is an integrity failure
#[tokio::test]
async fn test_upload_etag_mismatch_is_fatal() {
    let h = Harness::new();
    h.remote.inject(1, Fault::Corrupt, 1);

    let summary = upload(&h.engine(1), &h.source, CancellationToken::new()).await;

    assert!(matches!(summary.error, Some(TransferError::Integrity(_))));
    assert_eq!(h.attempts_for(1), 1);
    assert_eq!(h.remote.aborted().len(), 1);
}

/// Modifying the source discards the old record and aborts its multipart upload
#[tokio::test]
async fn test_upload_source_change_restarts() {
    let h = Harness::new();
    let cancel = CancellationToken::new();
    h.remote.cancel_after(1, cancel.clone());
    assert!(upload(&h.engine(1), &h.source, cancel).await.is_cancelled());

    let mut changed = h.data.clone();
    changed.extend_from_slice(b"appended");
    std::fs::write(&h.source, &changed).unwrap();

    let state = h
        .engine(1)
        .prepare(BUCKET, KEY, &h.source, MIN_PART_SIZE, true)
        .await
        .unwrap();
    assert_eq!(state.completed_count(), 0);
    assert!(state.upload_id.is_none());
    assert_eq!(state.total_size, changed.len() as u64);
    assert_eq!(h.remote.aborted(), vec!["upload-0".to_string()]);
    assert!(h.states.load(&h.identity()).await.unwrap().is_none());
}

/// Resume disabled starts over even with a valid record
#[tokio::test]
async fn test_upload_without_resume_starts_over() {
    let h = Harness::new();
    let cancel = CancellationToken::new();
    h.remote.cancel_after(1, cancel.clone());
    assert!(upload(&h.engine(1), &h.source, cancel).await.is_cancelled());

    h.remote.reset_logs();
    let summary = h
        .engine(2)
        .upload(BUCKET, KEY, &h.source, MIN_PART_SIZE, false, CancellationToken::new())
        .await;

    assert!(summary.is_success(), "{:?}", summary.error);
    assert_eq!(h.remote.part_attempts().len(), 3);
    assert_eq!(h.remote.aborted(), vec!["upload-0".to_string()]);
    assert_eq!(h.uploaded(), h.data);
}

/// Small chunk sizes are raised to the multipart minimum
#[tokio::test]
async fn test_upload_part_size_floor() {
    let h = Harness::new();
    let state = h
        .engine(1)
        .prepare(BUCKET, KEY, &h.source, 1024, true)
        .await
        .unwrap();
    assert_eq!(state.chunk_size, MIN_PART_SIZE);
    assert_eq!(state.chunk_count(), 3);
}

/// Empty sources and identifiers are rejected before any remote call
#[tokio::test]
async fn test_upload_validation() {
    let h = Harness::new();
    let empty = h.dir.path().join("empty.bin");
    std::fs::write(&empty, b"").unwrap();

    let summary = upload(&h.engine(1), &empty, CancellationToken::new()).await;
    assert!(matches!(summary.error, Some(TransferError::Validation(_))));

    let summary = h
        .engine(1)
        .upload("", KEY, &h.source, MIN_PART_SIZE, true, CancellationToken::new())
        .await;
    assert!(matches!(summary.error, Some(TransferError::Validation(_))));

    let summary = h
        .engine(1)
        .upload(BUCKET, KEY, &h.source, 0, true, CancellationToken::new())
        .await;
    assert!(matches!(summary.error, Some(TransferError::Validation(_))));

    let missing = h.dir.path().join("missing.bin");
    let summary = upload(&h.engine(1), &missing, CancellationToken::new()).await;
    assert!(matches!(summary.error, Some(TransferError::Io(_))));

    assert_eq!(h.remote.open_uploads(), 0);
    assert!(h.remote.part_attempts().is_empty());
}

/// A cancelled token stops the upload before any part is sent
#[tokio::test]
async fn test_upload_cancelled_before_start() {
    let h = Harness::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = upload(&h.engine(2), &h.source, cancel).await;

    assert!(summary.is_cancelled());
    assert!(h.remote.part_attempts().is_empty());
    assert!(h.remote.aborted().is_empty());
}

/// Lifecycle events arrive start-first and finish-last
#[tokio::test]
async fn test_upload_emits_lifecycle_events() {
    let h = Harness::new();
    h.remote.inject(3, Fault::Transport, 1);
    let (queue, mut events) = EventQueue::channel();
    let options = TransferOptions {
        concurrency: 2,
        retry: RetryPolicy::new(3, Duration::from_millis(1)),
        verify_part_etag: true,
    };
    let engine = UploadEngine::new(h.remote.clone(), h.states.clone(), options, Arc::new(queue));

    let summary = upload(&engine, &h.source, CancellationToken::new()).await;
    assert!(summary.is_success(), "{:?}", summary.error);

    let events = events.drain();
    assert!(matches!(
        events.first(),
        Some(ProgressEvent::TransferStarted { total_bytes, completed_bytes: 0, .. })
            if *total_bytes == SOURCE_LEN as u64
    ));
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::TransferFinished { success: true, .. })
    ));

    let completed = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::ChunkCompleted { .. }))
        .count();
    assert_eq!(completed, 3);

    let failures: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::ChunkFailed {
                index, kind, attempt, ..
            } => Some((*index, *kind, *attempt)),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![(2, "transport", 1)]);
}
