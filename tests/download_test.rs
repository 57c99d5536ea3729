mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{Fault, MemoryStore};
use s3xfer::transfer::{
    DownloadEngine, NoopSink, RetryPolicy, TransferIdentity, TransferOptions, TransferStateStore,
    TransferSummary, TransferType,
};
use s3xfer::TransferError;

const BUCKET: &str = "bucket";
const KEY: &str = "data/archive.tar";
const CHUNK: u64 = 64 * 1024;

/// Five chunks, the last one short
const OBJECT_LEN: usize = 4 * CHUNK as usize + 37_857;

struct Harness {
    dir: TempDir,
    remote: Arc<MemoryStore>,
    states: Arc<TransferStateStore>,
    dest: PathBuf,
    data: Vec<u8>,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let data = common::payload(OBJECT_LEN);
        let remote = Arc::new(MemoryStore::new());
        remote.put_object(BUCKET, KEY, data.clone());
        let states = Arc::new(TransferStateStore::new(
            dir.path().join("state"),
            Duration::from_secs(3600),
        ));
        let dest = dir.path().join("out/archive.tar");
        Self {
            dir,
            remote,
            states,
            dest,
            data,
        }
    }

    fn engine(&self, concurrency: usize) -> DownloadEngine {
        let options = TransferOptions {
            concurrency,
            retry: RetryPolicy::new(3, Duration::from_millis(1)),
            verify_part_etag: true,
        };
        DownloadEngine::new(
            self.remote.clone(),
            self.states.clone(),
            options,
            Arc::new(NoopSink),
        )
    }

    async fn download(&self, concurrency: usize, cancel: CancellationToken) -> TransferSummary {
        self.engine(concurrency)
            .download(BUCKET, KEY, &self.dest, CHUNK, true, cancel)
            .await
    }

    /// Run until two chunks have landed, then cancel
    async fn interrupt(&self) {
        let cancel = CancellationToken::new();
        self.remote.cancel_after(2, cancel.clone());
        let summary = self.download(1, cancel).await;
        assert!(summary.is_cancelled());
        assert_eq!(summary.chunks_completed, 2);
        self.remote.reset_logs();
    }

    fn identity(&self) -> TransferIdentity {
        TransferIdentity::new(BUCKET, KEY, &self.dest, TransferType::Download)
    }

    fn written(&self) -> Vec<u8> {
        std::fs::read(&self.dest).unwrap()
    }
}

/// Sequential and parallel downloads produce the same bytes
#[tokio::test]
async fn test_download_concurrency_does_not_change_output() {
    let h = Harness::new();
    let summary = h.download(1, CancellationToken::new()).await;
    assert!(summary.is_success(), "{:?}", summary.error);
    assert_eq!(summary.chunks_total, 5);
    let sequential = h.written();

    let parallel_dest = h.dir.path().join("parallel.tar");
    let summary = h
        .engine(4)
        .download(BUCKET, KEY, &parallel_dest, CHUNK, true, CancellationToken::new())
        .await;
    assert!(summary.is_success(), "{:?}", summary.error);

    assert_eq!(sequential, h.data);
    assert_eq!(std::fs::read(&parallel_dest).unwrap(), h.data);
    assert!(h.states.load(&h.identity()).await.unwrap().is_none());
}

/// Each chunk maps to one inclusive byte range
#[tokio::test]
async fn test_download_requests_inclusive_ranges() {
    let h = Harness::new();
    assert!(h.download(1, CancellationToken::new()).await.is_success());

    let mut ranges = h.remote.range_requests();
    ranges.sort();
    assert_eq!(ranges.len(), 5);
    assert_eq!(ranges[0], (0, CHUNK - 1));
    assert_eq!(ranges[1], (CHUNK, 2 * CHUNK - 1));
    assert_eq!(ranges[4], (4 * CHUNK, OBJECT_LEN as u64 - 1));
}

/// A resumed download fetches only the chunks the record marks pending
#[tokio::test]
async fn test_download_resumes_remaining_chunks() {
    let h = Harness::new();
    h.interrupt().await;

    let saved = h.states.load(&h.identity()).await.unwrap().unwrap();
    assert_eq!(saved.completed_count(), 2);
    assert_eq!(std::fs::metadata(&h.dest).unwrap().len(), OBJECT_LEN as u64);

    let summary = h.download(3, CancellationToken::new()).await;

    assert!(summary.is_success(), "{:?}", summary.error);
    let ranges = h.remote.range_requests();
    assert_eq!(ranges.len(), 3);
    assert!(ranges.iter().all(|(start, _)| *start >= 2 * CHUNK));
    assert_eq!(h.written(), h.data);
    assert!(h.states.load(&h.identity()).await.unwrap().is_none());
}

/// A changed remote object invalidates the record
#[tokio::test]
async fn test_download_remote_change_restarts() {
    let h = Harness::new();
    h.interrupt().await;

    let mut replaced = h.data.clone();
    replaced.reverse();
    h.remote.put_object(BUCKET, KEY, replaced.clone());

    let summary = h.download(2, CancellationToken::new()).await;

    assert!(summary.is_success(), "{:?}", summary.error);
    assert_eq!(h.remote.range_requests().len(), 5);
    assert_eq!(h.written(), replaced);
}

/// Records older than the store's limit are not resumed
#[tokio::test]
async fn test_download_stale_record_restarts() {
    let h = Harness::new();
    h.interrupt().await;

    let mut saved = h.states.load(&h.identity()).await.unwrap().unwrap();
    saved.updated_at = chrono::Utc::now() - chrono::Duration::hours(2);
    h.states.save(&saved).await.unwrap();

    let summary = h.download(2, CancellationToken::new()).await;

    assert!(summary.is_success(), "{:?}", summary.error);
    assert_eq!(h.remote.range_requests().len(), 5);
    assert_eq!(h.written(), h.data);
}

/// The chunk map is useless once the partial file is gone
#[tokio::test]
async fn test_download_missing_destination_restarts() {
    let h = Harness::new();
    h.interrupt().await;
    std::fs::remove_file(&h.dest).unwrap();

    let summary = h.download(2, CancellationToken::new()).await;

    assert!(summary.is_success(), "{:?}", summary.error);
    assert_eq!(h.remote.range_requests().len(), 5);
    assert_eq!(h.written(), h.data);
}

/// Resume disabled refetches everything
#[tokio::test]
async fn test_download_without_resume_starts_over() {
    let h = Harness::new();
    h.interrupt().await;

    let summary = h
        .engine(2)
        .download(BUCKET, KEY, &h.dest, CHUNK, false, CancellationToken::new())
        .await;

    assert!(summary.is_success(), "{:?}", summary.error);
    assert_eq!(h.remote.range_requests().len(), 5);
    assert_eq!(h.written(), h.data);
}

/// A short body is an integrity failure and is not retried
#[tokio::test]
async fn test_download_short_body_is_fatal() {
    let h = Harness::new();
    h.remote.inject(CHUNK, Fault::Corrupt, 1);

    let summary = h.download(1, CancellationToken::new()).await;

    assert!(matches!(summary.error, Some(TransferError::Integrity(_))));
    assert_eq!(summary.failed_chunk, Some(1));
    assert_eq!(summary.chunks_completed, 1);
    assert_eq!(h.remote.range_requests().len(), 2);

    // Completed chunks stay recorded for a later resume
    let saved = h.states.load(&h.identity()).await.unwrap().unwrap();
    assert_eq!(saved.completed_count(), 1);
    assert_eq!(saved.chunks[1].retry_count, 1);
}

/// Transient range failures are retried per chunk
#[tokio::test]
async fn test_download_recovers_from_transient_failures() {
    let h = Harness::new();
    h.remote.inject(2 * CHUNK, Fault::Transport, 2);

    let summary = h.download(3, CancellationToken::new()).await;

    assert!(summary.is_success(), "{:?}", summary.error);
    let retried = h
        .remote
        .range_requests()
        .into_iter()
        .filter(|(start, _)| *start == 2 * CHUNK)
        .count();
    assert_eq!(retried, 3);
    assert_eq!(h.written(), h.data);
}

/// An empty object yields an empty file without any ranged GET
#[tokio::test]
async fn test_download_empty_object() {
    let h = Harness::new();
    h.remote.put_object(BUCKET, "empty", Vec::new());
    let dest = h.dir.path().join("empty.bin");

    let summary = h
        .engine(4)
        .download(BUCKET, "empty", &dest, CHUNK, true, CancellationToken::new())
        .await;

    assert!(summary.is_success(), "{:?}", summary.error);
    assert_eq!(summary.chunks_total, 0);
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
    assert!(h.remote.range_requests().is_empty());
}

/// A missing object fails at the probe with nothing written
#[tokio::test]
async fn test_download_missing_object() {
    let h = Harness::new();

    let summary = h
        .engine(2)
        .download(BUCKET, "absent", &h.dest, CHUNK, true, CancellationToken::new())
        .await;

    assert!(matches!(
        summary.error,
        Some(TransferError::Protocol { status: Some(404), .. })
    ));
    assert!(!h.dest.exists());
}
