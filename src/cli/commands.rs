use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cli::args::parse_s3_path;
use crate::core::Core;
use crate::s3::PresignMethod;
use crate::error::TransferError;
use crate::s3::S3Client;
use crate::transfer::{
    EventQueue, EventReceiver, ProgressEvent, ProgressTracker, SourceFingerprint, TransferState,
    TransferStateStore, TransferSummary, TransferType,
};

/// Upload a local file to `s3://bucket/key`
pub async fn cmd_upload(
    core: &Core,
    source: &Path,
    destination: &str,
    resume: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let (bucket, key) = parse_s3_path(destination)?;
    println!("{} -> s3://{}/{}", source.display(), bucket, key);

    let (queue, events) = EventQueue::channel();
    let renderer = spawn_renderer(events)?;
    let engine = core.upload_engine(Arc::new(queue));

    let summary = engine
        .upload(
            &bucket,
            &key,
            source,
            core.config.transfer.chunk_size,
            resume,
            cancel,
        )
        .await;
    drop(engine);
    let _ = renderer.await;

    report(summary)
}

/// Download `s3://bucket/key` into a local file
pub async fn cmd_download(
    core: &Core,
    source: &str,
    destination: &Path,
    resume: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let (bucket, key) = parse_s3_path(source)?;
    println!("s3://{}/{} -> {}", bucket, key, destination.display());

    let (queue, events) = EventQueue::channel();
    let renderer = spawn_renderer(events)?;
    let engine = core.download_engine(Arc::new(queue));

    let summary = engine
        .download(
            &bucket,
            &key,
            destination,
            core.config.transfer.chunk_size,
            resume,
            cancel,
        )
        .await;
    drop(engine);
    let _ = renderer.await;

    report(summary)
}

/// Print a presigned URL for `s3://bucket/key`
pub fn cmd_presign(core: &Core, path: &str, method: PresignMethod, expires: u64) -> Result<()> {
    let (bucket, key) = parse_s3_path(path)?;
    let presigned = core
        .s3_client()
        .presign(&bucket, &key, method, Duration::from_secs(expires))?;
    println!("{}", presigned.url);
    Ok(())
}

/// List resumable transfers in the state directory
pub async fn cmd_pending(core: &Core) -> Result<()> {
    let store = core.state_store();
    let states = store
        .list()
        .await
        .with_context(|| format!("Failed to read state directory {}", store.dir().display()))?;

    if states.is_empty() {
        println!("No pending transfers");
        return Ok(());
    }

    let client = core.s3_client();
    for state in states {
        let identity = &state.identity;
        let current = match current_fingerprint(&client, &state).await {
            Ok(fingerprint) => Some(fingerprint),
            Err(e) => {
                debug!(key = %identity.key, error = %e, "source_check_failed");
                None
            }
        };
        let status = resume_status(&store, &state, current.as_ref());
        println!(
            "{:<8}  s3://{}/{}  {}  {}/{} chunks  {} of {}  updated {}  {}",
            identity.transfer_type,
            identity.bucket,
            identity.key,
            identity.local_path.display(),
            state.completed_count(),
            state.chunk_count(),
            format_bytes(state.bytes_transferred()),
            format_bytes(state.total_size),
            state.updated_at.format("%Y-%m-%d %H:%M:%S"),
            status
        );
    }
    Ok(())
}

/// Fingerprint of the transfer's source as it is now: the local file for
/// uploads, a HEAD of the object for downloads
async fn current_fingerprint(
    client: &S3Client,
    state: &TransferState,
) -> std::result::Result<SourceFingerprint, TransferError> {
    let identity = &state.identity;
    match identity.transfer_type {
        TransferType::Upload => SourceFingerprint::of_local_file(&identity.local_path).await,
        TransferType::Download => client
            .head_object(&identity.bucket, &identity.key)
            .await
            .map(|metadata| SourceFingerprint::of_object(&metadata)),
    }
}

fn resume_status(
    store: &TransferStateStore,
    state: &TransferState,
    current: Option<&SourceFingerprint>,
) -> &'static str {
    match current {
        None => "source unavailable",
        Some(fingerprint) if store.is_valid(state, fingerprint) => "resumable",
        Some(_) => "will restart",
    }
}

/// Single consumer that renders engine events on its own task
fn spawn_renderer(mut events: EventReceiver) -> Result<JoinHandle<()>> {
    let style = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {bytes}/{total_bytes} {bytes_per_sec} {msg}")?
        .progress_chars("=>-");

    Ok(tokio::spawn(async move {
        let pb = ProgressBar::new(0);
        pb.set_style(style);
        let mut tracker = ProgressTracker::new();

        while let Some(event) = events.recv().await {
            tracker.apply(&event);
            match &event {
                ProgressEvent::TransferStarted { total_bytes, .. } => {
                    pb.set_length(*total_bytes);
                }
                ProgressEvent::ChunkFailed {
                    index,
                    message,
                    attempt,
                    ..
                } => {
                    pb.println(format!("  chunk {} attempt {}: {}", index, attempt, message));
                }
                ProgressEvent::TransferFinished { success, .. } => {
                    pb.set_position(tracker.position());
                    if *success {
                        pb.finish_with_message("done");
                    } else {
                        pb.abandon();
                    }
                    continue;
                }
                _ => {}
            }
            pb.set_position(tracker.position().min(tracker.total_bytes()));
        }
    }))
}

fn report(summary: TransferSummary) -> Result<()> {
    if summary.is_cancelled() {
        println!(
            "Cancelled after {}/{} chunks; run again to resume",
            summary.chunks_completed, summary.chunks_total
        );
        return Ok(());
    }

    let summary = summary.into_result()?;
    println!(
        "  {} in {:.1}s ({}/s)",
        format_bytes(summary.bytes_transferred),
        summary.duration.as_secs_f64(),
        format_bytes(summary.throughput() as u64)
    );
    if let Some(etag) = &summary.etag {
        println!("  ETag: {}", etag);
    }
    Ok(())
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f64 = bytes as f64;
    let exponent = (bytes_f64.ln() / 1024_f64.ln()).floor() as usize;
    let exponent = exponent.min(UNITS.len() - 1);

    let value = bytes_f64 / 1024_f64.powi(exponent as i32);

    if exponent == 0 {
        format!("{} {}", bytes, UNITS[exponent])
    } else {
        format!("{:.2} {}", value, UNITS[exponent])
    }
}
