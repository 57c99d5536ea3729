//! In-memory object store with failure injection for engine tests

#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use s3xfer::error::{Result, TransferError};
use s3xfer::s3::transport::ProgressFn;
use s3xfer::s3::types::{
    CompleteMultipartUploadResponse, CompletedPart, CreateMultipartUploadResponse,
    ObjectMetadata, UploadPartResponse,
};
use s3xfer::transfer::{ObjectStore, UploadPartRequest};

/// How an injected failure manifests
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// 503 SlowDown
    Transport,
    /// 400 with an unexpected body
    Protocol,
    /// Wrong ETag (uploads) or truncated body (downloads)
    Corrupt,
}

impl Fault {
    fn error(self) -> TransferError {
        match self {
            Fault::Transport => TransferError::Transport {
                status: Some(503),
                message: "SlowDown: injected".to_string(),
            },
            Fault::Protocol => TransferError::Protocol {
                status: Some(400),
                code: "InvalidRequest".to_string(),
                message: "injected".to_string(),
            },
            Fault::Corrupt => unreachable!("corruption is applied to the payload"),
        }
    }
}

#[derive(Debug)]
struct MultipartUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, Bytes>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: HashMap<(String, String), Bytes>,
    uploads: HashMap<String, MultipartUpload>,
    /// Remaining injected failures keyed by part number (uploads) or chunk start (downloads)
    faults: HashMap<u64, (Fault, u32)>,
    delays: HashMap<u64, Duration>,
    cancel_after: Option<(usize, CancellationToken)>,
    part_attempts: Vec<u32>,
    range_requests: Vec<(u64, u64)>,
    completed_orders: Vec<Vec<u32>>,
    aborted: Vec<String>,
}

/// Thread-safe in-memory implementation of [`ObjectStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    next_upload: AtomicUsize,
    successes: AtomicUsize,
}

pub fn hex_md5(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.inner
            .lock()
            .unwrap()
            .objects
            .insert((bucket.to_string(), key.to_string()), data.into());
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Fail the next `times` calls for part number / chunk start `slot`
    pub fn inject(&self, slot: u64, fault: Fault, times: u32) {
        self.inner.lock().unwrap().faults.insert(slot, (fault, times));
    }

    pub fn delay(&self, slot: u64, delay: Duration) {
        self.inner.lock().unwrap().delays.insert(slot, delay);
    }

    /// Cancel `token` once `successes` part uploads or range reads have succeeded
    pub fn cancel_after(&self, successes: usize, token: CancellationToken) {
        self.inner.lock().unwrap().cancel_after = Some((successes, token));
    }

    pub fn part_attempts(&self) -> Vec<u32> {
        self.inner.lock().unwrap().part_attempts.clone()
    }

    pub fn range_requests(&self) -> Vec<(u64, u64)> {
        self.inner.lock().unwrap().range_requests.clone()
    }

    pub fn completed_orders(&self) -> Vec<Vec<u32>> {
        self.inner.lock().unwrap().completed_orders.clone()
    }

    pub fn aborted(&self) -> Vec<String> {
        self.inner.lock().unwrap().aborted.clone()
    }

    pub fn open_uploads(&self) -> usize {
        self.inner.lock().unwrap().uploads.len()
    }

    pub fn reset_logs(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.part_attempts.clear();
        inner.range_requests.clear();
    }

    /// Take one injected failure for `slot`, plus any configured delay
    fn take_fault(&self, slot: u64) -> (Option<Fault>, Option<Duration>) {
        let mut inner = self.inner.lock().unwrap();
        let delay = inner.delays.get(&slot).copied();
        let fault = match inner.faults.get_mut(&slot) {
            Some((fault, remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Some(*fault)
            }
            _ => None,
        };
        (fault, delay)
    }

    fn record_success(&self) {
        let count = self.successes.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = self.inner.lock().unwrap();
        if let Some((after, token)) = &inner.cancel_after {
            if count >= *after {
                token.cancel();
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        let data = self.object(bucket, key).ok_or_else(|| TransferError::Protocol {
            status: Some(404),
            code: "NoSuchKey".to_string(),
            message: format!("{}/{}", bucket, key),
        })?;
        let mut meta = ObjectMetadata::new(data.len() as u64);
        meta.etag = Some(hex_md5(&data));
        Ok(meta)
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<CreateMultipartUploadResponse> {
        let id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst));
        self.inner.lock().unwrap().uploads.insert(
            id.clone(),
            MultipartUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(CreateMultipartUploadResponse::new(
            bucket.to_string(),
            key.to_string(),
            id,
        ))
    }

    async fn upload_part(
        &self,
        request: UploadPartRequest<'_>,
        on_bytes: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<UploadPartResponse> {
        let part_number = request.part_number;
        self.inner.lock().unwrap().part_attempts.push(part_number);

        let (fault, delay) = self.take_fault(part_number as u64);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let expected_md5 =
            base64::engine::general_purpose::STANDARD.encode(md5::compute(&request.data).0);
        if expected_md5 != request.content_md5 {
            return Err(TransferError::Protocol {
                status: Some(400),
                code: "BadDigest".to_string(),
                message: "Content-MD5 mismatch".to_string(),
            });
        }

        let etag = match fault {
            Some(Fault::Corrupt) => "0".repeat(32),
            Some(other) => return Err(other.error()),
            None => hex_md5(&request.data),
        };

        {
            let mut inner = self.inner.lock().unwrap();
            let upload = inner.uploads.get_mut(request.upload_id).ok_or_else(|| {
                TransferError::Protocol {
                    status: Some(404),
                    code: "NoSuchUpload".to_string(),
                    message: request.upload_id.to_string(),
                }
            })?;
            upload.parts.insert(part_number, request.data.clone());
        }
        on_bytes(request.data.len() as u64);
        self.record_success();

        Ok(UploadPartResponse::new(part_number, etag))
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<CompleteMultipartUploadResponse> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .completed_orders
            .push(parts.iter().map(|p| p.part_number).collect());

        let upload = inner.uploads.remove(upload_id).ok_or_else(|| TransferError::Protocol {
            status: Some(404),
            code: "NoSuchUpload".to_string(),
            message: upload_id.to_string(),
        })?;
        assert_eq!(upload.bucket, bucket);
        assert_eq!(upload.key, key);

        let mut object = Vec::new();
        for part in parts {
            let data = upload.parts.get(&part.part_number).ok_or_else(|| {
                TransferError::Protocol {
                    status: Some(400),
                    code: "InvalidPart".to_string(),
                    message: part.part_number.to_string(),
                }
            })?;
            if part.etag != hex_md5(data) {
                return Err(TransferError::Protocol {
                    status: Some(400),
                    code: "InvalidPart".to_string(),
                    message: format!("etag mismatch for part {}", part.part_number),
                });
            }
            object.extend_from_slice(data);
        }

        let etag = format!("{}-{}", hex_md5(&object), parts.len());
        inner
            .objects
            .insert((bucket.to_string(), key.to_string()), Bytes::from(object));

        let mut response =
            CompleteMultipartUploadResponse::new(bucket.to_string(), key.to_string(), etag);
        response.location = Some(format!("memory://{}/{}", bucket, key));
        Ok(response)
    }

    async fn abort_multipart_upload(&self, _bucket: &str, _key: &str, upload_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.uploads.remove(upload_id);
        inner.aborted.push(upload_id.to_string());
        Ok(())
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end: u64,
        on_bytes: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        self.inner.lock().unwrap().range_requests.push((start, end));

        let (fault, delay) = self.take_fault(start);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let data = self.object(bucket, key).ok_or_else(|| TransferError::Protocol {
            status: Some(404),
            code: "NoSuchKey".to_string(),
            message: format!("{}/{}", bucket, key),
        })?;
        let mut slice = data.slice(start as usize..=end as usize);
        match fault {
            Some(Fault::Corrupt) => slice.truncate(slice.len() - 1),
            Some(other) => return Err(other.error()),
            None => {}
        }

        on_bytes(slice.len() as u64);
        self.record_success();
        Ok(slice)
    }
}

/// Deterministic, non-repeating test payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64).wrapping_mul(2_654_435_761) >> 13) as u8)
        .collect()
}
