//! Remote operations consumed by the transfer engines

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::s3::transport::ProgressFn;
use crate::s3::types::{
    CompleteMultipartUploadResponse, CompletedPart, CreateMultipartUploadResponse,
    ObjectMetadata, UploadPartResponse,
};

/// One UploadPart call
#[derive(Debug, Clone)]
pub struct UploadPartRequest<'a> {
    pub bucket: &'a str,
    pub key: &'a str,
    pub upload_id: &'a str,
    /// 1-based part number
    pub part_number: u32,
    pub data: Bytes,
    /// Base64 MD5 of `data`
    pub content_md5: &'a str,
}

/// The subset of an S3-compatible store the engines need
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata>;

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<CreateMultipartUploadResponse>;

    async fn upload_part(
        &self,
        request: UploadPartRequest<'_>,
        on_bytes: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<UploadPartResponse>;

    /// `parts` are sorted ascending by part number
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<CompleteMultipartUploadResponse>;

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()>;

    /// Bytes of the inclusive range `[start, end]`
    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end: u64,
        on_bytes: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<Bytes>;
}
