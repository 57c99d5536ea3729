//! S3 types and response structures

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Multipart protocols require every part except the last to be at least 5 MiB
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Upper bound on part numbers in a single multipart upload
pub const MAX_PARTS: u64 = 10_000;

/// Object metadata returned by a HEAD request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Object size in bytes
    pub content_length: u64,
    /// ETag without surrounding quotes
    pub etag: Option<String>,
    /// Raw Last-Modified header value
    pub last_modified: Option<String>,
    /// Version ID when the bucket is versioned
    pub version_id: Option<String>,
}

impl ObjectMetadata {
    pub fn new(content_length: u64) -> Self {
        Self {
            content_length,
            etag: None,
            last_modified: None,
            version_id: None,
        }
    }

    /// Remote fingerprint token: the ETag, or Last-Modified when the store sends no ETag
    pub fn fingerprint_tag(&self) -> String {
        self.etag
            .clone()
            .or_else(|| self.last_modified.clone())
            .unwrap_or_default()
    }
}

/// Response from CreateMultipartUpload operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMultipartUploadResponse {
    pub bucket: String,
    pub key: String,
    /// Upload ID for subsequent UploadPart and CompleteMultipartUpload requests
    pub upload_id: String,
}

impl CreateMultipartUploadResponse {
    pub fn new(bucket: String, key: String, upload_id: String) -> Self {
        Self { bucket, key, upload_id }
    }
}

/// Response from UploadPart operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPartResponse {
    pub part_number: u32,
    /// ETag of the uploaded part (required for CompleteMultipartUpload)
    pub etag: String,
}

impl UploadPartResponse {
    pub fn new(part_number: u32, etag: String) -> Self {
        Self { part_number, etag }
    }
}

/// Part information for CompleteMultipartUpload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    /// Part number (1-10000), chunk index + 1
    pub part_number: u32,
    /// ETag returned from UploadPart
    pub etag: String,
    /// Part size in bytes
    pub size: u64,
}

impl CompletedPart {
    pub fn new(part_number: u32, etag: String, size: u64) -> Self {
        Self { part_number, etag, size }
    }
}

/// Response from CompleteMultipartUpload operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompleteMultipartUploadResponse {
    /// Location URL of the completed object
    pub location: Option<String>,
    pub bucket: String,
    pub key: String,
    /// ETag of the completed object
    pub etag: String,
    /// Version ID when the bucket is versioned
    pub version_id: Option<String>,
}

impl CompleteMultipartUploadResponse {
    pub fn new(bucket: String, key: String, etag: String) -> Self {
        Self {
            location: None,
            bucket,
            key,
            etag,
            version_id: None,
        }
    }
}

/// S3 error document (`<Error><Code/><Message/></Error>`)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S3ErrorBody {
    pub code: String,
    pub message: String,
    pub request_id: Option<String>,
}

/// HTTP method allowed in a presigned URL
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PresignMethod {
    Get,
    Put,
}

impl PresignMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresignMethod::Get => "GET",
            PresignMethod::Put => "PUT",
        }
    }
}

/// A time-limited, pre-authenticated URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresignedUrl {
    pub url: String,
    pub method: PresignMethod,
    /// Lifetime from the moment of signing
    pub expires_in: Duration,
}

/// Pick an upload part size: at least the caller's value, never below the
/// 5 MiB floor, and large enough that `total_size` fits in 10,000 parts.
pub fn upload_part_size(total_size: u64, requested: u64) -> u64 {
    let floor = requested.max(MIN_PART_SIZE);
    let needed = total_size.div_ceil(MAX_PARTS);
    floor.max(needed)
}
