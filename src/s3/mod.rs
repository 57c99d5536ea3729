//! S3 protocol layer with AWS SigV4 signing
//!
//! This module provides:
//! - AWS Signature Version 4 header signing and presigned URLs
//! - A signed, streaming HTTP transport with cancellation and progress hooks
//! - Async multipart upload, HEAD and ranged GET operations
//! - Type-safe S3 response structures

pub mod client;
pub mod signer;
pub mod transport;
pub mod types;

pub use client::S3Client;
pub use signer::{Credentials, S3SignerV4};
pub use transport::{HttpTransport, ProgressFn, S3Request, S3Response};
pub use types::{
    CompleteMultipartUploadResponse, CompletedPart, CreateMultipartUploadResponse,
    ObjectMetadata, PresignMethod, PresignedUrl, UploadPartResponse,
};
