//! s3xfer - chunked, parallel, resumable S3 transfers
//!
//! Multipart uploads and ranged downloads split into fixed-size chunks,
//! moved by a bounded worker pool, signed with AWS SigV4, and checkpointed
//! after every chunk so an interrupted transfer picks up where it stopped.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod s3;
pub mod transfer;

pub use config::Config;
pub use self::core::Core;
pub use error::{Result, TransferError};
pub use s3::{Credentials, S3Client};
pub use transfer::{
    DownloadEngine, EventQueue, ObjectStore, ProgressSink, RetryPolicy, TransferOptions,
    TransferState, TransferStateStore, TransferSummary, UploadEngine,
};
