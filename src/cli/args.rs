use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::TransferConfig;
use crate::s3::PresignMethod;

/// s3xfer - chunked, parallel, resumable S3 transfers
#[derive(Parser, Debug)]
#[command(name = "s3xfer")]
#[command(version, about = "Chunked, parallel, resumable S3 transfers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path (environment variables are used when omitted)
    #[arg(long, global = true, env = "S3XFER_CONFIG")]
    pub config: Option<String>,

    /// Profile to use from config
    #[arg(long, global = true, env = "S3XFER_PROFILE")]
    pub profile: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Disable SSL certificate verification
    #[arg(long, global = true)]
    pub insecure: bool,

    /// Directory for resumable transfer state
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Chunk size (e.g. 8M, 64M, 1G)
    #[arg(long, global = true, value_parser = parse_size)]
    pub chunk_size: Option<u64>,

    /// Number of concurrent chunk workers
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Attempts per chunk before giving up
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Ignore saved state and start over
    #[arg(long, global = true)]
    pub no_resume: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Upload a local file as a multipart upload
    Upload {
        /// Local file
        source: PathBuf,

        /// Destination (s3://bucket/key)
        destination: String,
    },

    /// Download an object with parallel ranged GETs
    Download {
        /// Source (s3://bucket/key)
        source: String,

        /// Local file
        destination: PathBuf,
    },

    /// Print a presigned URL
    Presign {
        /// Object (s3://bucket/key)
        path: String,

        /// HTTP method the URL allows
        #[arg(long, value_enum, default_value = "get")]
        method: MethodArg,

        /// Lifetime in seconds (1 to 604800)
        #[arg(long, default_value = "3600")]
        expires: u64,
    },

    /// List transfers that can be resumed
    Pending,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MethodArg {
    Get,
    Put,
}

impl From<MethodArg> for PresignMethod {
    fn from(method: MethodArg) -> Self {
        match method {
            MethodArg::Get => PresignMethod::Get,
            MethodArg::Put => PresignMethod::Put,
        }
    }
}

impl Cli {
    /// Fold command-line overrides into the loaded transfer settings
    pub fn apply_overrides(&self, transfer: &mut TransferConfig) {
        if let Some(dir) = &self.state_dir {
            transfer.state_dir = dir.clone();
        }
        if let Some(size) = self.chunk_size {
            transfer.chunk_size = size;
        }
        if let Some(concurrency) = self.concurrency {
            transfer.upload_concurrency = concurrency;
            transfer.download_concurrency = concurrency;
        }
        if let Some(retries) = self.max_retries {
            transfer.max_retries = retries;
        }
    }
}

/// Parse a size with an optional K/M/G/T suffix (binary units)
pub fn parse_size(size_str: &str) -> Result<u64, String> {
    let size_str = size_str.trim().to_uppercase();
    let size_str = size_str.strip_suffix("IB").or_else(|| size_str.strip_suffix('B')).unwrap_or(&size_str);
    let (num_str, multiplier) = if let Some(n) = size_str.strip_suffix('K') {
        (n, 1024u64)
    } else if let Some(n) = size_str.strip_suffix('M') {
        (n, 1024u64 * 1024)
    } else if let Some(n) = size_str.strip_suffix('G') {
        (n, 1024u64 * 1024 * 1024)
    } else if let Some(n) = size_str.strip_suffix('T') {
        (n, 1024u64 * 1024 * 1024 * 1024)
    } else {
        (size_str, 1u64)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid size format: {}", size_str))?;
    if num == 0 {
        return Err("Size must be greater than zero".to_string());
    }
    num.checked_mul(multiplier)
        .ok_or_else(|| format!("Size too large: {}", size_str))
}

/// Parse an S3 object path into bucket and key
///
/// Accepts both URI-style `s3://bucket/key` and `s3/bucket/key`.
pub fn parse_s3_path(path: &str) -> anyhow::Result<(String, String)> {
    let path = path.trim();

    let stripped = if let Some(p) = path.strip_prefix("s3://") {
        p
    } else if let Some(p) = path.strip_prefix("s3/") {
        p
    } else {
        anyhow::bail!("Invalid S3 path format. Expected: s3://bucket/key");
    };

    let (bucket, key) = stripped.split_once('/').unwrap_or((stripped, ""));
    if bucket.is_empty() {
        anyhow::bail!("Bucket name cannot be empty");
    }
    if key.is_empty() {
        anyhow::bail!("Object key cannot be empty: {}", path);
    }

    Ok((bucket.to_string(), key.to_string()))
}
