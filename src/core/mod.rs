use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::Config;
use crate::s3::{Credentials, S3Client};
use crate::transfer::{DownloadEngine, ObjectStore, ProgressSink, TransferStateStore, UploadEngine};

/// Wiring from configuration to the transfer engines
///
/// The S3Client is created once and shared. Clones share the same underlying
/// HTTP connection pool, so every engine built from one `Core` reuses
/// connections.
#[derive(Clone)]
pub struct Core {
    pub config: Arc<Config>,
    /// Shared S3 client - clones share the same HTTP connection pool
    client: S3Client,
    states: Arc<TransferStateStore>,
}

impl Core {
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let profile = config
            .get_profile(None)
            .ok_or_else(|| anyhow::anyhow!("No profile found in configuration"))?;

        let transfer = &config.transfer;
        let client = S3Client::new(
            &profile.endpoint,
            Credentials::new(profile.access_key.clone(), profile.secret_key.clone()),
            Some(profile.region.clone()),
            profile.insecure_tls,
        )
        .context("Failed to create S3 client")?
        .with_timeout(transfer.request_timeout())
        .with_progress_interval(transfer.progress_interval_bytes);

        let states = Arc::new(TransferStateStore::new(
            transfer.state_dir.clone(),
            transfer.max_state_age(),
        ));

        tracing::debug!(
            endpoint = %profile.endpoint,
            region = %profile.region,
            state_dir = %transfer.state_dir.display(),
            "core_initialized"
        );

        Ok(Self {
            config,
            client,
            states,
        })
    }

    /// Get a clone of the shared S3 client (shares connection pool)
    pub fn s3_client(&self) -> S3Client {
        self.client.clone()
    }

    pub fn state_store(&self) -> Arc<TransferStateStore> {
        self.states.clone()
    }

    fn object_store(&self) -> Arc<dyn ObjectStore> {
        Arc::new(self.client.clone())
    }

    pub fn upload_engine(&self, sink: Arc<dyn ProgressSink>) -> UploadEngine {
        UploadEngine::new(
            self.object_store(),
            self.states.clone(),
            self.config.transfer.upload_options(),
            sink,
        )
    }

    pub fn download_engine(&self, sink: Arc<dyn ProgressSink>) -> DownloadEngine {
        DownloadEngine::new(
            self.object_store(),
            self.states.clone(),
            self.config.transfer.download_options(),
            sink,
        )
    }
}
