//! CLI module for s3xfer
//!
//! Thin host layer over the transfer engines.
//!
//! # Usage
//!
//! ```bash
//! # Upload (resumes automatically after an interruption)
//! s3xfer upload ./disk.img s3://bucket/images/disk.img --chunk-size 64M
//!
//! # Download with 8 parallel ranged GETs
//! s3xfer download s3://bucket/images/disk.img ./disk.img --concurrency 8
//!
//! # Presigned URL valid for one hour
//! s3xfer presign s3://bucket/images/disk.img --expires 3600
//!
//! # Transfers that can be resumed
//! s3xfer pending
//! ```

pub mod args;
pub mod commands;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config;
use crate::core::Core;
use args::{Cli, Commands};

/// Run a parsed command line to completion
pub async fn run(cli: Cli) -> Result<()> {
    let mut config = config::load_config(cli.config.as_deref(), cli.profile.as_deref())?;
    cli.apply_overrides(&mut config.transfer);
    if cli.insecure {
        for profile in config.profiles.values_mut() {
            profile.insecure_tls = true;
        }
    }

    let core = Core::new(config)?;
    let resume = !cli.no_resume;

    match cli.command {
        Commands::Upload {
            source,
            destination,
        } => {
            let cancel = cancel_on_ctrl_c();
            commands::cmd_upload(&core, &source, &destination, resume, cancel).await?;
        }
        Commands::Download {
            source,
            destination,
        } => {
            let cancel = cancel_on_ctrl_c();
            commands::cmd_download(&core, &source, &destination, resume, cancel).await?;
        }
        Commands::Presign {
            path,
            method,
            expires,
        } => {
            commands::cmd_presign(&core, &path, method.into(), expires)?;
        }
        Commands::Pending => {
            commands::cmd_pending(&core).await?;
        }
    }

    Ok(())
}

/// Token cancelled on the first Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing in-flight chunks");
            token.cancel();
        }
    });
    cancel
}

/// Initialize logging; RUST_LOG takes precedence over `level`
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
