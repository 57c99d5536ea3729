use anyhow::Result;
use clap::Parser;

use s3xfer::cli::{self, args::Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();

    cli::init_logging(&cli.log_level);

    // Chunk workers run in parallel, so use the multi-threaded scheduler
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(cli::run(cli))
}
