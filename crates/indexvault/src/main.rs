#![warn(missing_docs)]
//! indexvault command line: snapshot and restore encrypted search indexes

use anyhow::Result;
use clap::Parser;
use indexvault::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Reports go to stdout, so logs stay on stderr.
    if cli.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(EnvFilter::from_default_env())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(EnvFilter::from_default_env())
            .init();
    }

    tracing::debug!("ivault starting");
    cli.run().await
}
