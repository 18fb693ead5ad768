//! CLI entry point
//!
//! `magnet-dl <MAGNET_URI>` downloads the magnet's largest file into
//! `./movies/`. Exits 0 on success, 1 on failure.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use magnet_dl::{ClientConfig, MagnetClient, MagnetLink};

#[derive(Debug, Parser)]
#[command(name = "magnet-dl", version, about = "Download the largest file of a magnet link")]
struct Args {
    /// Magnet URI of the torrent to download
    magnet: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let magnet = match MagnetLink::parse(&args.magnet) {
        Ok(magnet) => magnet,
        Err(e) => {
            tracing::error!(error = %e, "invalid magnet URI");
            return ExitCode::FAILURE;
        }
    };

    let client = match MagnetClient::new(ClientConfig::default()) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match client.download(&magnet).await {
        Ok(path) => {
            tracing::info!(path = %path.display(), "done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "download failed");
            ExitCode::FAILURE
        }
    }
}
