//! filexfer gRPC Server
//!
//! Runs the upload and download services over one blob directory and one
//! metadata database.

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use filexfer_grpc::{ServerConfig, TransferServer};

/// filexfer gRPC Server - Authenticated chunked file upload and download
#[derive(Parser, Debug)]
#[command(name = "filexfer-grpc")]
#[command(about = "gRPC server for chunked file upload and download")]
struct Args {
    #[command(flatten)]
    config: ServerConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    tracing::debug!(config = ?args.config, "configuration loaded");

    TransferServer::new(args.config).run().await
}
