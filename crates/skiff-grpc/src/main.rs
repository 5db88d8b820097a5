//! Skiff gRPC Gateway
//!
//! Serves file system and scheduler sessions over gRPC until interrupted,
//! then closes every session that is still open.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use skiff_grpc::{GatewayConfig, GatewayServer};

/// Skiff gRPC Gateway - Remote file systems and job schedulers over gRPC
#[derive(Parser, Debug)]
#[command(name = "skiff-grpc")]
#[command(about = "gRPC gateway exposing file systems and job schedulers")]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Chunk size for file reads, in bytes
    #[arg(long)]
    read_chunk_size: Option<usize>,

    /// Largest chunk of interactive job output per message, in bytes
    #[arg(long)]
    stream_chunk_size: Option<usize>,
}

impl Args {
    /// Configuration file values with command line overrides applied.
    fn into_config(self) -> anyhow::Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) => GatewayConfig::from_file(path)?,
            None => GatewayConfig::default(),
        };
        if let Some(addr) = self.addr {
            config.addr = addr;
        }
        if let Some(size) = self.read_chunk_size {
            config.read_chunk_size = size;
        }
        if let Some(size) = self.stream_chunk_size {
            config.stream_chunk_size = size;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = Args::parse().into_config()?;
    tracing::debug!(?config, "loaded configuration");

    let server = GatewayServer::new(config);
    server.run().await.context("gRPC server failed")?;

    Ok(())
}
