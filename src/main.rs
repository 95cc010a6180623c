use anyhow::Context as _;
use clap::Parser;
use riptide::{Config, Metainfo, Session};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// A command-line BitTorrent downloader.
#[derive(Parser, Debug)]
#[command(name = "riptide", version, about)]
struct Args {
    /// Path to the .torrent file.
    torrent: PathBuf,

    /// Directory the payload is written into.
    #[arg(default_value = ".")]
    output: PathBuf,

    /// Port reported to trackers.
    #[arg(long, default_value_t = riptide::config::DEFAULT_PORT)]
    port: u16,

    /// Maximum concurrently connected peers.
    #[arg(long, default_value_t = 50)]
    max_peers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let raw = std::fs::read(&args.torrent)
        .with_context(|| format!("reading {}", args.torrent.display()))?;
    let meta = Metainfo::from_bytes(&raw).context("parsing torrent file")?;

    tracing::info!(
        name = %meta.info.name,
        size = meta.info.total_length,
        pieces = meta.info.piece_count(),
        info_hash = %meta.info_hash,
        "loaded torrent"
    );

    let config = Config {
        port: args.port,
        max_peers: args.max_peers,
        ..Config::default()
    };

    let session = Session::new(&meta, args.output, config).context("opening session")?;
    session.run().await.context("download failed")?;

    tracing::info!("done");
    Ok(())
}
