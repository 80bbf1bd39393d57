use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use rs_leech_client::bencode::decoder;
use rs_leech_client::download::{DownloadSession, ProgressSink};
use rs_leech_client::torrent::file::TorrentFile;
use rs_leech_client::tracker;

/// Leecher-side BitTorrent client: downloads a single-file torrent and
/// writes each verified piece to its own piece file.
#[derive(Debug, Parser)]
#[command(name = "rslc", version, about)]
struct Args {
    /// Path to the .torrent metainfo file
    torrent: PathBuf,

    /// Root directory; the torrent_<info_hash>/ directory is created
    /// (or resumed) inside it
    #[arg(short, long, default_value = "./downloads")]
    output: PathBuf,

    /// Port advertised to the tracker
    #[arg(short, long, default_value_t = 6881)]
    port: u16,
}

/// Progress events become log lines.
struct LogProgress;

impl ProgressSink for LogProgress {
    fn peers_connected(&mut self, connected: usize, advertised: usize) {
        tracing::info!(connected, advertised, "connected to peers");
    }

    fn piece_completed(&mut self, done: usize, total: usize, percent: f64) {
        tracing::info!("Got {done} / {total} pieces. {percent:.1}% complete");
    }

    fn peer_disconnected(&mut self, addr: SocketAddr, total_disconnects: usize) {
        tracing::warn!(%addr, total_disconnects, "peer disconnected");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let data = std::fs::read(&args.torrent)
        .with_context(|| format!("reading {}", args.torrent.display()))?;
    let (value, _) = decoder::decode(&data).context("decoding torrent file")?;
    let torrent = TorrentFile::parse(value).context("parsing metainfo")?;
    tracing::info!(
        name = %torrent.info.name,
        pieces = torrent.num_pieces(),
        total_bytes = torrent.total_length(),
        "loaded torrent"
    );

    let peer_id = tracker::generate_peer_id();
    let mut session = DownloadSession::new(
        torrent,
        peer_id,
        args.output,
        args.port,
        Box::new(LogProgress),
    );
    session.run().await?;

    let (done, total) = session.progress_counts();
    tracing::info!(
        done,
        total,
        directory = %session.output_directory().display(),
        "all pieces downloaded and verified"
    );
    Ok(())
}
