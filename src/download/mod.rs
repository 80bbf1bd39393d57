//! The download session: one event loop multiplexing every peer engine.
//!
//! The session owns all engines. A single cooperative loop waits for any
//! socket to become readable, lets that engine pull bytes and advance its
//! state machine, then inspects it: disconnects are reaped (their
//! in-flight piece returns to the pool), completed pieces are SHA-1
//! verified and written out, and idle engines are handed new work. When
//! the number of idle engines reaches the number of unassigned pieces
//! the session enters the end game and races the remaining pieces across
//! every idle, unchoked peer.
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;

use futures::future::{join_all, select_all};
use rand::seq::IteratorRandom;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::peer::engine::PeerEngine;
use crate::torrent::file::TorrentFile;
use crate::tracker::{Client, TrackerError};

const PIECE_FILE_SUFFIX: &str = "torrent_piece";

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tracker failure: {0}")]
    Tracker(#[from] TrackerError),

    #[error("No peers connected")]
    NoPeersConnected,

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

pub type DownloadResult<T> = std::result::Result<T, DownloadError>;

/// Receiver for user-visible progress events. The session reports;
/// whoever constructed it decides whether that means a log line, a
/// database row, or nothing. All methods default to no-ops.
pub trait ProgressSink {
    fn peers_connected(&mut self, _connected: usize, _advertised: usize) {}
    fn piece_completed(&mut self, _done: usize, _total: usize, _percent: f64) {}
    fn peer_disconnected(&mut self, _addr: SocketAddr, _total_disconnects: usize) {}
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {}

pub struct DownloadSession {
    torrent: TorrentFile,
    peer_id: [u8; 20],
    port: u16,
    output_directory: PathBuf,
    pieces_to_download: HashSet<usize>,
    completed_pieces: HashSet<usize>,
    engines: HashMap<u64, PeerEngine>,
    next_engine_id: u64,
    num_disconnects: usize,
    hash_mismatches: usize,
    progress: Box<dyn ProgressSink>,
}

impl DownloadSession {
    /// `output_root` is the configured download root; the session works
    /// inside `<output_root>/torrent_<info_hash_hex>/`. The peer id is
    /// the process-wide constant, passed through construction.
    pub fn new(
        torrent: TorrentFile,
        peer_id: [u8; 20],
        output_root: impl Into<PathBuf>,
        port: u16,
        progress: Box<dyn ProgressSink>,
    ) -> Self {
        let output_directory = output_root
            .into()
            .join(format!("torrent_{}", hex::encode(torrent.info_hash)));
        let pieces_to_download = (0..torrent.num_pieces()).collect();

        Self {
            torrent,
            peer_id,
            port,
            output_directory,
            pieces_to_download,
            completed_pieces: HashSet::new(),
            engines: HashMap::new(),
            next_engine_id: 0,
            num_disconnects: 0,
            hash_mismatches: 0,
            progress,
        }
    }

    pub fn output_directory(&self) -> &std::path::Path {
        &self.output_directory
    }

    /// (pieces done, pieces total)
    pub fn progress_counts(&self) -> (usize, usize) {
        (self.completed_pieces.len(), self.torrent.num_pieces())
    }

    pub fn num_disconnects(&self) -> usize {
        self.num_disconnects
    }

    pub fn hash_mismatches(&self) -> usize {
        self.hash_mismatches
    }

    /// Downloads the whole torrent: announce, connect, then drive the
    /// event loop until every piece is verified on disk.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn run(&mut self) -> DownloadResult<()> {
        self.setup_output_directory().await?;
        if self.pieces_to_download.is_empty() {
            info!("all pieces already on disk, nothing to do");
            return Ok(());
        }

        let client = Client::new(self.peer_id, self.port);
        let response = client.announce(&self.torrent).await?;
        let addrs: Vec<SocketAddr> = response
            .peers
            .iter()
            .map(|peer| SocketAddr::new(peer.ip, peer.port))
            .collect();
        info!(peers = addrs.len(), interval = response.interval, "tracker answered");

        self.download_from(&addrs).await
    }

    /// Like [`run`](Self::run) but with a caller-supplied peer list
    /// instead of a tracker round trip.
    pub async fn run_with_peers(&mut self, addrs: &[SocketAddr]) -> DownloadResult<()> {
        self.setup_output_directory().await?;
        if self.pieces_to_download.is_empty() {
            return Ok(());
        }
        self.download_from(addrs).await
    }

    async fn download_from(&mut self, addrs: &[SocketAddr]) -> DownloadResult<()> {
        self.connect_peers(addrs).await;
        self.progress.peers_connected(self.engines.len(), addrs.len());
        if self.engines.is_empty() {
            return Err(DownloadError::NoPeersConnected);
        }
        self.drive().await
    }

    /// Creates the output directory, or resumes from it: any piece file
    /// already present is trusted and its index skipped.
    async fn setup_output_directory(&mut self) -> DownloadResult<()> {
        if fs::try_exists(&self.output_directory).await? {
            let mut entries = fs::read_dir(&self.output_directory).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(index) = parse_piece_index(&name.to_string_lossy()) else {
                    continue;
                };
                if self.pieces_to_download.remove(&index) {
                    self.completed_pieces.insert(index);
                }
            }
            info!(
                directory = %self.output_directory.display(),
                resumed = self.completed_pieces.len(),
                "resuming existing download"
            );
        } else {
            fs::create_dir_all(&self.output_directory).await?;
            info!(directory = %self.output_directory.display(), "starting new download");
        }
        Ok(())
    }

    /// Connects every address concurrently; peers that cannot be reached
    /// within the connect timeout are dropped here and never become
    /// engines.
    async fn connect_peers(&mut self, addrs: &[SocketAddr]) {
        let connects = addrs
            .iter()
            .map(|&addr| PeerEngine::connect(addr, self.torrent.info_hash, self.peer_id));
        for (addr, result) in addrs.iter().zip(join_all(connects).await) {
            match result {
                Ok(engine) => {
                    self.engines.insert(self.next_engine_id, engine);
                    self.next_engine_id += 1;
                }
                Err(e) => debug!(%addr, error = %e, "could not connect"),
            }
        }
        info!(connected = self.engines.len(), "initialized peer connections");
    }

    /// The main loop: block until some engine's socket is readable, let
    /// it make progress, then inspect it for disconnection, completion,
    /// and new work.
    async fn drive(&mut self) -> DownloadResult<()> {
        while self.completed_pieces.len() < self.torrent.num_pieces() {
            if self.engines.is_empty() {
                warn!("every peer disconnected with pieces outstanding");
                return Err(DownloadError::NoPeersConnected);
            }

            let (id, readiness) = self.next_ready().await;
            if let Some(engine) = self.engines.get_mut(&id) {
                match readiness {
                    Ok(()) => {
                        let _ = engine.read_from_socket();
                        if let Err(e) = engine.advance().await {
                            debug!(addr = %engine.addr(), error = %e, "peer error");
                        }
                    }
                    Err(e) => {
                        warn!(addr = %engine.addr(), error = %e, "socket readiness error");
                        engine.shutdown().await;
                    }
                }
            }
            self.inspect(id).await?;
            debug_assert!(self.every_piece_accounted_for());
        }

        info!("download complete");
        for engine in self.engines.values_mut() {
            engine.shutdown().await;
        }
        self.engines.clear();
        Ok(())
    }

    /// Waits until at least one engine socket is readable and reports
    /// which. Level-triggered: engines left ready are returned by the
    /// next call immediately.
    async fn next_ready(&self) -> (u64, std::io::Result<()>) {
        let waits: Vec<_> = self
            .engines
            .iter()
            .map(|(&id, engine)| Box::pin(async move { (id, engine.readable().await) }))
            .collect();
        let ((id, result), _, _) = select_all(waits).await;
        (id, result)
    }

    /// Post-dispatch bookkeeping for one engine, then the
    /// piece-assignment phase.
    async fn inspect(&mut self, id: u64) -> DownloadResult<()> {
        if self.engines.get(&id).is_some_and(PeerEngine::is_disconnected) {
            if let Some(engine) = self.engines.remove(&id) {
                self.num_disconnects += 1;
                if let Some(piece) = engine.current_piece() {
                    let piece = piece as usize;
                    if !self.completed_pieces.contains(&piece) {
                        self.pieces_to_download.insert(piece);
                    }
                }
                debug!(
                    addr = %engine.addr(),
                    disconnects = self.num_disconnects,
                    "removed disconnected peer"
                );
                self.progress
                    .peer_disconnected(engine.addr(), self.num_disconnects);
            }
        } else if let Some((piece_index, bytes)) = self
            .engines
            .get_mut(&id)
            .and_then(PeerEngine::take_completed_piece)
        {
            self.finish_piece(piece_index as usize, bytes).await?;
        }

        self.assign_pieces(id).await
    }

    /// Verifies a fully assembled piece and writes it out, or returns
    /// its index to the pool on a hash mismatch.
    async fn finish_piece(&mut self, piece_index: usize, bytes: Vec<u8>) -> DownloadResult<()> {
        let expected = self
            .torrent
            .pieces_hash
            .get(piece_index)
            .copied()
            .ok_or_else(|| {
                DownloadError::InvariantViolation(format!(
                    "completed piece index {piece_index} out of range"
                ))
            })?;

        let mut hasher = Sha1::new();
        hasher.update(&bytes);
        let actual: [u8; 20] = hasher.finalize().into();

        if actual != expected {
            warn!(piece_index, "hash mismatch, returning piece to pool");
            self.hash_mismatches += 1;
            self.pieces_to_download.insert(piece_index);
            return Ok(());
        }

        // first verified copy wins; a racing duplicate changes nothing
        if !self.completed_pieces.insert(piece_index) {
            return Ok(());
        }
        self.pieces_to_download.remove(&piece_index);
        self.write_piece_file(piece_index, &bytes).await?;

        if self.in_end_game() {
            // best effort: tell everyone still racing this piece to stop
            for engine in self.engines.values_mut() {
                if engine.is_downloading() && engine.current_piece() == Some(piece_index as u32) {
                    let _ = engine.cancel_piece().await;
                }
            }
        }

        let (done, total) = self.progress_counts();
        let percent = done as f64 / total as f64 * 100.0;
        info!(piece_index, done, total, "piece verified");
        self.progress.piece_completed(done, total, percent);
        Ok(())
    }

    /// Every piece index is completed, unassigned, or in flight on some
    /// live engine. Checked at each iteration boundary under test
    /// builds; a piece escaping all three sets would stall the download.
    fn every_piece_accounted_for(&self) -> bool {
        let in_flight: HashSet<usize> = self
            .engines
            .values()
            .filter_map(PeerEngine::current_piece)
            .map(|piece| piece as usize)
            .collect();
        (0..self.torrent.num_pieces()).all(|piece| {
            self.completed_pieces.contains(&piece)
                || self.pieces_to_download.contains(&piece)
                || in_flight.contains(&piece)
        })
    }

    /// `idle engines >= unassigned pieces` is the end-game trigger.
    fn in_end_game(&self) -> bool {
        let idle = self.engines.values().filter(|e| e.is_idle()).count();
        idle >= self.pieces_to_download.len()
    }

    /// The piece-assignment phase. Outside the end game only the engine
    /// that just made progress is considered; inside it, one piece is
    /// raced across every idle, unchoked peer that has it.
    async fn assign_pieces(&mut self, id: u64) -> DownloadResult<()> {
        if self.completed_pieces.len() >= self.torrent.num_pieces() {
            return Ok(());
        }

        if self.in_end_game() {
            let target = self
                .pieces_to_download
                .iter()
                .copied()
                .next()
                .or_else(|| {
                    // pool is empty: race a piece someone is already
                    // downloading, in case its current owner stays
                    // choked forever
                    self.engines
                        .values()
                        .find(|e| e.is_downloading())
                        .and_then(PeerEngine::current_piece)
                        .map(|piece| piece as usize)
                });
            let Some(piece) = target else {
                return Ok(());
            };

            let size = self.torrent.piece_size(piece) as usize;
            let racers: Vec<u64> = self
                .engines
                .iter()
                .filter(|(_, e)| e.is_idle() && !e.choked_by_remote() && e.has_piece(piece))
                .map(|(&engine_id, _)| engine_id)
                .collect();

            let mut assigned = false;
            for engine_id in racers {
                if let Some(engine) = self.engines.get_mut(&engine_id) {
                    if engine.start_piece(piece as u32, size).await.is_ok() {
                        assigned = true;
                    }
                }
            }
            if assigned {
                self.pieces_to_download.remove(&piece);
            }
            return Ok(());
        }

        if !self.engines.get(&id).is_some_and(PeerEngine::is_idle)
            || self.pieces_to_download.is_empty()
        {
            return Ok(());
        }

        // random member is the tie-break
        let Some(piece) = self
            .pieces_to_download
            .iter()
            .copied()
            .choose(&mut rand::rng())
        else {
            return Ok(());
        };
        self.pieces_to_download.remove(&piece);
        let size = self.torrent.piece_size(piece) as usize;

        let Some(engine) = self.engines.get_mut(&id) else {
            return Ok(());
        };
        if engine.has_piece(piece) {
            if engine.start_piece(piece as u32, size).await.is_err() {
                self.pieces_to_download.insert(piece);
            }
        } else {
            // leave the engine idle; some other peer will want this one
            self.pieces_to_download.insert(piece);
        }
        Ok(())
    }

    /// Writes one verified piece to
    /// `<output_dir>/<info_hash_hex>_piece_<index>.torrent_piece`.
    /// An existing file is never rewritten.
    async fn write_piece_file(&self, piece_index: usize, bytes: &[u8]) -> DownloadResult<()> {
        let file_name = format!(
            "{}_piece_{}.{}",
            hex::encode(self.torrent.info_hash),
            piece_index,
            PIECE_FILE_SUFFIX
        );
        let path = self.output_directory.join(file_name);

        if fs::try_exists(&path).await? {
            warn!(path = %path.display(), "piece file already exists, not rewriting");
            return Ok(());
        }
        fs::write(&path, bytes).await?;
        Ok(())
    }

    /// Pauses every engine: inbound messages keep flowing, but no new
    /// block requests go out until [`resume_all`](Self::resume_all).
    pub fn pause_all(&mut self) {
        for engine in self.engines.values_mut() {
            engine.pause();
        }
    }

    pub fn resume_all(&mut self) {
        for engine in self.engines.values_mut() {
            engine.resume();
        }
    }
}

/// Extracts the piece index from a piece file name of the form
/// `<info_hash_hex>_piece_<index>.torrent_piece`.
fn parse_piece_index(file_name: &str) -> Option<usize> {
    let stem = file_name.strip_suffix(PIECE_FILE_SUFFIX)?.strip_suffix('.')?;
    let (_, index) = stem.rsplit_once("_piece_")?;
    index.parse().ok()
}
