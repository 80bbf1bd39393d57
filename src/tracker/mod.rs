//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements communication with HTTP announce servers:
//! - Announce requests and responses
//! - Peer parsing (dict-form and compact)
//! - Peer ID generation and URL encoding helpers
//!
//! Used by the download session to discover peers for a torrent.
use crate::torrent::file::TorrentFile;
use rand::Rng;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("Tracker response is not valid bencode: {0}")]
    Response(#[from] serde_bencode::Error),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

// Represents a client communicating with a bittorrent tracker
#[derive(Debug)]
pub struct Client {
    peer_id: [u8; 20],
    port: u16,
}

// Contains the parameters for a tracker announce request
#[derive(Debug)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: i64,
    pub downloaded: i64,
    pub left: i64,
}

/// A peer address received from the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

/// The parsed response from a tracker.
#[derive(Debug)]
pub struct AnnounceResponse {
    pub interval: i64,
    pub peers: Vec<Peer>, // peers the client can connect to
}

#[derive(Debug, Deserialize)]
struct TrackerResponse {
    #[serde(default)]
    interval: i64,
    #[serde(default)]
    peers: Peers,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Peers {
    Compact(serde_bytes::ByteBuf),
    NonCompact(Vec<PeerDict>),
}

impl Default for Peers {
    fn default() -> Self {
        Peers::NonCompact(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

impl Client {
    /// The peer id is the process-wide 20-byte constant; it is passed in
    /// by whoever owns the process rather than generated here, so every
    /// request and handshake this process makes carries the same id.
    pub fn new(peer_id: [u8; 20], port: u16) -> Self {
        Self { peer_id, port }
    }

    /// Sends an announce request to the tracker to get a list of peers.
    #[tracing::instrument(skip(self, torrent), level = "debug")]
    pub async fn announce(&self, torrent: &TorrentFile) -> TrackerResult<AnnounceResponse> {
        let request = AnnounceRequest {
            info_hash: torrent.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: 0,
            downloaded: 0,
            left: torrent.total_length(),
        };

        // info_hash and peer_id are raw bytes; they go through our own
        // percent-encoding and the query is assembled by hand so the Url
        // machinery cannot re-encode the escapes.
        let mut url = url::Url::parse(&torrent.announce)?;
        let query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}",
            url_encode(&request.info_hash),
            url_encode(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
        );
        match url.query() {
            Some(existing) => {
                let merged = format!("{existing}&{query}");
                url.set_query(Some(&merged));
            }
            None => url.set_query(Some(&query)),
        }

        tracing::debug!(%url, "Making announce request to tracker");
        let response = reqwest::get(url).await?;
        let response_bytes = response.bytes().await?;
        Self::parse_announce_response(&response_bytes)
    }

    /// Parses the bencoded response body of an announce request.
    ///
    /// The core protocol needs the dict form of the `peers` field (a
    /// list of dictionaries with "ip" and "port"), but most trackers
    /// send the compact form unasked — a byte string where each peer is
    /// 6 bytes: a big-endian IPv4 address followed by a big-endian
    /// port. Both are accepted here.
    fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
        let tracker_response: TrackerResponse = serde_bencode::from_bytes(bytes)?;

        let peers = match tracker_response.peers {
            Peers::Compact(bytes) => bytes
                .chunks_exact(6)
                .map(|chunk| {
                    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                    Peer {
                        ip: IpAddr::V4(ip),
                        port,
                    }
                })
                .collect(),
            Peers::NonCompact(dicts) => dicts
                .into_iter()
                .filter_map(|dict| {
                    dict.ip.parse::<IpAddr>().ok().map(|ip| Peer {
                        ip,
                        port: dict.port,
                    })
                })
                .collect(),
        };

        Ok(AnnounceResponse {
            interval: tracker_response.interval,
            peers,
        })
    }
}

/// Generates a unique peer ID for this process.
///
/// The ID follows the Azureus-style convention: a fixed client prefix
/// ("-RL0001-", RL = Rust leecher) followed by random bytes. Call it
/// once at startup and pass the result through construction; the
/// protocol expects one stable id per process.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RL0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[prefix.len()..]);
    peer_id
}

/// URL-encodes a byte slice according to RFC 3986.
///
/// Unreserved characters (a-z, A-Z, 0-9, -, ., _, ~) are left as-is,
/// while all other bytes are encoded as %XX. This works on raw bytes,
/// which is what the info-hash and peer-id query parameters require.
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}
