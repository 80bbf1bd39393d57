//! Library root for rs-leech-client.
//!
//! Re-exports the core modules: bencode, torrent metainfo, tracker,
//! peer-wire protocol, and the download session.
pub mod bencode;
pub mod download;
pub mod peer;
pub mod torrent;
pub mod tracker;
