//! Torrent file structure and parsing logic.
//!
//! This module defines the TorrentFile struct and related helpers for
//! parsing, validating, and working with single-file .torrent metadata.
use crate::bencode::BencodeValue;
use crate::torrent::info_hash;

use super::TorrentError;
use super::TorrentResult;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

#[derive(Debug, PartialEq, Clone)]
pub struct TorrentFile {
    pub announce: String,
    pub creation_date: Option<SystemTime>,
    pub comment: String,
    pub created_by: String,
    pub encoding: String,
    pub info: InfoDict,
    pub info_hash: [u8; 20],
    pub pieces_hash: Vec<[u8; 20]>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct InfoDict {
    pub piece_length: i64,
    pub pieces: Vec<u8>,
    pub private: bool,
    pub name: String,
    pub length: i64,
}

/**
Parses the concatenated SHA-1 hashes from the `pieces` string.

The `pieces` key within the `info` dictionary is a single byte string
that concatenates 20-byte SHA-1 hashes, one per piece, in piece-index
order. This breaks that blob into individual 20-byte arrays.
*/
#[tracing::instrument(level = "trace", skip(pieces_bytes))]
fn parse_pieces(pieces_bytes: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }

    Ok(pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

/**
Parses the info dictionary from the torrent file.

Required fields: `piece length`, `pieces`, `name`, `length` (this client
handles single-file torrents only). `private` is optional and defaults
to false.
*/
fn parse_info_dict(value: BencodeValue) -> TorrentResult<InfoDict> {
    let dict = match value {
        BencodeValue::Dict(d) => d,
        _ => {
            return Err(TorrentError::InvalidFormat(
                "Info is not a dictionary".to_string(),
            ));
        }
    };

    let piece_length = match dict.get(b"piece length".as_slice()) {
        Some(BencodeValue::Integer(i)) if *i > 0 => *i,
        _ => return Err(TorrentError::MissingField("piece length".to_string())),
    };

    let pieces = match dict.get(b"pieces".as_slice()) {
        Some(BencodeValue::String(s)) => s.clone(),
        _ => return Err(TorrentError::MissingField("pieces".to_string())),
    };

    let private = matches!(
        dict.get(b"private".as_slice()),
        Some(BencodeValue::Integer(1))
    );

    let name = match dict.get(b"name".as_slice()) {
        Some(BencodeValue::String(s)) => String::from_utf8(s.clone()).map_err(|e| {
            TorrentError::InvalidFormat(format!("Invalid name (not UTF-8): {}", e))
        })?,
        _ => return Err(TorrentError::MissingField("name".to_string())),
    };

    let length = match dict.get(b"length".as_slice()) {
        Some(BencodeValue::Integer(i)) if *i >= 0 => *i,
        _ => return Err(TorrentError::MissingField("length".to_string())),
    };

    Ok(InfoDict {
        piece_length,
        pieces,
        private,
        name,
        length,
    })
}

impl TorrentFile {
    /// Total content bytes described by the metainfo.
    pub fn total_length(&self) -> i64 {
        self.info.length
    }

    /// Number of pieces, derived from the 20-byte hashes in `pieces_hash`.
    pub fn num_pieces(&self) -> usize {
        self.pieces_hash.len()
    }

    /**
    Returns the byte size of a specific piece.

    All pieces except the last one are `piece_length` long. The last
    piece carries the remainder of the content, and when the total
    length is an exact multiple of the piece length it is a full piece,
    not an empty one.
    */
    pub fn piece_size(&self, index: usize) -> i64 {
        if index >= self.num_pieces() {
            return 0;
        }
        if index < self.num_pieces() - 1 {
            return self.info.piece_length;
        }
        let remainder = self.total_length() % self.info.piece_length;
        if remainder == 0 {
            self.info.piece_length
        } else {
            remainder
        }
    }

    /**
    Parses decoded torrent-file data into a `TorrentFile`.

    Extracts `announce` and `info` (both required) plus the optional
    creation metadata, then calculates the info hash over the canonical
    re-encoding of `info` and splits `pieces` into the per-piece hash
    array.
    */
    #[tracing::instrument(level = "debug", skip(data))]
    pub fn parse(data: BencodeValue) -> TorrentResult<TorrentFile> {
        let mut dict = match data {
            BencodeValue::Dict(d) => d,
            _ => {
                return Err(TorrentError::InvalidFormat(
                    "Root is not a dictionary".to_string(),
                ));
            }
        };

        let announce = match dict.remove(b"announce".as_slice()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s).map_err(|e| {
                TorrentError::InvalidFormat(format!("Invalid announce URL (not UTF-8): {}", e))
            })?,
            _ => return Err(TorrentError::MissingField("announce".to_string())),
        };

        let info_dict_value = dict
            .remove(b"info".as_slice())
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;

        let info_dict_map = match &info_dict_value {
            BencodeValue::Dict(d) => d.clone(),
            _ => {
                return Err(TorrentError::InvalidFormat(
                    "info is not a dict".to_string(),
                ));
            }
        };

        let info = parse_info_dict(info_dict_value)?;

        let creation_date = match dict.remove(b"creation date".as_slice()) {
            Some(BencodeValue::Integer(timestamp)) => {
                let secs = timestamp
                    .try_into()
                    .map_err(|_| TorrentError::DateParseError)?;
                Some(UNIX_EPOCH + std::time::Duration::from_secs(secs))
            }
            Some(_) => {
                return Err(TorrentError::InvalidFormat(
                    "Creation date not an integer".to_string(),
                ));
            }
            None => None,
        };

        let comment = match dict.remove(b"comment".as_slice()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };
        let created_by = match dict.remove(b"created by".as_slice()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };
        let encoding = match dict.remove(b"encoding".as_slice()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };

        let info_hash = info_hash::calculate_info_hash(&info_dict_map)?;
        let pieces_hash = parse_pieces(&info.pieces)?;

        Ok(TorrentFile {
            announce,
            creation_date,
            comment,
            created_by,
            encoding,
            info,
            info_hash,
            pieces_hash,
        })
    }
}
