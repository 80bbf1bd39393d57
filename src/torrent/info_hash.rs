use crate::bencode::encoder;
use crate::bencode::BencodeValue;
use crate::torrent::TorrentResult;
use sha1::Digest;
use sha1::Sha1;
use std::collections::BTreeMap;

/// Calculates the SHA-1 hash of a bencode-encoded info dictionary.
///
/// This is the 20-byte identifier that binds tracker requests and peer
/// handshakes to one torrent. It only works because the encoder is
/// canonical: the `BTreeMap` emits keys in ascending byte order, so
/// re-encoding the decoded `info` dict reproduces the exact bytes the
/// torrent's author hashed.
pub fn calculate_info_hash(
    info_dict: &BTreeMap<Vec<u8>, BencodeValue>,
) -> TorrentResult<[u8; 20]> {
    let buffer = encoder::encode_to_bytes(&BencodeValue::Dict(info_dict.clone()))?;

    let mut hasher = Sha1::new();
    hasher.update(&buffer);

    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&hasher.finalize());
    Ok(info_hash)
}
