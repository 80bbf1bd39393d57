//! The BitTorrent peer handshake.
//!
//! The handshake is the first message exchanged between two peers. It
//! verifies that both peers are participating in the same torrent (via
//! the info hash) and establishes basic protocol compatibility. Unlike
//! the regular message stream it has no length prefix: it is a fixed
//! 68-byte frame parsed on a dedicated path.
use super::PeerError;
use super::PeerResult;
use tracing::instrument;

pub const HANDSHAKE_LENGTH: usize = 68;

const PROTOCOL_NAME: &[u8; 19] = b"BitTorrent protocol";

/** Represents a BitTorrent handshake message as defined in the BitTorrent protocol.

A handshake contains:
- Protocol identifier ("BitTorrent protocol")
- Reserved bytes for protocol extensions (ignored on receive)
- Info hash identifying the torrent
- Peer ID identifying the remote client */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_len: u8,
    pub protocol: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            protocol_len: 19,
            protocol: *PROTOCOL_NAME,
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /** Serializes the handshake into a 68-byte array.

    The serialized format is:
    - 1 byte: protocol string length (19)
    - 19 bytes: protocol string ("BitTorrent protocol")
    - 8 bytes: reserved bytes
    - 20 bytes: info hash
    - 20 bytes: peer ID */
    #[instrument(level = "trace")]
    pub fn serialize(&self) -> [u8; HANDSHAKE_LENGTH] {
        let mut buf = [0u8; HANDSHAKE_LENGTH];
        buf[0] = self.protocol_len;
        buf[1..20].copy_from_slice(&self.protocol);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Deserializes a handshake from exactly 68 buffered bytes.
    ///
    /// The engine reads these off its ring buffer once enough inbound
    /// data has accumulated; there is no partial-parse state to keep.
    ///
    /// # Errors
    /// * `MalformedHandshake` - wrong byte count or name length
    /// * `HandshakeInvalidProtocol` - protocol string mismatch
    pub fn deserialize(bytes: &[u8]) -> PeerResult<Self> {
        if bytes.len() != HANDSHAKE_LENGTH {
            return Err(PeerError::MalformedHandshake(format!(
                "expected {} bytes, got {}",
                HANDSHAKE_LENGTH,
                bytes.len()
            )));
        }

        let protocol_len = bytes[0];
        if protocol_len != 19 {
            return Err(PeerError::MalformedHandshake(format!(
                "invalid protocol length: {}",
                protocol_len
            )));
        }

        let mut protocol = [0u8; 19];
        protocol.copy_from_slice(&bytes[1..20]);
        if &protocol != PROTOCOL_NAME {
            return Err(PeerError::HandshakeInvalidProtocol);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&bytes[48..68]);

        Ok(Self {
            protocol_len,
            protocol,
            reserved,
            info_hash,
            peer_id,
        })
    }

    /** Validates that this handshake's info hash matches the expected value.

    The remote peer answering for a different torrent is the one
    handshake failure the protocol string cannot catch. */
    pub fn validate(&self, expected_info_hash: [u8; 20]) -> PeerResult<()> {
        if self.info_hash != expected_info_hash {
            return Err(PeerError::HandshakeInfoHashMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_is_68_bytes_with_expected_layout() {
        let handshake = Handshake::new([0x11; 20], [0x22; 20]);
        let bytes = handshake.serialize();

        assert_eq!(bytes.len(), HANDSHAKE_LENGTH);
        assert_eq!(bytes[0], 0x13);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[0x11; 20]);
        assert_eq!(&bytes[48..68], &[0x22; 20]);
    }

    #[test]
    fn deserialize_of_serialize_is_identity() {
        let handshake = Handshake::new([0x11; 20], [0x22; 20]);
        let parsed = Handshake::deserialize(&handshake.serialize()).unwrap();
        assert_eq!(parsed, handshake);
    }

    #[test]
    fn rejects_short_input() {
        assert!(matches!(
            Handshake::deserialize(&[0u8; 67]),
            Err(PeerError::MalformedHandshake(_))
        ));
    }

    #[test]
    fn rejects_wrong_protocol_name() {
        let mut bytes = Handshake::new([0u8; 20], [0u8; 20]).serialize();
        bytes[1] = b'b';
        assert!(matches!(
            Handshake::deserialize(&bytes),
            Err(PeerError::HandshakeInvalidProtocol)
        ));
    }

    #[test]
    fn validate_checks_info_hash() {
        let handshake = Handshake::new([0x11; 20], [0x22; 20]);
        assert!(handshake.validate([0x11; 20]).is_ok());
        assert!(matches!(
            handshake.validate([0x12; 20]),
            Err(PeerError::HandshakeInfoHashMismatch)
        ));
    }
}
