//! Peer-wire protocol: handshake, message framing, and the per-connection
//! download engine.
//!
//! Everything in this module is local to a single peer connection. Errors
//! raised here are caught at the engine boundary and expressed as a
//! disconnect; they never take the whole session down.
use thiserror::Error;

pub mod assembler;
pub mod bitfield;
pub mod engine;
pub mod handshake;
pub mod message;
pub mod ring_buffer;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connect timed out")]
    ConnectTimeout,

    #[error("Ring buffer underflow: requested {requested} bytes, {available} available")]
    BufferUnderflow { requested: usize, available: usize },

    #[error("Ring buffer overflow: writing {requested} bytes into {space} free")]
    BufferOverflow { requested: usize, space: usize },

    #[error("Handshake failed: invalid protocol identifier")]
    HandshakeInvalidProtocol,

    #[error("Handshake failed: info hash mismatch")]
    HandshakeInfoHashMismatch,

    #[error("Malformed handshake: {0}")]
    MalformedHandshake(String),

    #[error("Message length {0} exceeds the sanity cap")]
    OversizedMessage(usize),

    #[error("Unknown message id: {0}")]
    UnknownMessageId(u8),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Bitfield index {index} out of range for {bytes}-byte bitfield")]
    BitfieldOutOfRange { index: usize, bytes: usize },

    #[error("Bitfield queried before initialization")]
    BitfieldMissing,

    #[error("Unexpected BITFIELD after the first post-handshake message")]
    UnexpectedBitfield,

    #[error("Block for piece {got}, expected piece {expected}")]
    WrongPiece { expected: u32, got: u32 },

    #[error("Block out of range: end {end} beyond piece size {piece_size}")]
    BlockOutOfRange { end: usize, piece_size: usize },

    #[error("No blocks left to request")]
    NoBlocksPending,
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
