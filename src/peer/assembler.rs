//! Block-level bookkeeping for one in-flight piece.
use std::collections::HashSet;

use byteorder::{BigEndian, ByteOrder};

use super::message::PeerMessage;
use super::PeerError;
use super::PeerResult;

/// Sub-piece transfer unit. Every REQUEST asks for one block, except the
/// final block of a piece, which may be shorter.
pub const BLOCK_SIZE_BYTES: usize = 16_384;

/// Tracks outstanding and received blocks for a single piece while it is
/// being downloaded from one peer.
///
/// The assembler is created when the coordinator assigns a piece (which
/// supplies the actual piece size; the last piece of the content is
/// usually shorter than the nominal piece length) and destroyed when the
/// piece either verifies or is abandoned.
#[derive(Debug)]
pub struct PieceAssembler {
    piece_index: u32,
    piece_bytes: Vec<u8>,
    total_blocks: usize,
    blocks_to_request: HashSet<usize>,
    blocks_received: HashSet<usize>,
}

impl PieceAssembler {
    pub fn new(piece_index: u32, piece_size: usize) -> Self {
        let total_blocks = piece_size.div_ceil(BLOCK_SIZE_BYTES);
        Self {
            piece_index,
            piece_bytes: vec![0u8; piece_size],
            total_blocks,
            blocks_to_request: (0..total_blocks).collect(),
            blocks_received: HashSet::new(),
        }
    }

    pub fn piece_index(&self) -> u32 {
        self.piece_index
    }

    pub fn piece_size(&self) -> usize {
        self.piece_bytes.len()
    }

    pub fn has_blocks_to_request(&self) -> bool {
        !self.blocks_to_request.is_empty()
    }

    fn block_length(&self, block: usize) -> usize {
        let start = block * BLOCK_SIZE_BYTES;
        BLOCK_SIZE_BYTES.min(self.piece_bytes.len() - start)
    }

    /// Takes one pending block (any order) off the to-request set and
    /// returns the REQUEST message for it.
    ///
    /// Fails with `NoBlocksPending` when everything has been requested.
    pub fn next_request(&mut self) -> PeerResult<PeerMessage> {
        let block = *self
            .blocks_to_request
            .iter()
            .next()
            .ok_or(PeerError::NoBlocksPending)?;
        self.blocks_to_request.remove(&block);

        let begin = block * BLOCK_SIZE_BYTES;
        Ok(PeerMessage::request(
            self.piece_index,
            begin as u32,
            self.block_length(block) as u32,
        ))
    }

    /// Blocks that were requested but have not come back, as
    /// (begin, length) pairs. Used to build best-effort CANCELs.
    pub fn outstanding_blocks(&self) -> Vec<(u32, u32)> {
        (0..self.total_blocks)
            .filter(|block| {
                !self.blocks_received.contains(block) && !self.blocks_to_request.contains(block)
            })
            .map(|block| {
                (
                    (block * BLOCK_SIZE_BYTES) as u32,
                    self.block_length(block) as u32,
                )
            })
            .collect()
    }

    /// Ingests a PIECE payload: piece index (4 BE), begin offset (4 BE),
    /// then the block data.
    ///
    /// The write is accepted at any in-bounds, byte-aligned offset; the
    /// received-block accounting credits `begin / BLOCK_SIZE_BYTES`, so
    /// completion tracking assumes peers answer on the request grid.
    pub fn handle_block(&mut self, payload: &[u8]) -> PeerResult<()> {
        if payload.len() < 8 {
            return Err(PeerError::MalformedMessage(format!(
                "PIECE payload of {} bytes is too short",
                payload.len()
            )));
        }

        let piece_index = BigEndian::read_u32(&payload[0..4]);
        if piece_index != self.piece_index {
            return Err(PeerError::WrongPiece {
                expected: self.piece_index,
                got: piece_index,
            });
        }

        let begin = BigEndian::read_u32(&payload[4..8]) as usize;
        let data = &payload[8..];
        let end = begin + data.len();
        if end > self.piece_bytes.len() {
            return Err(PeerError::BlockOutOfRange {
                end,
                piece_size: self.piece_bytes.len(),
            });
        }

        self.piece_bytes[begin..end].copy_from_slice(data);
        self.blocks_received.insert(begin / BLOCK_SIZE_BYTES);
        Ok(())
    }

    pub fn complete(&self) -> bool {
        self.blocks_received.len() == self.total_blocks
    }

    /// Surrenders the assembled piece bytes for verification.
    pub fn into_bytes(self) -> Vec<u8> {
        self.piece_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::message::MessageId;

    fn piece_payload(index: u32, begin: u32, data: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(8 + data.len());
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(data);
        payload
    }

    /// Decodes the (index, begin, length) triple out of a REQUEST.
    fn request_fields(message: &PeerMessage) -> (u32, u32, u32) {
        assert_eq!(message.id, MessageId::Request);
        (
            BigEndian::read_u32(&message.payload[0..4]),
            BigEndian::read_u32(&message.payload[4..8]),
            BigEndian::read_u32(&message.payload[8..12]),
        )
    }

    #[test]
    fn requests_cover_every_block_in_some_order() {
        let mut assembler = PieceAssembler::new(3, 2 * BLOCK_SIZE_BYTES);

        let mut seen: Vec<_> = (0..2)
            .map(|_| request_fields(&assembler.next_request().unwrap()))
            .collect();
        seen.sort_unstable();
        assert_eq!(
            seen,
            vec![
                (3, 0, BLOCK_SIZE_BYTES as u32),
                (3, BLOCK_SIZE_BYTES as u32, BLOCK_SIZE_BYTES as u32),
            ]
        );
        assert!(matches!(
            assembler.next_request(),
            Err(PeerError::NoBlocksPending)
        ));
    }

    #[test]
    fn final_block_of_a_short_piece_is_truncated() {
        let mut assembler = PieceAssembler::new(0, BLOCK_SIZE_BYTES + 100);
        let mut lengths: Vec<_> = (0..2)
            .map(|_| request_fields(&assembler.next_request().unwrap()).2)
            .collect();
        lengths.sort_unstable();
        assert_eq!(lengths, vec![100, BLOCK_SIZE_BYTES as u32]);
    }

    #[test]
    fn blocks_assemble_and_complete() {
        let mut assembler = PieceAssembler::new(3, 2 * BLOCK_SIZE_BYTES);
        assembler.next_request().unwrap();
        assembler.next_request().unwrap();

        assembler
            .handle_block(&piece_payload(3, 0, &[0xaa; BLOCK_SIZE_BYTES]))
            .unwrap();
        assert!(!assembler.complete());

        assembler
            .handle_block(&piece_payload(
                3,
                BLOCK_SIZE_BYTES as u32,
                &[0xbb; BLOCK_SIZE_BYTES],
            ))
            .unwrap();
        assert!(assembler.complete());

        let bytes = assembler.into_bytes();
        assert_eq!(&bytes[..BLOCK_SIZE_BYTES], &[0xaa; BLOCK_SIZE_BYTES][..]);
        assert_eq!(&bytes[BLOCK_SIZE_BYTES..], &[0xbb; BLOCK_SIZE_BYTES][..]);
    }

    #[test]
    fn rejects_block_for_wrong_piece() {
        let mut assembler = PieceAssembler::new(1, BLOCK_SIZE_BYTES);
        assert!(matches!(
            assembler.handle_block(&piece_payload(2, 0, b"data")),
            Err(PeerError::WrongPiece {
                expected: 1,
                got: 2
            })
        ));
    }

    #[test]
    fn rejects_block_past_piece_end() {
        let mut assembler = PieceAssembler::new(0, 100);
        assert!(matches!(
            assembler.handle_block(&piece_payload(0, 90, &[0u8; 20])),
            Err(PeerError::BlockOutOfRange {
                end: 110,
                piece_size: 100
            })
        ));
    }

    #[test]
    fn outstanding_blocks_reflect_unanswered_requests() {
        let mut assembler = PieceAssembler::new(0, 2 * BLOCK_SIZE_BYTES);
        assert!(assembler.outstanding_blocks().is_empty());

        let (_, begin_a, len_a) = request_fields(&assembler.next_request().unwrap());
        assert_eq!(assembler.outstanding_blocks(), vec![(begin_a, len_a)]);

        assembler
            .handle_block(&piece_payload(0, begin_a, &vec![0u8; len_a as usize]))
            .unwrap();
        assert!(assembler.outstanding_blocks().is_empty());
    }
}
