use super::PeerError;
use super::PeerResult;

/// Bit-addressable view over a raw byte array, MSB-first: bit `i` lives
/// in byte `i / 8` at offset `7 - (i % 8)`.
///
/// This is the layout of the BITFIELD message payload. Trailing spare
/// bits beyond the last valid piece index are ignored, not enforced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
}

impl Bitfield {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// An all-zero bitfield wide enough for `num_pieces` pieces.
    pub fn with_piece_count(num_pieces: usize) -> Self {
        Self {
            bytes: vec![0u8; num_pieces.div_ceil(8)],
        }
    }

    fn position(&self, index: usize) -> PeerResult<(usize, u32)> {
        let byte_index = index / 8;
        if byte_index >= self.bytes.len() {
            return Err(PeerError::BitfieldOutOfRange {
                index,
                bytes: self.bytes.len(),
            });
        }
        Ok((byte_index, 7 - (index % 8) as u32))
    }

    pub fn contains(&self, index: usize) -> PeerResult<bool> {
        let (byte_index, offset) = self.position(index)?;
        Ok((self.bytes[byte_index] >> offset) & 1 == 1)
    }

    pub fn set(&mut self, index: usize) -> PeerResult<()> {
        let (byte_index, offset) = self.position(index)?;
        self.bytes[byte_index] |= 1 << offset;
        Ok(())
    }

    pub fn clear(&mut self, index: usize) -> PeerResult<()> {
        let (byte_index, offset) = self.position(index)?;
        self.bytes[byte_index] &= !(1 << offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msb_first_addressing() {
        let field = Bitfield::new(vec![0b1000_0001, 0b0100_0000]);
        assert!(field.contains(0).unwrap());
        assert!(!field.contains(1).unwrap());
        assert!(field.contains(7).unwrap());
        assert!(!field.contains(8).unwrap());
        assert!(field.contains(9).unwrap());
    }

    #[test]
    fn set_clear_and_idempotence() {
        let mut field = Bitfield::with_piece_count(9);
        field.set(3).unwrap();
        assert!(field.contains(3).unwrap());
        field.set(3).unwrap();
        assert!(field.contains(3).unwrap());
        field.clear(3).unwrap();
        assert!(!field.contains(3).unwrap());

        // bit 8 lands in the second byte
        field.set(8).unwrap();
        assert!(field.contains(8).unwrap());
    }

    #[test]
    fn out_of_range_index_fails() {
        let field = Bitfield::new(vec![0xff]);
        assert!(field.contains(7).unwrap());
        assert!(matches!(
            field.contains(8),
            Err(PeerError::BitfieldOutOfRange { index: 8, bytes: 1 })
        ));
    }
}
