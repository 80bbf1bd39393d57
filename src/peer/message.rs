//! Length-prefixed peer-wire messages and the incremental parser that
//! lifts them out of a connection's ring buffer.
//!
//! Every message is a 4-byte big-endian length prefix followed by a
//! 1-byte id and the body. A zero length prefix is a keep-alive with no
//! id byte at all; internally it is modeled as id 10 with an empty body
//! so the engine can match on it like anything else.
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};

use super::ring_buffer::RingBuffer;
use super::PeerError;
use super::PeerResult;

const MESSAGE_LENGTH_SIZE: usize = 4;

/// Sanity cap on the declared message length. The largest legitimate
/// message is a PIECE carrying one 16 KiB block plus 9 bytes of header;
/// anything claiming more than this is a corrupt or hostile stream.
pub const MAX_MESSAGE_LENGTH: usize = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    // not a wire id; stands in for the id-less zero-length frame
    KeepAlive = 10,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> PeerResult<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            other => Err(PeerError::UnknownMessageId(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMessage {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

impl PeerMessage {
    pub fn new(id: MessageId, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    pub fn keep_alive() -> Self {
        Self::new(MessageId::KeepAlive, Vec::new())
    }

    pub fn interested() -> Self {
        Self::new(MessageId::Interested, Vec::new())
    }

    /// request: `<len=0013><id=6><index><begin><length>`
    pub fn request(piece_index: u32, begin: u32, length: u32) -> Self {
        let mut payload = BytesMut::with_capacity(12);
        payload.put_u32(piece_index);
        payload.put_u32(begin);
        payload.put_u32(length);
        Self::new(MessageId::Request, payload.to_vec())
    }

    /// cancel: `<len=0013><id=8><index><begin><length>` — same payload as
    /// a request; used best-effort during the end game.
    pub fn cancel(piece_index: u32, begin: u32, length: u32) -> Self {
        let mut payload = BytesMut::with_capacity(12);
        payload.put_u32(piece_index);
        payload.put_u32(begin);
        payload.put_u32(length);
        Self::new(MessageId::Cancel, payload.to_vec())
    }

    /// Serializes into wire form. A keep-alive is just the zero length
    /// prefix; everything else is `<len><id><payload>`.
    pub fn serialize(&self) -> Vec<u8> {
        if self.id == MessageId::KeepAlive {
            return vec![0u8; MESSAGE_LENGTH_SIZE];
        }

        let mut buf = BytesMut::with_capacity(MESSAGE_LENGTH_SIZE + 1 + self.payload.len());
        buf.put_u32((1 + self.payload.len()) as u32);
        buf.put_u8(self.id as u8);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Parses the next complete message out of `buffer`, if one is fully
    /// buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed; in that case
    /// nothing has been consumed. A declared length above
    /// [`MAX_MESSAGE_LENGTH`] or an unknown id is a fatal stream error
    /// for this peer.
    pub fn parse(buffer: &mut RingBuffer) -> PeerResult<Option<PeerMessage>> {
        if buffer.len() < MESSAGE_LENGTH_SIZE {
            return Ok(None);
        }

        let header = buffer.peek(MESSAGE_LENGTH_SIZE)?;
        let message_length = BigEndian::read_u32(&header) as usize;

        if message_length == 0 {
            buffer.remove(MESSAGE_LENGTH_SIZE)?;
            return Ok(Some(PeerMessage::keep_alive()));
        }

        if message_length > MAX_MESSAGE_LENGTH {
            return Err(PeerError::OversizedMessage(message_length));
        }

        if buffer.len() < MESSAGE_LENGTH_SIZE + message_length {
            // incomplete frame; leave the header in place
            return Ok(None);
        }

        buffer.remove(MESSAGE_LENGTH_SIZE)?;
        let id = MessageId::try_from(buffer.read(1)?[0])?;
        let payload = buffer.read(message_length - 1)?;
        Ok(Some(PeerMessage { id, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(bytes: &[u8]) -> RingBuffer {
        let mut buf = RingBuffer::new(MAX_MESSAGE_LENGTH + 1024);
        buf.write(bytes).unwrap();
        buf
    }

    #[test]
    fn zero_length_frame_is_keep_alive() {
        let mut buf = buffer_with(&[0, 0, 0, 0]);
        let message = PeerMessage::parse(&mut buf).unwrap().unwrap();
        assert_eq!(message.id, MessageId::KeepAlive);
        assert!(message.payload.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn length_one_frame_is_a_bare_state_message() {
        let mut buf = buffer_with(&[0, 0, 0, 1, 1]);
        let message = PeerMessage::parse(&mut buf).unwrap().unwrap();
        assert_eq!(message.id, MessageId::Unchoke);
        assert!(message.payload.is_empty());
    }

    #[test]
    fn incomplete_frames_consume_nothing() {
        let mut buf = buffer_with(&[0, 0]);
        assert!(PeerMessage::parse(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);

        // full header, partial body
        buf.write(&[0, 6, 4]).unwrap();
        assert!(PeerMessage::parse(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 5);

        // body completes the HAVE
        buf.write(&[0, 0, 0, 9]).unwrap();
        let message = PeerMessage::parse(&mut buf).unwrap().unwrap();
        assert_eq!(message.id, MessageId::Have);
        assert_eq!(message.payload, [0, 0, 0, 9]);
    }

    #[test]
    fn unknown_id_is_fatal() {
        let mut buf = buffer_with(&[0, 0, 0, 1, 11]);
        assert!(matches!(
            PeerMessage::parse(&mut buf),
            Err(PeerError::UnknownMessageId(11))
        ));
    }

    #[test]
    fn oversized_length_is_fatal() {
        let mut buf = buffer_with(&[0, 1, 0, 0]); // 65536
        assert!(matches!(
            PeerMessage::parse(&mut buf),
            Err(PeerError::OversizedMessage(65536))
        ));
    }

    #[test]
    fn request_wire_format() {
        let message = PeerMessage::request(3, 16384, 16384);
        assert_eq!(
            message.serialize(),
            [
                0, 0, 0, 13, // length
                6, // id
                0, 0, 0, 3, // index
                0, 0, 64, 0, // begin
                0, 0, 64, 0, // length
            ]
        );
    }

    #[test]
    fn serialize_parse_round_trip() {
        let original = PeerMessage::new(MessageId::Piece, vec![1, 2, 3, 4, 5]);
        let mut buf = buffer_with(&original.serialize());
        let parsed = PeerMessage::parse(&mut buf).unwrap().unwrap();
        assert_eq!(parsed, original);

        let mut buf = buffer_with(&PeerMessage::keep_alive().serialize());
        assert_eq!(
            PeerMessage::parse(&mut buf).unwrap().unwrap(),
            PeerMessage::keep_alive()
        );
    }
}
