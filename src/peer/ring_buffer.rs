use super::PeerError;
use super::PeerResult;

/// Fixed-capacity circular byte buffer feeding the wire parser.
///
/// Inbound socket bytes are written at the tail; the parser peeks and
/// removes from the head. Reads and writes that cross the wrap boundary
/// are split internally. The buffer never overwrites unread data: a
/// write that does not fit fails, which is what gives the engine its
/// backpressure signal.
///
/// Owned by exactly one engine; no interior locking.
#[derive(Debug)]
pub struct RingBuffer {
    buffer: Vec<u8>,
    read_index: usize,
    count: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            buffer: vec![0u8; capacity],
            read_index: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn empty_space(&self) -> usize {
        self.capacity() - self.count
    }

    /// Copies the next `num_bytes` out of the buffer without consuming them.
    pub fn peek(&self, num_bytes: usize) -> PeerResult<Vec<u8>> {
        if num_bytes > self.count {
            return Err(PeerError::BufferUnderflow {
                requested: num_bytes,
                available: self.count,
            });
        }

        let capacity = self.capacity();
        let first = num_bytes.min(capacity - self.read_index);

        let mut out = Vec::with_capacity(num_bytes);
        out.extend_from_slice(&self.buffer[self.read_index..self.read_index + first]);
        out.extend_from_slice(&self.buffer[..num_bytes - first]);
        Ok(out)
    }

    /// Discards the next `num_bytes` from the head.
    pub fn remove(&mut self, num_bytes: usize) -> PeerResult<()> {
        if num_bytes > self.count {
            return Err(PeerError::BufferUnderflow {
                requested: num_bytes,
                available: self.count,
            });
        }
        self.read_index = (self.read_index + num_bytes) % self.capacity();
        self.count -= num_bytes;
        Ok(())
    }

    /// `peek` followed by `remove`.
    pub fn read(&mut self, num_bytes: usize) -> PeerResult<Vec<u8>> {
        let out = self.peek(num_bytes)?;
        self.remove(num_bytes)?;
        Ok(out)
    }

    pub fn write(&mut self, data: &[u8]) -> PeerResult<()> {
        if data.len() > self.empty_space() {
            return Err(PeerError::BufferOverflow {
                requested: data.len(),
                space: self.empty_space(),
            });
        }

        let capacity = self.capacity();
        let write_start = (self.read_index + self.count) % capacity;
        let first = data.len().min(capacity - write_start);

        self.buffer[write_start..write_start + first].copy_from_slice(&data[..first]);
        self.buffer[..data.len() - first].copy_from_slice(&data[first..]);
        self.count += data.len();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.read_index = 0;
        self.count = 0;
    }
}
