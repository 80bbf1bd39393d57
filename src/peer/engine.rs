//! Per-connection download engine.
//!
//! A `PeerEngine` owns one TCP connection to one remote peer and drives
//! it through handshake, bitfield exchange, and block-level piece
//! transfer. It never blocks: inbound bytes are pulled with `try_read`
//! into a ring buffer when the coordinator reports the socket readable,
//! and `advance` consumes whatever complete messages have accumulated.
//!
//! Anything that goes wrong on the wire is peer-local: the engine moves
//! itself to `Disconnected` and the coordinator reaps it.
use std::net::SocketAddr;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::assembler::{PieceAssembler, BLOCK_SIZE_BYTES};
use super::bitfield::Bitfield;
use super::handshake::{Handshake, HANDSHAKE_LENGTH};
use super::message::{MessageId, PeerMessage};
use super::ring_buffer::RingBuffer;
use super::PeerError;
use super::PeerResult;

/// Timeout for the initial TCP connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pipelining cap: at most this many unanswered REQUESTs in flight.
pub const MAX_QUEUED_REQUESTS: usize = 10;

/// Ring buffer headroom beyond one block, enough for a PIECE header and
/// a handful of small control messages.
const BUFFER_PADDING: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Initial, and terminal on any failure.
    Disconnected,
    /// TCP connected, our handshake sent, awaiting the peer's.
    InitHandshake,
    /// Handshake validated, awaiting the peer's bitfield.
    InitBitfield,
    /// Ready to be assigned a piece.
    Idle,
    /// A piece is in flight.
    Downloading,
    /// Accepts inbound messages but requests nothing.
    Paused,
}

pub struct PeerEngine {
    addr: SocketAddr,
    stream: TcpStream,
    info_hash: [u8; 20],
    remote_peer_id: Option<[u8; 20]>,
    buffer: RingBuffer,
    bitfield: Option<Bitfield>,
    choked_by_remote: bool,
    queued_requests: usize,
    assembler: Option<PieceAssembler>,
    state: EngineState,
    paused_from: Option<EngineState>,
    /// Set when a readable event found the buffer full and no message
    /// could be parsed; a second occurrence disconnects.
    stalled: bool,
}

impl PeerEngine {
    /// Connects to a peer (5 s timeout) and sends our handshake.
    ///
    /// A returned engine is in `InitHandshake`; a peer that cannot be
    /// reached in time yields an error and no engine at all.
    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> PeerResult<Self> {
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::ConnectTimeout)??;

        let handshake = Handshake::new(info_hash, peer_id);
        stream.write_all(&handshake.serialize()).await?;
        debug!(%addr, "connected, handshake sent");

        Ok(Self {
            addr,
            stream,
            info_hash,
            remote_peer_id: None,
            buffer: RingBuffer::new(BLOCK_SIZE_BYTES + BUFFER_PADDING),
            bitfield: None,
            choked_by_remote: true,
            queued_requests: 0,
            assembler: None,
            state: EngineState::InitHandshake,
            paused_from: None,
            stalled: false,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn remote_peer_id(&self) -> Option<[u8; 20]> {
        self.remote_peer_id
    }

    pub fn choked_by_remote(&self) -> bool {
        self.choked_by_remote
    }

    pub fn is_idle(&self) -> bool {
        self.state == EngineState::Idle
    }

    pub fn is_downloading(&self) -> bool {
        self.state == EngineState::Downloading
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == EngineState::Disconnected
    }

    /// Whether the peer has advertised `index`, either via its bitfield
    /// or a later HAVE. False before the bitfield arrives, and false for
    /// indices beyond the advertised width.
    pub fn has_piece(&self, index: usize) -> bool {
        self.bitfield
            .as_ref()
            .is_some_and(|field| matches!(field.contains(index), Ok(true)))
    }

    /// Index of the piece currently assigned to this engine, if any.
    /// Still answers after a disconnect so the coordinator can return
    /// the piece to the pool.
    pub fn current_piece(&self) -> Option<u32> {
        self.assembler.as_ref().map(PieceAssembler::piece_index)
    }

    /// Waits until the socket has inbound data (or EOF) to report.
    pub async fn readable(&self) -> std::io::Result<()> {
        self.stream.readable().await
    }

    /// Non-blocking read of whatever the socket has, bounded by the free
    /// space in the ring buffer.
    ///
    /// EOF moves the engine to `Disconnected`. A full buffer is the
    /// backpressure signal: tolerated once, fatal if it persists across
    /// consecutive reads without a parseable message in between.
    pub fn read_from_socket(&mut self) -> PeerResult<usize> {
        if self.state == EngineState::Disconnected {
            return Ok(0);
        }

        let space = self.buffer.empty_space();
        if space == 0 {
            if self.stalled {
                warn!(addr = %self.addr, "ring buffer full with no parseable message, disconnecting");
                self.set_disconnected();
                return Ok(0);
            }
            self.stalled = true;
            return Ok(0);
        }

        let mut chunk = vec![0u8; space];
        match self.stream.try_read(&mut chunk) {
            Ok(0) => {
                debug!(addr = %self.addr, "peer closed connection");
                self.set_disconnected();
                Ok(0)
            }
            Ok(n) => {
                self.buffer.write(&chunk[..n])?;
                Ok(n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => {
                debug!(addr = %self.addr, error = %e, "socket error");
                self.set_disconnected();
                Err(e.into())
            }
        }
    }

    /// Advances the state machine, consuming as many complete messages
    /// as the ring buffer holds.
    pub async fn advance(&mut self) -> PeerResult<()> {
        match self.state {
            EngineState::InitHandshake | EngineState::InitBitfield => {
                self.run_init_states().await
            }
            EngineState::Idle | EngineState::Paused => self.drain_messages(false).await,
            EngineState::Downloading => self.run_downloading().await,
            EngineState::Disconnected => Ok(()),
        }
    }

    async fn run_init_states(&mut self) -> PeerResult<()> {
        if self.state == EngineState::InitHandshake {
            if self.buffer.len() < HANDSHAKE_LENGTH {
                return Ok(());
            }
            let bytes = self.buffer.read(HANDSHAKE_LENGTH)?;
            let handshake = match Handshake::deserialize(&bytes)
                .and_then(|h| h.validate(self.info_hash).map(|_| h))
            {
                Ok(handshake) => handshake,
                Err(e) => {
                    warn!(addr = %self.addr, error = %e, "handshake rejected");
                    self.set_disconnected();
                    return Err(e);
                }
            };
            self.remote_peer_id = Some(handshake.peer_id);
            self.state = EngineState::InitBitfield;
            self.stalled = false;
            trace!(addr = %self.addr, "handshake validated");
        }

        if self.state == EngineState::InitBitfield {
            let message = match PeerMessage::parse(&mut self.buffer) {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.set_disconnected();
                    return Err(e);
                }
            };

            if message.id != MessageId::Bitfield {
                warn!(addr = %self.addr, id = ?message.id, "expected BITFIELD as first message");
                self.set_disconnected();
                return Ok(());
            }

            self.bitfield = Some(Bitfield::new(message.payload));
            self.send(PeerMessage::interested()).await?;
            self.state = EngineState::Idle;
            self.stalled = false;
            debug!(addr = %self.addr, "bitfield received, now idle");

            // anything buffered behind the bitfield is handled passively
            self.drain_messages(false).await?;
        }

        Ok(())
    }

    async fn run_downloading(&mut self) -> PeerResult<()> {
        self.drain_messages(true).await?;
        if self.state == EngineState::Disconnected {
            return Ok(());
        }

        if !self.choked_by_remote {
            self.fill_request_pipeline().await?;
        }

        if self.assembler.as_ref().is_some_and(PieceAssembler::complete) {
            self.state = EngineState::Idle;
        }
        Ok(())
    }

    /// Parses and handles every complete message in the buffer. PIECE
    /// payloads are forwarded to the assembler only when
    /// `handle_piece` is set (i.e. in `Downloading`); in every other
    /// state they are discarded, which is also where late blocks land
    /// after an end-game cancel.
    async fn drain_messages(&mut self, handle_piece: bool) -> PeerResult<()> {
        while self.state != EngineState::Disconnected {
            let message = match PeerMessage::parse(&mut self.buffer) {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    warn!(addr = %self.addr, error = %e, "unparseable stream");
                    self.set_disconnected();
                    return Err(e);
                }
            };
            self.stalled = false;
            if let Err(e) = self.handle_message(message, handle_piece) {
                self.set_disconnected();
                return Err(e);
            }
        }
        Ok(())
    }

    fn handle_message(&mut self, message: PeerMessage, handle_piece: bool) -> PeerResult<()> {
        match message.id {
            MessageId::Choke => {
                // outstanding requests stay counted; the peer may still
                // answer them
                self.choked_by_remote = true;
            }
            MessageId::Unchoke => {
                self.choked_by_remote = false;
            }
            // we never upload, so interest signals are noise
            MessageId::Interested | MessageId::NotInterested => {}
            MessageId::Have => {
                if message.payload.len() != 4 {
                    return Err(PeerError::MalformedMessage(format!(
                        "HAVE payload of {} bytes",
                        message.payload.len()
                    )));
                }
                let index = BigEndian::read_u32(&message.payload) as usize;
                self.bitfield
                    .as_mut()
                    .ok_or(PeerError::BitfieldMissing)?
                    .set(index)?;
            }
            // only valid as the first post-handshake message, which
            // run_init_states consumed
            MessageId::Bitfield => return Err(PeerError::UnexpectedBitfield),
            MessageId::Request | MessageId::Cancel | MessageId::Port => {}
            MessageId::Piece => self.handle_piece_payload(&message.payload, handle_piece)?,
            MessageId::KeepAlive => {}
        }
        Ok(())
    }

    fn handle_piece_payload(&mut self, payload: &[u8], handle_piece: bool) -> PeerResult<()> {
        if payload.len() < 8 {
            return Err(PeerError::MalformedMessage(format!(
                "PIECE payload of {} bytes is too short",
                payload.len()
            )));
        }

        if !handle_piece {
            trace!(addr = %self.addr, "discarding PIECE outside download");
            return Ok(());
        }

        let piece_index = BigEndian::read_u32(&payload[0..4]);
        match self.assembler.as_mut() {
            Some(assembler) if assembler.piece_index() == piece_index => {
                assembler.handle_block(payload)?;
                self.queued_requests = self.queued_requests.saturating_sub(1);
            }
            _ => {
                // a block for a piece we no longer work on, e.g. after
                // an end-game cancel followed by reassignment
                trace!(addr = %self.addr, piece_index, "discarding stale PIECE");
            }
        }
        Ok(())
    }

    /// Tops the request pipeline back up to [`MAX_QUEUED_REQUESTS`].
    async fn fill_request_pipeline(&mut self) -> PeerResult<()> {
        loop {
            if self.queued_requests >= MAX_QUEUED_REQUESTS {
                break;
            }
            let request = match self.assembler.as_mut() {
                Some(assembler) if assembler.has_blocks_to_request() => {
                    assembler.next_request()?
                }
                _ => break,
            };
            self.send(request).await?;
            self.queued_requests += 1;
        }
        Ok(())
    }

    /// Assigns a piece to this engine and, unless choked, immediately
    /// pipelines requests for it.
    ///
    /// Precondition: the engine is idle and `has_piece(piece_index)`.
    pub async fn start_piece(&mut self, piece_index: u32, piece_size: usize) -> PeerResult<()> {
        debug_assert!(self.is_idle());
        debug_assert!(self.has_piece(piece_index as usize));

        debug!(addr = %self.addr, piece_index, piece_size, "starting piece download");
        self.assembler = Some(PieceAssembler::new(piece_index, piece_size));
        self.queued_requests = 0;
        self.state = EngineState::Downloading;

        if !self.choked_by_remote {
            self.fill_request_pipeline().await?;
        }
        Ok(())
    }

    /// Abandons the current piece, sending best-effort CANCELs for every
    /// unanswered request, and returns to idle. Late PIECE payloads that
    /// arrive anyway are discarded by the normal message path.
    pub async fn cancel_piece(&mut self) -> PeerResult<()> {
        if let Some(assembler) = self.assembler.take() {
            let piece_index = assembler.piece_index();
            debug!(addr = %self.addr, piece_index, "cancelling piece download");
            for (begin, length) in assembler.outstanding_blocks() {
                self.send(PeerMessage::cancel(piece_index, begin, length))
                    .await?;
            }
        }
        self.queued_requests = 0;
        if self.state == EngineState::Downloading {
            self.state = EngineState::Idle;
        }
        Ok(())
    }

    /// Hands over the assembled piece once every block has arrived.
    /// Clears the assembler and leaves the engine idle.
    pub fn take_completed_piece(&mut self) -> Option<(u32, Vec<u8>)> {
        if !self.assembler.as_ref().is_some_and(PieceAssembler::complete) {
            return None;
        }
        let assembler = self.assembler.take()?;
        if self.state == EngineState::Downloading {
            self.state = EngineState::Idle;
        }
        Some((assembler.piece_index(), assembler.into_bytes()))
    }

    /// Stops requesting blocks while continuing to consume inbound
    /// messages. `resume` restores the pre-pause state.
    pub fn pause(&mut self) {
        if self.state != EngineState::Disconnected && self.state != EngineState::Paused {
            self.paused_from = Some(self.state);
            self.state = EngineState::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.state == EngineState::Paused {
            self.state = self.paused_from.take().unwrap_or(EngineState::Idle);
        }
    }

    /// A paused engine stays silent otherwise; this keeps the remote
    /// from timing the connection out.
    pub async fn send_keep_alive(&mut self) -> PeerResult<()> {
        self.send(PeerMessage::keep_alive()).await
    }

    async fn send(&mut self, message: PeerMessage) -> PeerResult<()> {
        if let Err(e) = self.stream.write_all(&message.serialize()).await {
            debug!(addr = %self.addr, error = %e, "write failed");
            self.set_disconnected();
            return Err(e.into());
        }
        Ok(())
    }

    fn set_disconnected(&mut self) {
        self.state = EngineState::Disconnected;
        self.buffer.clear();
    }

    /// Best-effort graceful shutdown of the connection.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
        self.set_disconnected();
    }
}

impl std::fmt::Debug for PeerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerEngine")
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("choked_by_remote", &self.choked_by_remote)
            .field("queued_requests", &self.queued_requests)
            .field("current_piece", &self.current_piece())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    const INFO_HASH: [u8; 20] = [0x11; 20];
    const OUR_PEER_ID: [u8; 20] = [0x22; 20];
    const SEED_PEER_ID: [u8; 20] = [0x33; 20];

    async fn connected_pair() -> (PeerEngine, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (engine, accepted) = tokio::join!(
            PeerEngine::connect(addr, INFO_HASH, OUR_PEER_ID),
            listener.accept()
        );
        (engine.unwrap(), accepted.unwrap().0)
    }

    /// Pump the engine until `done` holds (or the peer drops).
    async fn drive(engine: &mut PeerEngine, done: impl Fn(&PeerEngine) -> bool) {
        while !done(engine) && !engine.is_disconnected() {
            engine.readable().await.unwrap();
            let _ = engine.read_from_socket();
            let _ = engine.advance().await;
        }
    }

    async fn read_request(seed: &mut TcpStream) -> (u32, u32, u32) {
        let mut frame = [0u8; 17];
        seed.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame[0..4], &[0, 0, 0, 13]);
        assert_eq!(frame[4], MessageId::Request as u8);
        (
            BigEndian::read_u32(&frame[5..9]),
            BigEndian::read_u32(&frame[9..13]),
            BigEndian::read_u32(&frame[13..17]),
        )
    }

    fn piece_message(index: u32, begin: u32, data: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(8 + data.len());
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(data);
        PeerMessage::new(MessageId::Piece, payload).serialize()
    }

    #[tokio::test]
    async fn full_piece_download_replay() {
        let (mut engine, mut seed) = connected_pair().await;

        let seed_task = tokio::spawn(async move {
            // our side of the handshake arrives first
            let mut ours = [0u8; HANDSHAKE_LENGTH];
            seed.read_exact(&mut ours).await.unwrap();
            let parsed = Handshake::deserialize(&ours).unwrap();
            assert_eq!(parsed.info_hash, INFO_HASH);
            assert_eq!(parsed.peer_id, OUR_PEER_ID);

            // answer with handshake, 9-piece bitfield, unchoke
            seed.write_all(&Handshake::new(INFO_HASH, SEED_PEER_ID).serialize())
                .await
                .unwrap();
            seed.write_all(&PeerMessage::new(MessageId::Bitfield, vec![0xff, 0x80]).serialize())
                .await
                .unwrap();
            seed.write_all(&PeerMessage::new(MessageId::Unchoke, Vec::new()).serialize())
                .await
                .unwrap();

            // the engine must declare interest
            let mut interested = [0u8; 5];
            seed.read_exact(&mut interested).await.unwrap();
            assert_eq!(interested, [0, 0, 0, 1, 2]);

            // both blocks of piece 3, in whatever order they were asked
            let mut begins = HashSet::new();
            for _ in 0..2 {
                let (index, begin, length) = read_request(&mut seed).await;
                assert_eq!(index, 3);
                assert_eq!(length, BLOCK_SIZE_BYTES as u32);
                begins.insert(begin);
            }
            assert_eq!(
                begins,
                HashSet::from([0u32, BLOCK_SIZE_BYTES as u32])
            );

            seed.write_all(&piece_message(3, 0, &[0xaa; BLOCK_SIZE_BYTES]))
                .await
                .unwrap();
            seed.write_all(&piece_message(
                3,
                BLOCK_SIZE_BYTES as u32,
                &[0xbb; BLOCK_SIZE_BYTES],
            ))
            .await
            .unwrap();
            seed
        });

        drive(&mut engine, |e| e.is_idle() && !e.choked_by_remote()).await;
        assert_eq!(engine.remote_peer_id(), Some(SEED_PEER_ID));
        assert!(engine.has_piece(3));
        assert!(engine.has_piece(8));
        assert!(!engine.has_piece(9));

        engine
            .start_piece(3, 2 * BLOCK_SIZE_BYTES)
            .await
            .unwrap();
        assert!(engine.is_downloading());

        drive(&mut engine, |e| e.is_idle()).await;
        let (piece_index, bytes) = engine.take_completed_piece().unwrap();
        assert_eq!(piece_index, 3);
        assert_eq!(&bytes[..BLOCK_SIZE_BYTES], &[0xaa; BLOCK_SIZE_BYTES][..]);
        assert_eq!(&bytes[BLOCK_SIZE_BYTES..], &[0xbb; BLOCK_SIZE_BYTES][..]);

        seed_task.await.unwrap();
    }

    #[tokio::test]
    async fn first_message_other_than_bitfield_disconnects() {
        let (mut engine, mut seed) = connected_pair().await;

        let mut ours = [0u8; HANDSHAKE_LENGTH];
        seed.read_exact(&mut ours).await.unwrap();
        seed.write_all(&Handshake::new(INFO_HASH, SEED_PEER_ID).serialize())
            .await
            .unwrap();
        seed.write_all(&PeerMessage::new(MessageId::Unchoke, Vec::new()).serialize())
            .await
            .unwrap();

        drive(&mut engine, |_| false).await;
        assert!(engine.is_disconnected());
    }

    #[tokio::test]
    async fn handshake_with_wrong_info_hash_disconnects() {
        let (mut engine, mut seed) = connected_pair().await;

        let mut ours = [0u8; HANDSHAKE_LENGTH];
        seed.read_exact(&mut ours).await.unwrap();
        seed.write_all(&Handshake::new([0x44; 20], SEED_PEER_ID).serialize())
            .await
            .unwrap();

        while !engine.is_disconnected() {
            engine.readable().await.unwrap();
            let _ = engine.read_from_socket();
            let _ = engine.advance().await;
        }
        assert!(engine.is_disconnected());
    }

    #[tokio::test]
    async fn paused_engine_consumes_messages_but_requests_nothing() {
        let (mut engine, mut seed) = connected_pair().await;

        let mut ours = [0u8; HANDSHAKE_LENGTH];
        seed.read_exact(&mut ours).await.unwrap();
        seed.write_all(&Handshake::new(INFO_HASH, SEED_PEER_ID).serialize())
            .await
            .unwrap();
        seed.write_all(&PeerMessage::new(MessageId::Bitfield, vec![0x00, 0x00]).serialize())
            .await
            .unwrap();

        drive(&mut engine, |e| e.is_idle()).await;
        let mut interested = [0u8; 5];
        seed.read_exact(&mut interested).await.unwrap();

        engine.pause();
        assert_eq!(engine.state(), EngineState::Paused);

        // a HAVE received while paused still lands in the bitfield
        seed.write_all(&PeerMessage::new(MessageId::Have, 5u32.to_be_bytes().to_vec()).serialize())
            .await
            .unwrap();
        drive(&mut engine, |e| e.has_piece(5)).await;
        assert_eq!(engine.state(), EngineState::Paused);

        engine.send_keep_alive().await.unwrap();
        let mut keep_alive = [0u8; 4];
        seed.read_exact(&mut keep_alive).await.unwrap();
        assert_eq!(keep_alive, [0, 0, 0, 0]);

        engine.resume();
        assert!(engine.is_idle());
    }
}
