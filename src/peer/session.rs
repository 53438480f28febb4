use std::collections::VecDeque;
use std::net::SocketAddr;

use tokio::io::{self, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, timeout, Duration, Instant};
use tracing::{debug, trace};

use crate::comms::{Block, PeerCommand, PeerEvent, PeerName, PieceHash};
use crate::constants::{
    CHANNEL_CAPACITY, CONNECTION_TIMEOUT, HANDSHAKE_TIMEOUT, KEEPALIVE_INTERVAL,
    MAX_PIPELINED_REQUESTS,
};
use crate::torrent::{BlockRequest, TorrentLayout};

use super::bitfield::Bitfield;
use super::error::PeerError;
use super::message::{Handshake, Message, HANDSHAKE_LEN};
use super::peer_id::PeerId;
use super::transport::{MessageReader, MessageWriter};

/// The four flow-control booleans of a peer-wire connection.
///
/// A fresh connection starts with both sides choking and neither side
/// interested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokingState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for ChokingState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Per-session traffic counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub errors: u64,
}

/// Everything a session needs besides its socket: identity, torrent shape,
/// and the channel ends wiring it to the controller and disk-I/O.
pub struct SessionContext {
    pub our_peer_id: PeerId,
    pub layout: TorrentLayout,
    pub commands: mpsc::Receiver<PeerCommand>,
    pub events: mpsc::Sender<PeerEvent>,
    pub blocks: mpsc::Sender<Block>,
    pub shutdown: broadcast::Receiver<()>,
    pub idle_timeout: Duration,
}

// Fetch state for one assigned piece: blocks not yet requested, and blocks
// requested but not yet received.
struct PieceProgress {
    piece: u32,
    expected_hash: PieceHash,
    pending: VecDeque<BlockRequest>,
    inflight: Vec<BlockRequest>,
}

/// One end-to-end peer-wire session.
///
/// The session exclusively owns its connection: after the handshake the
/// stream is split, the read half moves into a subtask that feeds decoded
/// frames back over a session-local channel, and the write half stays with
/// the event loop. Inbound messages become events for the controller;
/// controller commands become wire traffic.
pub struct PeerSession<S> {
    peer_name: PeerName,
    initiator: bool,
    remote_peer_id: PeerId,
    layout: TorrentLayout,
    choking: ChokingState,
    stats: SessionStats,
    reader: Option<MessageReader<ReadHalf<S>>>,
    writer: MessageWriter<WriteHalf<S>>,
    commands: mpsc::Receiver<PeerCommand>,
    events: mpsc::Sender<PeerEvent>,
    blocks: mpsc::Sender<Block>,
    shutdown: broadcast::Receiver<()>,
    idle_timeout: Duration,
    assigned: Vec<PieceProgress>,
    last_tx: Instant,
    last_rx: Instant,
    wire_started: bool,
}

impl PeerSession<TcpStream> {
    /// Dials `addr` and performs the handshake as initiator.
    pub async fn connect(addr: SocketAddr, ctx: SessionContext) -> Result<Self, PeerError> {
        let stream = timeout(CONNECTION_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Self::establish(stream, addr.to_string(), true, ctx).await
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> PeerSession<S> {
    /// Performs the handshake over an already-connected stream.
    ///
    /// The initiator sends its handshake first and then reads the remote's;
    /// an accepted connection reads first. A wrong protocol string or
    /// info-hash fails the session before the controller ever hears of it.
    pub async fn establish(
        stream: S,
        peer_name: PeerName,
        initiator: bool,
        ctx: SessionContext,
    ) -> Result<Self, PeerError> {
        let (rd, wr) = io::split(stream);
        let mut reader = MessageReader::new(rd);
        let mut writer = MessageWriter::new(wr);

        let ours = Handshake::new(ctx.layout.info_hash, *ctx.our_peer_id.as_bytes());
        let mut stats = SessionStats::default();

        let theirs = timeout(HANDSHAKE_TIMEOUT, async {
            if initiator {
                stats.bytes_written += writer.send_handshake(&ours).await? as u64;
                reader.receive_handshake().await
            } else {
                let theirs = reader.receive_handshake().await?;
                stats.bytes_written += writer.send_handshake(&ours).await? as u64;
                Ok(theirs)
            }
        })
        .await
        .map_err(|_| PeerError::Timeout)??;
        stats.bytes_read += HANDSHAKE_LEN as u64;

        if theirs.info_hash != ctx.layout.info_hash {
            return Err(PeerError::InfoHashMismatch);
        }

        let remote_peer_id = PeerId(theirs.peer_id);
        debug!(peer = %peer_name, id = %remote_peer_id, initiator, "handshake complete");

        let now = Instant::now();
        Ok(Self {
            peer_name,
            initiator,
            remote_peer_id,
            layout: ctx.layout,
            choking: ChokingState::default(),
            stats,
            reader: Some(reader),
            writer,
            commands: ctx.commands,
            events: ctx.events,
            blocks: ctx.blocks,
            shutdown: ctx.shutdown,
            idle_timeout: ctx.idle_timeout,
            assigned: Vec::new(),
            last_tx: now,
            last_rx: now,
            wire_started: false,
        })
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn initiator(&self) -> bool {
        self.initiator
    }

    pub fn remote_peer_id(&self) -> PeerId {
        self.remote_peer_id
    }

    pub fn choking(&self) -> ChokingState {
        self.choking
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Runs the session to completion.
    ///
    /// Returns `Ok(())` on orderly shutdown (kill signal or the controller
    /// going away) and the terminal error otherwise. Either way the caller
    /// is expected to report this peer dead to the manager.
    pub async fn run(mut self) -> Result<(), PeerError> {
        let Some(mut reader) = self.reader.take() else {
            return Ok(());
        };

        let (frames_tx, mut frames_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let reader_task = tokio::spawn(async move {
            loop {
                let item = reader.receive_message().await;
                let done = item.is_err();
                if frames_tx.send(item).await.is_err() || done {
                    break;
                }
            }
        });

        let result = self.event_loop(&mut frames_rx).await;
        reader_task.abort();

        if let Err(ref error) = result {
            self.stats.errors += 1;
            debug!(peer = %self.peer_name, %error, "session failed");
        }
        debug!(
            peer = %self.peer_name,
            bytes_read = self.stats.bytes_read,
            bytes_written = self.stats.bytes_written,
            errors = self.stats.errors,
            "session closed"
        );
        result
    }

    async fn event_loop(
        &mut self,
        frames: &mut mpsc::Receiver<Result<Message, PeerError>>,
    ) -> Result<(), PeerError> {
        loop {
            let keepalive_at = self.last_tx + KEEPALIVE_INTERVAL;
            let idle_at = self.last_rx + self.idle_timeout;

            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(Ok(message)) => self.handle_message(message).await?,
                    Some(Err(error)) => return Err(error),
                    None => return Err(PeerError::ConnectionClosed),
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await?,
                    // The controller hung up; this torrent is done with us.
                    None => return Ok(()),
                },
                _ = time::sleep_until(keepalive_at) => {
                    self.send(Message::KeepAlive).await?;
                }
                _ = time::sleep_until(idle_at) => return Err(PeerError::IdleTimeout),
                _ = self.shutdown.recv() => return Ok(()),
            }
        }
    }

    async fn handle_message(&mut self, message: Message) -> Result<(), PeerError> {
        self.last_rx = Instant::now();
        self.stats.bytes_read += message.wire_len() as u64;

        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.choking.peer_choking = true;
                // A choking remote discards our outstanding requests, and the
                // controller flushes the assignment on this event anyway.
                self.assigned.clear();
                self.emit_choke_status(true).await;
            }
            Message::Unchoke => {
                self.choking.peer_choking = false;
                self.emit_choke_status(false).await;
                self.top_up_requests().await?;
            }
            Message::Interested => self.choking.peer_interested = true,
            Message::NotInterested => self.choking.peer_interested = false,
            Message::Have { piece } => {
                if piece >= self.layout.piece_count {
                    return Err(PeerError::InvalidMessage(format!(
                        "have for piece {} of {}",
                        piece, self.layout.piece_count
                    )));
                }
                self.declare_interest().await?;
                self.emit_haves(vec![piece]).await;
            }
            Message::Bitfield(bits) => {
                let expected = Bitfield::byte_len(self.layout.piece_count as usize);
                if bits.len() != expected {
                    return Err(PeerError::InvalidMessage(format!(
                        "bitfield length {} (expected {})",
                        bits.len(),
                        expected
                    )));
                }
                let field = Bitfield::from_bytes(bits, self.layout.piece_count as usize);
                let pieces = field.available_pieces();
                if !pieces.is_empty() {
                    self.declare_interest().await?;
                }
                self.emit_haves(pieces).await;
            }
            Message::Piece { index, begin, data } => {
                self.record_block(index, begin);
                let block = Block {
                    peer_name: self.peer_name.clone(),
                    piece: index,
                    offset: begin,
                    data,
                };
                // A closed disk channel only happens during teardown; the
                // shutdown signal ends the session right after.
                let _ = self.blocks.send(block).await;
                self.top_up_requests().await?;
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                // Leech-only core: we never unchoke the remote, so nothing
                // is owed here.
                trace!(peer = %self.peer_name, index, begin, length, "ignoring request");
            }
            Message::Cancel { .. } | Message::Port(_) => {}
        }

        Ok(())
    }

    async fn handle_command(&mut self, command: PeerCommand) -> Result<(), PeerError> {
        match command {
            PeerCommand::RequestPiece {
                piece,
                expected_hash,
            } => {
                self.declare_interest().await?;
                let pending: VecDeque<BlockRequest> =
                    self.layout.block_requests(piece).into_iter().collect();
                if pending.is_empty() {
                    return Ok(());
                }
                trace!(peer = %self.peer_name, piece, blocks = pending.len(), "piece assigned");
                let progress = PieceProgress {
                    piece,
                    expected_hash,
                    pending,
                    inflight: Vec::new(),
                };
                // A re-request after a choke flush replaces whatever state
                // was left behind.
                match self.assigned.iter().position(|p| p.piece == piece) {
                    Some(i) => self.assigned[i] = progress,
                    None => self.assigned.push(progress),
                }
                self.top_up_requests().await
            }
            PeerCommand::CancelPiece { piece } => {
                if let Some(i) = self.assigned.iter().position(|p| p.piece == piece) {
                    let progress = self.assigned.remove(i);
                    for block in progress.inflight {
                        self.send(Message::Cancel {
                            index: block.piece,
                            begin: block.offset,
                            length: block.length,
                        })
                        .await?;
                    }
                }
                Ok(())
            }
            PeerCommand::HaveBatch(pieces) => {
                if pieces.is_empty() {
                    return Ok(());
                }
                if !self.wire_started {
                    // First thing on the wire after the handshake: announce
                    // everything at once as a BITFIELD.
                    let field =
                        Bitfield::from_indices(&pieces, self.layout.piece_count as usize);
                    self.send(Message::Bitfield(field.to_bytes())).await
                } else {
                    for piece in pieces {
                        self.send(Message::Have { piece }).await?;
                    }
                    Ok(())
                }
            }
        }
    }

    // Removes a received block from the in-flight set and retires the piece
    // when every block has been seen. Assembly and verification happen in
    // disk-I/O; this is request bookkeeping only.
    fn record_block(&mut self, piece: u32, offset: u32) {
        let Some(i) = self.assigned.iter().position(|p| p.piece == piece) else {
            trace!(peer = %self.peer_name, piece, offset, "block for unassigned piece");
            return;
        };

        let progress = &mut self.assigned[i];
        match progress.inflight.iter().position(|b| b.offset == offset) {
            Some(j) => {
                progress.inflight.remove(j);
            }
            None => trace!(peer = %self.peer_name, piece, offset, "unsolicited block"),
        }

        if progress.pending.is_empty() && progress.inflight.is_empty() {
            let progress = self.assigned.remove(i);
            debug!(
                peer = %self.peer_name,
                piece,
                hash_prefix = ?&progress.expected_hash[..4],
                "all blocks fetched, awaiting verification"
            );
        }
    }

    async fn declare_interest(&mut self) -> Result<(), PeerError> {
        if !self.choking.am_interested {
            self.choking.am_interested = true;
            self.send(Message::Interested).await?;
        }
        Ok(())
    }

    // Keeps the request pipeline full: pulls pending blocks, oldest
    // assignment first, until the in-flight window is at capacity.
    async fn top_up_requests(&mut self) -> Result<(), PeerError> {
        if self.choking.peer_choking {
            return Ok(());
        }

        let mut inflight_total: usize = self.assigned.iter().map(|p| p.inflight.len()).sum();
        let mut to_send = Vec::new();
        for progress in &mut self.assigned {
            while inflight_total < MAX_PIPELINED_REQUESTS {
                let Some(block) = progress.pending.pop_front() else {
                    break;
                };
                progress.inflight.push(block);
                to_send.push(block);
                inflight_total += 1;
            }
            if inflight_total >= MAX_PIPELINED_REQUESTS {
                break;
            }
        }

        for block in to_send {
            self.send(Message::Request {
                index: block.piece,
                begin: block.offset,
                length: block.length,
            })
            .await?;
        }
        Ok(())
    }

    async fn emit_choke_status(&mut self, is_choked: bool) {
        let event = PeerEvent::ChokeStatus {
            peer_name: self.peer_name.clone(),
            is_choked,
        };
        let _ = self.events.send(event).await;
    }

    async fn emit_haves(&mut self, pieces: Vec<u32>) {
        let event = PeerEvent::HaveBatch {
            peer_name: self.peer_name.clone(),
            pieces,
        };
        let _ = self.events.send(event).await;
    }

    async fn send(&mut self, message: Message) -> Result<(), PeerError> {
        let n = self.writer.send_message(&message).await?;
        self.stats.bytes_written += n as u64;
        self.last_tx = Instant::now();
        self.wire_started = true;
        Ok(())
    }
}
