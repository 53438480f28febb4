//! Cross-actor message types and channel bundles.
//!
//! Every actor in the swarm core owns its state outright; the types here are
//! the only things that cross actor boundaries, always by value over bounded
//! channels. Availability travels as batches: a BITFIELD is one batch of
//! piece indices, a HAVE is a singleton batch, and a batch is always applied
//! in a single controller event-loop iteration.

use std::net::Ipv4Addr;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::constants::CHANNEL_CAPACITY;

/// Canonical `"ip:port"` name of a remote peer, shared by all actors.
pub type PeerName = String;

/// 20-byte SHA-1 piece hash, opaque to the swarm core.
pub type PieceHash = [u8; 20];

/// A peer endpoint as handed out by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerTuple {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl PeerTuple {
    /// The canonical name a session for this endpoint will be keyed by.
    pub fn peer_name(&self) -> PeerName {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Disk-I/O's notification that a piece arrived in full and passed hash
/// verification.
#[derive(Debug, Clone)]
pub struct ReceivedPiece {
    pub peer_name: PeerName,
    pub piece: u32,
}

/// A raw block lifted off the wire, forwarded to disk-I/O for assembly.
#[derive(Debug, Clone)]
pub struct Block {
    pub peer_name: PeerName,
    pub piece: u32,
    pub offset: u32,
    pub data: Bytes,
}

/// Events a session reports upward to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// The remote flipped its choke state toward us.
    ChokeStatus { peer_name: PeerName, is_choked: bool },
    /// The remote advertised pieces: a decoded BITFIELD or a single HAVE.
    HaveBatch { peer_name: PeerName, pieces: Vec<u32> },
}

/// Commands the controller sends down to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    /// This piece is assigned to you; arrange to fetch it.
    RequestPiece { piece: u32, expected_hash: PieceHash },
    /// Stop fetching this piece and cancel outstanding blocks on the wire.
    CancelPiece { piece: u32 },
    /// Announce these pieces to the remote (our bitfield, or a new piece).
    HaveBatch(Vec<u32>),
}

/// The controller's handle to a freshly established session.
#[derive(Debug, Clone)]
pub struct PeerComms {
    pub peer_name: PeerName,
    pub commands: mpsc::Sender<PeerCommand>,
}

/// Peer-registry changes reported by the manager.
#[derive(Debug)]
pub enum RegistryEvent {
    /// A session completed its handshake and is ready for commands.
    NewPeer(PeerComms),
    /// A previously announced session died.
    DeadPeer(PeerName),
}

/// Producer ends of the controller's event sources.
#[derive(Debug, Clone)]
pub struct ControllerTx {
    pub received_piece: mpsc::Sender<ReceivedPiece>,
    pub registry: mpsc::Sender<RegistryEvent>,
    pub peer_events: mpsc::Sender<PeerEvent>,
}

/// Consumer ends of the controller's event sources.
#[derive(Debug)]
pub struct ControllerRx {
    pub received_piece: mpsc::Receiver<ReceivedPiece>,
    pub registry: mpsc::Receiver<RegistryEvent>,
    pub peer_events: mpsc::Receiver<PeerEvent>,
}

/// Creates the bounded channel set connecting disk-I/O, the peer manager,
/// and the sessions to the controller.
pub fn controller_channels() -> (ControllerTx, ControllerRx) {
    let (received_piece_tx, received_piece_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (registry_tx, registry_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (peer_events_tx, peer_events_rx) = mpsc::channel(CHANNEL_CAPACITY);

    (
        ControllerTx {
            received_piece: received_piece_tx,
            registry: registry_tx,
            peer_events: peer_events_tx,
        },
        ControllerRx {
            received_piece: received_piece_rx,
            registry: registry_rx,
            peer_events: peer_events_rx,
        },
    )
}
