//! bitswarm - BitTorrent swarm core
//!
//! The peer-session layer and download controller of a BitTorrent client:
//! concurrent peer-wire sessions plus the decision engine that chooses,
//! as swarm membership and availability change, which peer fetches which
//! piece next.
//!
//! # Modules
//!
//! - [`peer`] - BEP-3 peer wire protocol, per-connection sessions, and the
//!   session registry
//! - [`controller`] - rarest-first download scheduling
//! - [`comms`] - message types and channel bundles connecting the actors
//! - [`torrent`] - piece and block geometry
//! - [`constants`] - protocol constants and tuning parameters
//!
//! The metainfo parser, tracker client, disk I/O, and listen server are
//! external collaborators reached only through the channels in [`comms`].

pub mod comms;
pub mod constants;
pub mod controller;
pub mod peer;
pub mod torrent;

pub use comms::{
    controller_channels, Block, ControllerRx, ControllerTx, PeerCommand, PeerComms, PeerEvent,
    PeerName, PeerTuple, PieceHash, ReceivedPiece, RegistryEvent,
};
pub use controller::{Controller, PeerInfo};
pub use peer::{
    manager_channels, Bitfield, ChokingState, Handshake, ManagerRx, ManagerTx, Message,
    MessageId, MessageReader, MessageWriter, PeerError, PeerId, PeerManager, PeerSession,
    SessionContext, SessionStats,
};
pub use torrent::{BlockRequest, TorrentLayout};
