//! Peer wire protocol (BEP-3) and the actors speaking it.
//!
//! This module implements the base peer wire protocol (handshake, framing,
//! messages, bitfields) plus the per-connection session actor and the
//! manager that owns the set of live sessions.

mod bitfield;
mod error;
mod manager;
mod message;
mod peer_id;
mod session;
mod transport;

pub use bitfield::Bitfield;
pub use error::PeerError;
pub use manager::{manager_channels, ManagerRx, ManagerTx, PeerManager};
pub use message::{Handshake, Message, MessageId};
pub use peer_id::PeerId;
pub use session::{ChokingState, PeerSession, SessionContext, SessionStats};
pub use transport::{MessageReader, MessageWriter};
