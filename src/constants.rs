//! Protocol constants and tuning parameters.
//!
//! Timeouts follow the conventional peer-wire values (two-minute keepalive
//! window); the scheduling caps are deliberately conservative for a
//! leech-only core.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &str = "-BS0001-";

// ============================================================================
// Ports
// ============================================================================

/// Default BitTorrent listen port
pub const DEFAULT_PORT: u16 = 6881;

// ============================================================================
// Block and frame sizes
// ============================================================================

/// Standard block size (16KB)
pub const BLOCK_SIZE: u32 = 16384;

/// Frame-size cap. Anything larger than this on the wire is a protocol
/// violation: the biggest legitimate frames are Piece messages (one block
/// plus a 9-byte header) and bitfields.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

// ============================================================================
// Scheduling
// ============================================================================

/// Maximum pieces a single peer is assigned at once.
pub const MAX_SIMULTANEOUS_DOWNLOADS_PER_PEER: usize = 5;

/// Maximum outstanding block requests per peer for request pipelining.
pub const MAX_PIPELINED_REQUESTS: usize = 32;

// ============================================================================
// Timeouts and intervals
// ============================================================================

/// TCP connection timeout for outbound dials
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);

/// Handshake timeout after TCP connect
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Socket write timeout
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Keepalive message interval
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// A session that receives nothing for this long is torn down.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

// ============================================================================
// Channels
// ============================================================================

/// Bound for every cross-actor channel. Full channels stall the producer,
/// which surfaces as protocol-level backpressure rather than memory growth.
pub const CHANNEL_CAPACITY: usize = 64;
