//! Protocol constants and tuning parameters.
//!
//! This module contains the constants used throughout the piece-exchange
//! engine: wire protocol values, block sizes, pipeline depths, choking
//! intervals and connection limits.
//!
//! Most values are defaults that can be overridden through
//! [`SessionConfig`](crate::SessionConfig).

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &[u8; 8] = b"-BS0001-";

// ============================================================================
// Protocol constants
// ============================================================================

/// BitTorrent protocol string sent in the handshake
pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Reserved bytes in the handshake (no extensions are advertised)
pub const RESERVED_BYTES: [u8; 8] = [0; 8];

/// Length of an info hash and of a peer id
pub const HASH_LEN: usize = 20;

/// Size of the big-endian length prefix of every message frame
pub const LENGTH_PREFIX_LEN: usize = 4;

// ============================================================================
// Block and piece sizes
// ============================================================================

/// Standard block size (16KB)
pub const BLOCK_SIZE: u32 = 16384;

/// Maximum request length (128KB). Larger requests get the peer disconnected.
pub const MAX_REQUEST_LENGTH: u32 = 131072;

/// Maximum frame size accepted from a peer (a piece message carrying a
/// maximum-size block plus headroom for large bitfields)
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

// ============================================================================
// Piece selection
// ============================================================================

/// Capacity of the per-peer queue of in-flight block requests
pub const REQUEST_QUEUE_LEN: usize = 5;

/// Completed ratio from which in-flight pieces may be requested again
pub const ENDGAME_THRESHOLD: f64 = 0.95;

/// Upper bound of the rarest-first candidate pool a piece is drawn from
pub const MAX_CANDIDATE_POOL: usize = 40;

// ============================================================================
// Connection limits
// ============================================================================

/// Maximum peers exchanging messages at the same time
pub const MAX_CONNECTED_PEERS: usize = 40;

/// Maximum peers known from trackers and inbound connections
pub const MAX_KNOWN_PEERS: usize = 80;

/// Maximum concurrent outbound connection attempts
pub const MAX_HALF_OPEN: usize = 25;

// ============================================================================
// Choking
// ============================================================================

/// Choking algorithm run interval
pub const CHOKING_INTERVAL: Duration = Duration::from_secs(10);

/// Peers unchoked on merit every pass
pub const MAX_UNCHOKED_PEERS: usize = 4;

/// Every n-th pass performs an optimistic unchoke (every 30 seconds)
pub const OPTIMISTIC_UNCHOKE_PASSES: u64 = 3;

/// Every n-th pass resets the rate accumulators
pub const RATE_RESET_PASSES: u64 = 2;

// ============================================================================
// Timeouts
// ============================================================================

/// TCP connection timeout
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake timeout after TCP connect
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A keep-alive is sent when nothing else was queued for this long
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Peer read timeout (a peer must send at least a keep-alive in this window)
pub const PEER_READ_TIMEOUT: Duration = Duration::from_secs(180);

/// Write timeout for a single frame
pub const PEER_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Time given to peer tasks to wind down on shutdown before they are aborted
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);
