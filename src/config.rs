//! Session configuration.
//!
//! [`SessionConfig`] gathers the tuning knobs of the piece-exchange engine.
//! Every field defaults to the matching value in [`constants`](crate::constants).
//!
//! # Examples
//!
//! ```
//! use bitswarm::SessionConfig;
//! use std::time::Duration;
//!
//! let config = SessionConfig::default()
//!     .with_request_queue_len(8)
//!     .with_selection_seed(7)
//!     .with_keepalive_interval(Duration::from_secs(60));
//!
//! assert_eq!(config.request_queue_len, 8);
//! assert_eq!(config.choking.max_unchoked, 4);
//! ```

use crate::constants::*;
use std::time::Duration;

/// Parameters of the periodic choking pass.
#[derive(Debug, Clone)]
pub struct ChokingConfig {
    /// Time between two passes.
    pub interval: Duration,
    /// Peers unchoked on merit (K).
    pub max_unchoked: usize,
    /// Every n-th pass unchokes one extra peer at random (M).
    pub optimistic_every: u64,
    /// Every n-th pass resets the rate accumulators (N).
    pub rate_reset_every: u64,
    /// Seed for the optimistic pick. `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for ChokingConfig {
    fn default() -> Self {
        Self {
            interval: CHOKING_INTERVAL,
            max_unchoked: MAX_UNCHOKED_PEERS,
            optimistic_every: OPTIMISTIC_UNCHOKE_PASSES,
            rate_reset_every: RATE_RESET_PASSES,
            seed: None,
        }
    }
}

/// Configuration of a torrent session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Length of the blocks requested from peers.
    pub block_size: u32,
    /// Blocks kept in flight per peer.
    pub request_queue_len: usize,
    /// Completed ratio from which endgame mode starts.
    pub endgame_threshold: f64,
    /// Rarest-first candidate pool cap.
    pub max_candidate_pool: usize,
    /// Seed for the piece selector. `None` seeds from the OS.
    pub selection_seed: Option<u64>,
    pub keepalive_interval: Duration,
    pub handshake_timeout: Duration,
    pub connection_timeout: Duration,
    pub max_connected_peers: usize,
    pub max_known_peers: usize,
    pub max_half_open: usize,
    pub shutdown_grace: Duration,
    pub choking: ChokingConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            request_queue_len: REQUEST_QUEUE_LEN,
            endgame_threshold: ENDGAME_THRESHOLD,
            max_candidate_pool: MAX_CANDIDATE_POOL,
            selection_seed: None,
            keepalive_interval: KEEPALIVE_INTERVAL,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            connection_timeout: CONNECTION_TIMEOUT,
            max_connected_peers: MAX_CONNECTED_PEERS,
            max_known_peers: MAX_KNOWN_PEERS,
            max_half_open: MAX_HALF_OPEN,
            shutdown_grace: SHUTDOWN_GRACE_PERIOD,
            choking: ChokingConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Sets the requested block length, capped at [`MAX_REQUEST_LENGTH`].
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size.clamp(1, MAX_REQUEST_LENGTH);
        self
    }

    pub fn with_request_queue_len(mut self, len: usize) -> Self {
        self.request_queue_len = len.max(1);
        self
    }

    pub fn with_endgame_threshold(mut self, threshold: f64) -> Self {
        self.endgame_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_selection_seed(mut self, seed: u64) -> Self {
        self.selection_seed = Some(seed);
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_max_connected_peers(mut self, max: usize) -> Self {
        self.max_connected_peers = max;
        self
    }

    pub fn with_max_known_peers(mut self, max: usize) -> Self {
        self.max_known_peers = max;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_choking(mut self, choking: ChokingConfig) -> Self {
        self.choking = choking;
        self
    }
}
