//! Peer wire protocol and connected peers.
//!
//! This module implements the base peer wire protocol: the handshake, the
//! length-prefixed message codec and the per-connection state machine that
//! turns messages into [`PieceRepository`](crate::storage::PieceRepository)
//! operations. [`PeerManager`] holds the connected sessions and runs the
//! periodic choking pass.
//!
//! # Message flow
//!
//! A connection goes through the handshake ([`PeerTransport`]), is bound to
//! a [`PeerSession`] and is then served by two tasks: a reader dispatching
//! inbound frames and a writer draining the session's outbound queue. The
//! choker never touches sockets; it flips the session's choke flag, which
//! queues a `choke` or `unchoke` message.

mod bitfield;
mod choking;
mod error;
mod handshake;
mod manager;
mod message;
mod peer_id;
mod piece;
mod rate;
mod registry;
mod session;
mod transport;

pub use bitfield::Bitfield;
pub use choking::{ChokingAlgorithm, ChokingDecision, ChokingState, PeerStats};
pub use error::{HandshakeError, PeerError};
pub use handshake::{Handshake, HANDSHAKE_LEN};
pub use manager::{ConnectionRole, PeerManager, TrackerPeer};
pub use message::{Message, MessageId};
pub use peer_id::PeerId;
pub use piece::{Block, BlockRequest};
pub use rate::RateAccumulator;
pub use registry::{PeerRecord, PeerRegistry};
pub use session::PeerSession;
pub use transport::{FrameReader, FrameWriter, PeerTransport};
