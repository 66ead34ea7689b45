//! bitswarm - BitTorrent piece exchange
//!
//! This library implements the piece-exchange core of a BitTorrent client:
//! the peer wire protocol, the shared piece repository with rarest-first
//! selection and endgame mode, per-connection session state machines and
//! the tit-for-tat choking scheduler.
//!
//! Tracker announces, DHT and `.torrent` parsing are left to the caller,
//! which supplies a [`Metainfo`], a [`FileStorage`](storage::FileStorage)
//! and peer addresses.
//!
//! # Modules
//!
//! - [`peer`] - Wire codec, handshake, peer sessions, peer manager and choker
//! - [`storage`] - File storage, piece assembly and verification, piece selection
//! - [`metainfo`] - Read-only torrent metadata
//! - [`torrent`] - Ties one torrent's repository, peers and stats together
//! - [`config`] - Tuning knobs, defaults in [`constants`]

pub mod config;
pub mod constants;
pub mod metainfo;
pub mod peer;
pub mod stats;
pub mod storage;
pub mod torrent;

pub use config::{ChokingConfig, SessionConfig};
pub use metainfo::{Metainfo, MetainfoError};
pub use peer::{
    Bitfield, BlockRequest, ChokingAlgorithm, ConnectionRole, Handshake, HandshakeError, Message,
    PeerError, PeerId, PeerManager, PeerSession, TrackerPeer,
};
pub use stats::{TransferSnapshot, TransferStats};
pub use storage::{
    DiskStorage, FileEntry, FileStorage, MemoryStorage, PieceInfo, PieceRepository,
    RepositoryError, StorageError, WriteOutcome,
};
pub use torrent::{Torrent, TorrentEvent, TorrentStatus};
