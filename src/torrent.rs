//! One torrent being downloaded or seeded.
//!
//! [`Torrent`] wires the pieces of the engine together: the metadata, the
//! [`PieceRepository`] on top of a [`FileStorage`], the [`PeerManager`] and
//! the byte counters reported to the tracker. Everything the engine has to
//! tell its owner arrives as a [`TorrentEvent`] on the channel returned by
//! [`Torrent::new`].
//!
//! # Examples
//!
//! ```no_run
//! use bitswarm::metainfo::Metainfo;
//! use bitswarm::peer::{PeerId, TrackerPeer};
//! use bitswarm::storage::DiskStorage;
//! use bitswarm::{SessionConfig, Torrent, TorrentEvent};
//! use std::sync::Arc;
//!
//! # async fn example(metainfo: Metainfo, peers: Vec<TrackerPeer>) -> Result<(), Box<dyn std::error::Error>> {
//! let storage = DiskStorage::new("./downloads", metainfo.files().to_vec())?;
//! let (torrent, mut events) = Torrent::new(
//!     metainfo,
//!     Arc::new(storage),
//!     PeerId::generate(),
//!     SessionConfig::default(),
//! );
//!
//! torrent.start().await?;
//! torrent.add_peers(peers);
//!
//! while let Some(event) = events.recv().await {
//!     if let TorrentEvent::DownloadComplete = event {
//!         break;
//!     }
//! }
//! torrent.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::SessionConfig;
use crate::metainfo::Metainfo;
use crate::peer::{ConnectionRole, PeerError, PeerId, PeerManager, PeerSession, TrackerPeer};
use crate::stats::{TransferSnapshot, TransferStats};
use crate::storage::{FileStorage, PieceRepository, RepositoryError, StorageError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Pieces hashed concurrently while checking existing data.
const VERIFY_BATCH: usize = 8;

/// Notifications for the owner of a torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentEvent {
    /// A piece passed verification and is on disk.
    PieceCompleted(u32),
    /// Every piece is on disk and storage was finalized.
    DownloadComplete,
    /// Local storage failed; no peer-level retry can fix this.
    StorageFailure(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentStatus {
    Downloading,
    Seeding,
}

pub struct Torrent {
    metainfo: Metainfo,
    stats: Arc<TransferStats>,
    repository: Arc<PieceRepository>,
    manager: PeerManager,
}

impl Torrent {
    /// Creates the torrent and the channel its events are delivered on.
    /// Nothing runs until [`start`](Self::start).
    pub fn new(
        metainfo: Metainfo,
        storage: Arc<dyn FileStorage>,
        local_id: PeerId,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TorrentEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let stats = Arc::new(TransferStats::new(metainfo.total_length()));
        let repository = Arc::new(PieceRepository::new(
            metainfo.pieces(),
            storage,
            stats.clone(),
            &config,
        ));
        let manager = PeerManager::new(
            *metainfo.info_hash(),
            local_id,
            repository.clone(),
            config,
            events_tx,
        );

        let torrent = Self {
            metainfo,
            stats,
            repository,
            manager,
        };
        (torrent, events_rx)
    }

    /// Checks the data already in storage, then starts the choker.
    ///
    /// Pieces whose hash matches are marked complete and will not be
    /// downloaded again. Returns how many pieces were found intact.
    pub async fn start(&self) -> Result<usize, RepositoryError> {
        let count = self.repository.piece_count() as u32;
        let indices: Vec<u32> = (0..count).collect();
        let mut present = 0;

        for batch in indices.chunks(VERIFY_BATCH) {
            let results = futures::future::join_all(
                batch.iter().map(|&piece| self.repository.check_on_disk(piece)),
            )
            .await;

            for (piece, result) in batch.iter().zip(results) {
                match result {
                    Ok(true) => present += 1,
                    Ok(false) => {}
                    Err(RepositoryError::Storage(StorageError::Closed)) => {
                        return Err(StorageError::Closed.into());
                    }
                    Err(e) => debug!("piece {} not readable: {}", piece, e),
                }
            }
        }

        info!(
            "{}: {}/{} pieces already present",
            self.metainfo.name(),
            present,
            count
        );

        if self.repository.is_complete() {
            self.repository.finalize_if_complete().await?;
        }

        self.manager.start_choker();
        Ok(present)
    }

    /// Hands over peers from a tracker response.
    pub fn add_peers<I>(&self, peers: I) -> usize
    where
        I: IntoIterator<Item = TrackerPeer>,
    {
        self.manager.add_peers(peers)
    }

    /// Takes an inbound TCP connection.
    pub fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        self.manager.accept(stream, addr);
    }

    /// Runs the handshake over an already established stream and binds a
    /// session to it.
    pub async fn attach<S>(
        &self,
        stream: S,
        addr: SocketAddr,
        role: ConnectionRole,
    ) -> Result<Option<Arc<PeerSession>>, PeerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.manager.attach(stream, addr, role).await
    }

    pub fn metainfo(&self) -> &Metainfo {
        &self.metainfo
    }

    pub fn repository(&self) -> &Arc<PieceRepository> {
        &self.repository
    }

    pub fn manager(&self) -> &PeerManager {
        &self.manager
    }

    /// Byte counters for the next tracker announce.
    pub fn stats(&self) -> TransferSnapshot {
        self.stats.snapshot()
    }

    pub fn status(&self) -> TorrentStatus {
        if self.repository.is_complete() {
            TorrentStatus::Seeding
        } else {
            TorrentStatus::Downloading
        }
    }

    pub fn is_complete(&self) -> bool {
        self.repository.is_complete()
    }

    /// Disconnects every peer and closes storage.
    pub async fn shutdown(&self) -> Result<(), RepositoryError> {
        self.manager.shutdown().await;
        self.repository.close().await?;
        info!("{}: stopped", self.metainfo.name());
        Ok(())
    }
}

#[cfg(test)]
mod tests;
