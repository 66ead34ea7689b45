use super::error::RepositoryError;
use super::file::PieceInfo;
use super::piece::{BlockAccept, PieceAssembly};
use super::selector::PieceSelector;
use super::FileStorage;
use crate::config::SessionConfig;
use crate::peer::{Bitfield, BlockRequest, PeerId};
use crate::stats::TransferStats;
use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Result of handing a block to [`PieceRepository::write_block`].
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Stored in the piece buffer; more blocks are missing.
    Accepted,
    /// The block completed the piece, which passed verification and is on
    /// disk. `displaced` lists the other peers whose still-queued requests
    /// for the piece were dropped and should be cancelled on the wire.
    Completed {
        displaced: Vec<(PeerId, Vec<BlockRequest>)>,
    },
    /// Another peer already delivered this block, or the piece is done.
    Duplicate,
}

/// The piece a peer is currently downloading from us.
#[derive(Debug)]
struct RequestedPiece {
    piece: u32,
    next_offset: u32,
    queue: VecDeque<BlockRequest>,
}

struct RepositoryState {
    availability: HashMap<PeerId, Bitfield>,
    frequency: Vec<u32>,
    completed: Bitfield,
    in_flight: Bitfield,
    requested: HashMap<PeerId, RequestedPiece>,
    selector: PieceSelector,
}

impl RepositoryState {
    fn holders(&self, piece: u32) -> impl Iterator<Item = &PeerId> {
        self.requested
            .iter()
            .filter(move |(_, r)| r.piece == piece)
            .map(|(peer, _)| peer)
    }

    /// Removes every record on `piece`, returning the queued blocks of each.
    fn drop_records_for(&mut self, piece: u32) -> Vec<(PeerId, Vec<BlockRequest>)> {
        let peers: Vec<PeerId> = self.holders(piece).copied().collect();
        peers
            .into_iter()
            .filter_map(|peer| {
                let record = self.requested.remove(&peer)?;
                Some((peer, record.queue.into_iter().collect::<Vec<_>>()))
            })
            .filter(|(_, queue)| !queue.is_empty())
            .collect()
    }
}

/// Shared piece and block bookkeeping for one torrent.
///
/// All peer sessions go through the repository to learn what to request,
/// to store what they receive and to read what they serve. Bookkeeping is
/// kept under one short-lived lock; each piece buffer has its own lock so
/// blocks for different pieces never contend. Locks are always taken in the
/// order state, then piece, and never held across storage I/O.
pub struct PieceRepository {
    pieces: Vec<PieceInfo>,
    storage: Arc<dyn FileStorage>,
    stats: Arc<TransferStats>,
    block_size: u32,
    queue_len: usize,
    endgame_threshold: f64,
    state: Mutex<RepositoryState>,
    slots: Vec<Mutex<PieceAssembly>>,
    finalized: AtomicBool,
}

impl PieceRepository {
    pub fn new(
        pieces: Vec<PieceInfo>,
        storage: Arc<dyn FileStorage>,
        stats: Arc<TransferStats>,
        config: &SessionConfig,
    ) -> Self {
        let count = pieces.len();
        let slots = (0..count).map(|_| Mutex::new(PieceAssembly::Idle)).collect();

        Self {
            pieces,
            storage,
            stats,
            block_size: config.block_size,
            queue_len: config.request_queue_len,
            endgame_threshold: config.endgame_threshold,
            state: Mutex::new(RepositoryState {
                availability: HashMap::new(),
                frequency: vec![0; count],
                completed: Bitfield::new(count),
                in_flight: Bitfield::new(count),
                requested: HashMap::new(),
                selector: PieceSelector::new(config.max_candidate_pool, config.selection_seed),
            }),
            slots,
            finalized: AtomicBool::new(false),
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece(&self, index: u32) -> Option<&PieceInfo> {
        self.pieces.get(index as usize)
    }

    pub fn piece_length(&self, index: u32) -> Option<u64> {
        self.piece(index).map(|p| p.length)
    }

    pub fn stats(&self) -> &Arc<TransferStats> {
        &self.stats
    }

    fn info(&self, index: u32) -> Result<&PieceInfo, RepositoryError> {
        self.piece(index)
            .ok_or(RepositoryError::InvalidPieceIndex(index))
    }

    // ---------------------------------------------------------------------
    // Peer availability
    // ---------------------------------------------------------------------

    /// Starts tracking a peer with an empty availability bitmap.
    pub fn register_peer(&self, peer: PeerId) {
        let mut state = self.state.lock();
        state
            .availability
            .entry(peer)
            .or_insert_with(|| Bitfield::new(self.pieces.len()));
    }

    /// Forgets a peer: its availability is withdrawn from the rarity
    /// counters and its requested-piece record is dropped. Returns the blocks
    /// that were still in flight. Unregistering twice is a no-op.
    pub fn unregister_peer(&self, peer: &PeerId) -> Vec<BlockRequest> {
        let mut state = self.state.lock();

        if let Some(bits) = state.availability.remove(peer) {
            for index in bits.ones() {
                state.frequency[index] = state.frequency[index].saturating_sub(1);
            }
        }

        self.remove_record(&mut state, peer)
    }

    /// Merges `bits` into the peer's availability (`gained`) or withdraws
    /// them (`!gained`). Only actual bit transitions touch the rarity
    /// counters. Returns how many bits changed.
    pub fn apply_availability(&self, peer: &PeerId, bits: &Bitfield, gained: bool) -> usize {
        let mut state = self.state.lock();
        let RepositoryState {
            availability,
            frequency,
            ..
        } = &mut *state;

        let Some(current) = availability.get_mut(peer) else {
            return 0;
        };

        let mut changed = 0;
        for index in bits.ones() {
            if gained && current.set(index) {
                frequency[index] += 1;
                changed += 1;
            } else if !gained && current.clear(index) {
                frequency[index] = frequency[index].saturating_sub(1);
                changed += 1;
            }
        }
        changed
    }

    /// Single-bit form of [`apply_availability`](Self::apply_availability),
    /// used for `have`. Returns true if the bit changed.
    pub fn set_peer_has_piece(
        &self,
        peer: &PeerId,
        index: u32,
        gained: bool,
    ) -> Result<bool, RepositoryError> {
        self.info(index)?;

        let mut state = self.state.lock();
        let RepositoryState {
            availability,
            frequency,
            ..
        } = &mut *state;

        let Some(current) = availability.get_mut(peer) else {
            return Ok(false);
        };

        let i = index as usize;
        if gained && current.set(i) {
            frequency[i] += 1;
            Ok(true)
        } else if !gained && current.clear(i) {
            frequency[i] = frequency[i].saturating_sub(1);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn peer_has_piece(&self, peer: &PeerId, index: u32) -> bool {
        let state = self.state.lock();
        state
            .availability
            .get(peer)
            .is_some_and(|bits| bits.has(index as usize))
    }

    /// Number of peers known to hold the piece.
    pub fn frequency(&self, index: u32) -> u32 {
        let state = self.state.lock();
        state.frequency.get(index as usize).copied().unwrap_or(0)
    }

    /// Pieces the peer has that we still miss.
    pub fn downloadable_count(&self, peer: &PeerId) -> usize {
        let state = self.state.lock();
        state
            .availability
            .get(peer)
            .map(|bits| bits.ones().filter(|&i| !state.completed.has(i)).count())
            .unwrap_or(0)
    }

    pub fn is_piece_downloadable(&self, index: u32) -> bool {
        let state = self.state.lock();
        (index as usize) < self.pieces.len() && !state.completed.has(index as usize)
    }

    // ---------------------------------------------------------------------
    // Selection and request pipeline
    // ---------------------------------------------------------------------

    /// Picks the next piece to download from `peer`.
    ///
    /// Returns `Ok(None)` when the peer has nothing we can use; callers wait
    /// for the next `have`, `bitfield` or `unchoke` before asking again.
    pub fn select_next_piece(&self, peer: &PeerId) -> Result<Option<u32>, RepositoryError> {
        let mut state = self.state.lock();

        if state.requested.contains_key(peer) {
            return Err(RepositoryError::AlreadyDownloading);
        }

        let endgame = self.endgame_reached(&state);
        let RepositoryState {
            availability,
            frequency,
            completed,
            in_flight,
            selector,
            ..
        } = &mut *state;

        let Some(available) = availability.get(peer) else {
            return Ok(None);
        };

        let mut picked = selector.pick(
            available
                .ones()
                .filter(|&i| !completed.has(i) && !in_flight.has(i)),
            frequency,
        );

        if picked.is_none() && endgame {
            picked = selector.pick(available.ones().filter(|&i| !completed.has(i)), frequency);
        }

        let Some(piece) = picked else {
            return Ok(None);
        };

        state.in_flight.set(piece as usize);
        state.requested.insert(
            *peer,
            RequestedPiece {
                piece,
                next_offset: 0,
                queue: VecDeque::with_capacity(self.queue_len),
            },
        );

        debug!(
            "selected piece {} for {} (frequency {}, endgame {})",
            piece, peer, state.frequency[piece as usize], endgame
        );
        Ok(Some(piece))
    }

    pub fn current_piece(&self, peer: &PeerId) -> Option<u32> {
        self.state.lock().requested.get(peer).map(|r| r.piece)
    }

    /// Tops up the peer's in-flight queue and returns the newly queued
    /// blocks. Blocks another peer already delivered are skipped. An empty
    /// result means the queue is full or the piece has nothing left to ask.
    pub fn next_block_requests(&self, peer: &PeerId) -> Vec<BlockRequest> {
        let mut state = self.state.lock();
        let Some(record) = state.requested.get_mut(peer) else {
            return Vec::new();
        };
        let Some(info) = self.pieces.get(record.piece as usize) else {
            return Vec::new();
        };

        let slot = self.slots[record.piece as usize].lock();
        let mut issued = Vec::new();

        while record.queue.len() < self.queue_len && (record.next_offset as u64) < info.length {
            let offset = record.next_offset;
            let length = (info.length - offset as u64).min(self.block_size as u64) as u32;
            record.next_offset += length;

            if slot.has_block(offset) {
                continue;
            }

            let block = BlockRequest::new(record.piece, offset, length);
            record.queue.push_back(block);
            issued.push(block);
        }

        if !issued.is_empty() {
            trace!("{} blocks queued for {} on piece {}", issued.len(), peer, record.piece);
        }
        issued
    }

    /// Removes a delivered block from the peer's queue. Returns false if the
    /// block was not queued (cancelled, or never requested).
    pub fn mark_block_acked(&self, peer: &PeerId, piece: u32, offset: u32) -> bool {
        let mut state = self.state.lock();
        let Some(record) = state.requested.get_mut(peer) else {
            return false;
        };
        if record.piece != piece {
            return false;
        }
        match record.queue.iter().position(|b| b.offset == offset) {
            Some(pos) => {
                record.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Drops the peer's requested-piece record, returning the blocks that
    /// were in flight so the caller can cancel them on the wire. When no
    /// other peer holds the piece it stops being in flight and its partial
    /// buffer is released. Calling it again is a no-op.
    pub fn cancel_all(&self, peer: &PeerId) -> Vec<BlockRequest> {
        let mut state = self.state.lock();
        self.remove_record(&mut state, peer)
    }

    fn remove_record(&self, state: &mut RepositoryState, peer: &PeerId) -> Vec<BlockRequest> {
        let Some(record) = state.requested.remove(peer) else {
            return Vec::new();
        };

        if state.holders(record.piece).next().is_none() {
            state.in_flight.clear(record.piece as usize);
            self.slots[record.piece as usize].lock().release();
            trace!("piece {} released by {}", record.piece, peer);
        }

        record.queue.into_iter().collect()
    }

    /// Removes a block that just arrived from every other peer's queue.
    /// The returned requests are redundant and should be cancelled.
    pub fn take_redundant_requests(
        &self,
        piece: u32,
        offset: u32,
        except: &PeerId,
    ) -> Vec<(PeerId, BlockRequest)> {
        let mut state = self.state.lock();
        let mut redundant = Vec::new();

        for (peer, record) in state.requested.iter_mut() {
            if peer == except || record.piece != piece {
                continue;
            }
            if let Some(pos) = record.queue.iter().position(|b| b.offset == offset) {
                if let Some(block) = record.queue.remove(pos) {
                    redundant.push((*peer, block));
                }
            }
        }

        redundant
    }

    // ---------------------------------------------------------------------
    // Piece data
    // ---------------------------------------------------------------------

    /// True if the block is already held: the piece is complete, being
    /// verified, or has received a block at this offset.
    pub fn check_piece_has_block(&self, piece: u32, offset: u32) -> bool {
        let state = self.state.lock();
        if state.completed.has(piece as usize) {
            return true;
        }
        self.slots
            .get(piece as usize)
            .is_some_and(|slot| slot.lock().has_block(offset))
    }

    /// Stores a received block.
    ///
    /// When the block completes the piece, the piece is hashed, written to
    /// storage at its absolute offset and marked complete. The first block to
    /// complete a piece wins; later copies come back as `Duplicate`. A piece
    /// that fails verification loses its buffer and every request record,
    /// and becomes selectable again.
    pub async fn write_block(
        &self,
        piece: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<WriteOutcome, RepositoryError> {
        let info = self.info(piece)?;

        let assembled = {
            let state = self.state.lock();
            if state.completed.has(piece as usize) {
                return Ok(WriteOutcome::Duplicate);
            }

            let mut slot = self.slots[piece as usize].lock();
            if slot.is_idle() && !state.in_flight.has(piece as usize) {
                return Err(RepositoryError::NoOpenBuffer(piece));
            }
            drop(state);

            match slot.accept(piece, offset, data, info.length)? {
                BlockAccept::Accepted => return Ok(WriteOutcome::Accepted),
                BlockAccept::Duplicate => return Ok(WriteOutcome::Duplicate),
                BlockAccept::Full(buffer) => buffer,
            }
        };

        let expected = info.hash;
        let (buffer, valid) = tokio::task::spawn_blocking(move || {
            let valid = Sha1::digest(&assembled).as_slice() == expected.as_slice();
            (assembled, valid)
        })
        .await
        .map_err(std::io::Error::other)
        .map_err(super::StorageError::from)?;

        if !valid {
            let mut state = self.state.lock();
            let dropped = state.drop_records_for(piece);
            state.in_flight.clear(piece as usize);
            *self.slots[piece as usize].lock() = PieceAssembly::Idle;
            warn!(
                "piece {} failed verification, {} peers re-select",
                piece,
                dropped.len()
            );
            return Err(RepositoryError::PieceCorrupt(piece));
        }

        if let Err(e) = self.storage.write(info.offset, &buffer).await {
            let mut state = self.state.lock();
            state.drop_records_for(piece);
            state.in_flight.clear(piece as usize);
            *self.slots[piece as usize].lock() = PieceAssembly::Idle;
            return Err(e.into());
        }

        let (displaced, completed) = {
            let mut state = self.state.lock();
            state.completed.set(piece as usize);
            state.in_flight.clear(piece as usize);
            *self.slots[piece as usize].lock() = PieceAssembly::Complete;
            (state.drop_records_for(piece), state.completed.count())
        };

        self.stats.piece_downloaded(info.length);
        info!(
            "piece {} complete ({}/{}, {:.1}%)",
            piece,
            completed,
            self.pieces.len(),
            completed as f64 * 100.0 / self.pieces.len().max(1) as f64
        );

        Ok(WriteOutcome::Completed { displaced })
    }

    /// Reads a block of a completed piece for upload.
    pub async fn read_block(
        &self,
        piece: u32,
        offset: u32,
        length: u32,
    ) -> Result<Bytes, RepositoryError> {
        let info = self.info(piece)?;

        if !self.state.lock().completed.has(piece as usize) {
            return Err(RepositoryError::NotOnDisk(piece));
        }
        if !info.contains_block(offset, length) {
            return Err(RepositoryError::InvalidBlock {
                piece,
                offset,
                length,
            });
        }

        Ok(self
            .storage
            .read(info.offset + offset as u64, length as usize)
            .await?)
    }

    /// Re-reads a piece from storage and marks it complete if its hash
    /// matches. Used on startup to resume without re-downloading.
    pub async fn check_on_disk(&self, piece: u32) -> Result<bool, RepositoryError> {
        let info = self.info(piece)?;

        if self.state.lock().completed.has(piece as usize) {
            return Ok(true);
        }

        let data = self.storage.read(info.offset, info.length as usize).await?;
        let expected = info.hash;
        let valid = tokio::task::spawn_blocking(move || {
            Sha1::digest(&data).as_slice() == expected.as_slice()
        })
        .await
        .map_err(std::io::Error::other)
        .map_err(super::StorageError::from)?;

        if valid {
            let mut state = self.state.lock();
            if state.completed.set(piece as usize) {
                state.in_flight.clear(piece as usize);
                *self.slots[piece as usize].lock() = PieceAssembly::Complete;
                self.stats.piece_present(info.length);
            }
        }

        Ok(valid)
    }

    /// Finalizes storage once every piece is complete. Returns true only for
    /// the call that performed the finalization.
    pub async fn finalize_if_complete(&self) -> Result<bool, RepositoryError> {
        if !self.is_complete() || self.finalized.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        if let Err(e) = self.storage.complete().await {
            self.finalized.store(false, Ordering::Release);
            return Err(e.into());
        }
        Ok(true)
    }

    pub async fn close(&self) -> Result<(), RepositoryError> {
        Ok(self.storage.close().await?)
    }

    // ---------------------------------------------------------------------
    // Progress
    // ---------------------------------------------------------------------

    fn endgame_reached(&self, state: &RepositoryState) -> bool {
        let total = self.pieces.len();
        total > 0 && state.completed.count() as f64 >= self.endgame_threshold * total as f64
    }

    pub fn has_reached_endgame(&self) -> bool {
        let state = self.state.lock();
        self.endgame_reached(&state)
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().completed.is_complete()
    }

    pub fn is_piece_complete(&self, index: u32) -> bool {
        self.state.lock().completed.has(index as usize)
    }

    pub fn completed_count(&self) -> usize {
        self.state.lock().completed.count()
    }

    /// Copy of the completed-piece bitmap, as sent in a `bitfield` message.
    pub fn completed_bitfield(&self) -> Bitfield {
        self.state.lock().completed.clone()
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.count()
    }

    pub fn is_in_flight(&self, index: u32) -> bool {
        self.state.lock().in_flight.has(index as usize)
    }
}
