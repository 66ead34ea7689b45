use super::bitfield::Bitfield;
use super::choking::ChokingState;
use super::error::PeerError;
use super::manager::Swarm;
use super::message::Message;
use super::peer_id::PeerId;
use super::piece::{Block, BlockRequest};
use super::rate::RateAccumulator;
use super::transport::{FrameReader, FrameWriter};
use crate::constants::MAX_REQUEST_LENGTH;
use crate::storage::{PieceRepository, RepositoryError, WriteOutcome};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// Items on a session's outbound queue.
#[derive(Debug)]
pub enum Outbound {
    Send(Message),
    Close,
}

/// One bound peer connection.
///
/// The session owns the four choke/interest flags of the connection and
/// turns inbound messages into repository operations. Outbound traffic goes
/// through a FIFO queue drained by a dedicated writer task, so nothing here
/// ever blocks on the socket. `am_choking` is only written by the choking
/// pass through [`PeerSession::set_am_choking`].
pub struct PeerSession {
    addr: SocketAddr,
    peer_id: PeerId,
    state: Mutex<ChokingState>,
    download_rate: RateAccumulator,
    upload_rate: RateAccumulator,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Blocks we asked this peer for and have not received yet.
    requested: Mutex<HashSet<BlockRequest>>,
    /// Blocks we cancelled. A late copy is dropped rather than treated as
    /// unsolicited; the set is cleared when the peer unchokes us again.
    cancelled: Mutex<HashSet<BlockRequest>>,
    /// Requests from the peer whose `piece` response has not been sent.
    pending_uploads: Mutex<HashSet<BlockRequest>>,
    bound: AtomicBool,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("addr", &self.addr)
            .field("peer_id", &self.peer_id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl PeerSession {
    pub(crate) fn new(
        addr: SocketAddr,
        peer_id: PeerId,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            addr,
            peer_id,
            state: Mutex::new(ChokingState::default()),
            download_rate: RateAccumulator::new(),
            upload_rate: RateAccumulator::new(),
            outbound,
            requested: Mutex::new(HashSet::new()),
            cancelled: Mutex::new(HashSet::new()),
            pending_uploads: Mutex::new(HashSet::new()),
            bound: AtomicBool::new(true),
            closed: watch::channel(false).0,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn choking_state(&self) -> ChokingState {
        *self.state.lock()
    }

    pub fn download_rate(&self) -> f64 {
        self.download_rate.rate()
    }

    pub fn upload_rate(&self) -> f64 {
        self.upload_rate.rate()
    }

    pub fn reset_rates(&self) {
        self.download_rate.reset();
        self.upload_rate.reset();
    }

    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    /// Blocks asked of this peer that may still arrive, cancelled ones
    /// included.
    pub fn outstanding_requests(&self) -> usize {
        self.requested.lock().len() + self.cancelled.lock().len()
    }

    /// Queues a message for the writer task. Dropped silently once the
    /// connection is closing.
    pub fn send(&self, message: Message) {
        let _ = self.outbound.send(Outbound::Send(message));
    }

    fn is_connected(&self) -> bool {
        !self.outbound.is_closed() && !*self.closed.borrow()
    }

    /// Chokes or unchokes the peer. Returns true if the flag changed.
    ///
    /// Choking drops every upload we had not sent yet.
    pub fn set_am_choking(&self, choking: bool) -> bool {
        {
            let mut state = self.state.lock();
            if state.am_choking == choking {
                return false;
            }
            state.am_choking = choking;
        }

        if choking {
            self.pending_uploads.lock().clear();
            self.send(Message::Choke);
        } else {
            self.send(Message::Unchoke);
        }
        true
    }

    fn set_am_interested(&self, interested: bool) {
        {
            let mut state = self.state.lock();
            if state.am_interested == interested {
                return;
            }
            state.am_interested = interested;
        }
        self.send(if interested {
            Message::Interested
        } else {
            Message::NotInterested
        });
    }

    /// Re-evaluates our interest after the set of missing pieces shrank.
    pub(crate) fn refresh_interest(&self, repository: &PieceRepository) {
        let has_work = repository.current_piece(&self.peer_id).is_some()
            || repository.downloadable_count(&self.peer_id) > 0;
        if !has_work {
            self.set_am_interested(false);
        }
    }

    /// Keeps the request pipeline full: picks a piece when idle and queues
    /// block requests up to the repository's queue capacity.
    pub(crate) fn fill_pipeline(&self, repository: &PieceRepository) {
        {
            let state = self.state.lock();
            if state.peer_choking || !state.am_interested || !self.is_bound() {
                return;
            }
        }

        if repository.current_piece(&self.peer_id).is_none() {
            match repository.select_next_piece(&self.peer_id) {
                Ok(Some(_)) | Err(RepositoryError::AlreadyDownloading) => {}
                Ok(None) => return,
                Err(e) => {
                    debug!("{}: piece selection failed: {}", self.addr, e);
                    return;
                }
            }
        }

        let blocks = repository.next_block_requests(&self.peer_id);
        if blocks.is_empty() {
            return;
        }

        self.requested.lock().extend(blocks.iter().copied());
        for block in &blocks {
            self.send(Message::request(block));
        }
    }

    /// Sends `cancel` for blocks we no longer want from this peer.
    pub(crate) fn cancel_blocks(&self, blocks: &[BlockRequest]) {
        {
            let mut requested = self.requested.lock();
            let mut cancelled = self.cancelled.lock();
            for block in blocks {
                if requested.remove(block) {
                    cancelled.insert(*block);
                }
            }
        }
        for block in blocks {
            self.send(Message::cancel(block));
        }
    }

    /// Moves every outstanding request to the cancelled set. A choking peer
    /// discards our requests, so no `cancel` is sent.
    fn forget_requests(&self) {
        let mut requested = self.requested.lock();
        self.cancelled.lock().extend(requested.drain());
    }

    /// Dispatches one inbound message. `first` is true for the first
    /// message after the handshake.
    pub(crate) async fn handle_message(
        &self,
        message: Message,
        first: bool,
        swarm: &Swarm,
    ) -> Result<(), PeerError> {
        let repository = swarm.repository();
        trace!("{} <- {}", self.addr, message.name());

        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.state.lock().peer_choking = true;
                self.forget_requests();
                let cancelled = repository.cancel_all(&self.peer_id);
                if !cancelled.is_empty() {
                    debug!(
                        "{} choked us with {} blocks in flight",
                        self.addr,
                        cancelled.len()
                    );
                    swarm.wake_idle(Some(&self.peer_id));
                }
            }
            Message::Unchoke => {
                self.state.lock().peer_choking = false;
                self.cancelled.lock().clear();
                self.fill_pipeline(repository);
            }
            Message::Interested => {
                self.state.lock().peer_interested = true;
            }
            Message::NotInterested => {
                self.state.lock().peer_interested = false;
            }
            Message::Have { piece } => {
                repository.set_peer_has_piece(&self.peer_id, piece, true)?;
                if repository.is_piece_downloadable(piece) {
                    self.set_am_interested(true);
                }
                self.fill_pipeline(repository);
            }
            Message::Bitfield(bytes) => {
                if !first {
                    return Err(PeerError::Protocol(
                        "bitfield must be the first message".into(),
                    ));
                }
                let bits = Bitfield::from_bytes(&bytes, repository.piece_count())?;
                repository.apply_availability(&self.peer_id, &bits, true);
                if repository.downloadable_count(&self.peer_id) > 0 {
                    self.set_am_interested(true);
                }
                self.fill_pipeline(repository);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                self.handle_request(BlockRequest::new(index, begin, length), repository)
                    .await?;
            }
            Message::Piece { index, begin, data } => {
                self.handle_block(Block::new(index, begin, data), swarm)
                    .await?;
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                self.pending_uploads
                    .lock()
                    .remove(&BlockRequest::new(index, begin, length));
            }
        }

        Ok(())
    }

    async fn handle_request(
        &self,
        block: BlockRequest,
        repository: &PieceRepository,
    ) -> Result<(), PeerError> {
        if self.state.lock().am_choking {
            return Err(PeerError::Protocol("request while choked".into()));
        }
        if block.length > MAX_REQUEST_LENGTH {
            return Err(PeerError::Protocol(format!(
                "request of {} bytes exceeds maximum",
                block.length
            )));
        }
        if !repository.is_piece_complete(block.piece) {
            return Err(PeerError::Protocol(format!(
                "request for piece {} which is not on disk",
                block.piece
            )));
        }
        let piece_length = repository.piece_length(block.piece).unwrap_or(0);
        if !block.fits(piece_length) {
            return Err(PeerError::Protocol(format!(
                "request [{}, {}) out of bounds for piece {} of {} bytes",
                block.offset,
                block.end(),
                block.piece,
                piece_length
            )));
        }

        self.pending_uploads.lock().insert(block);
        let data = repository
            .read_block(block.piece, block.offset, block.length)
            .await?;

        if self.pending_uploads.lock().contains(&block) {
            self.send(Message::Piece {
                index: block.piece,
                begin: block.offset,
                data,
            });
        }
        Ok(())
    }

    async fn handle_block(&self, received: Block, swarm: &Swarm) -> Result<(), PeerError> {
        let repository = swarm.repository();
        let block = received.request();

        if !self.requested.lock().remove(&block) {
            if self.cancelled.lock().remove(&block) {
                trace!(
                    "{}: dropping cancelled block {}:{}",
                    self.addr,
                    block.piece,
                    block.offset
                );
                self.download_rate.add(block.length as u64);
                return Ok(());
            }
            return Err(PeerError::Protocol(format!(
                "unrequested block {}:{}+{}",
                block.piece, block.offset, block.length
            )));
        }
        self.download_rate.add(block.length as u64);

        if !repository.mark_block_acked(&self.peer_id, block.piece, block.offset) {
            trace!(
                "{}: dropping released block {}:{}",
                self.addr,
                block.piece,
                block.offset
            );
            self.fill_pipeline(repository);
            return Ok(());
        }

        let endgame = repository.has_reached_endgame();
        if endgame && repository.check_piece_has_block(block.piece, block.offset) {
            debug!(
                "{}: block {}:{} already supplied by another peer",
                self.addr, block.piece, block.offset
            );
            self.fill_pipeline(repository);
            return Ok(());
        }

        match repository
            .write_block(block.piece, block.offset, &received.data)
            .await
        {
            Ok(WriteOutcome::Accepted) => {
                if endgame {
                    let redundant =
                        repository.take_redundant_requests(block.piece, block.offset, &self.peer_id);
                    swarm.send_cancels(redundant);
                }
            }
            Ok(WriteOutcome::Completed { displaced }) => {
                swarm.piece_completed(block.piece, &self.peer_id, displaced).await;
            }
            Ok(WriteOutcome::Duplicate) => {}
            Err(RepositoryError::PieceCorrupt(piece)) => {
                warn!("{}: piece {} failed hash check", self.addr, piece);
                swarm.wake_idle(None);
            }
            Err(e) => return Err(e.into()),
        }

        self.fill_pipeline(repository);
        Ok(())
    }

    /// Detaches the session: its availability and request records leave the
    /// repository, outstanding requests are cancelled and `not_interested`
    /// is sent while the connection is still up, then the connection is
    /// closed. Returns false if the session was already unbound.
    pub(crate) fn unbind(&self, repository: &PieceRepository) -> bool {
        if !self.bound.swap(false, Ordering::AcqRel) {
            return false;
        }

        let cancelled = repository.unregister_peer(&self.peer_id);
        if self.is_connected() {
            self.cancel_blocks(&cancelled);
            if self.state.lock().am_interested {
                self.send(Message::NotInterested);
            }
        }
        self.close();
        true
    }

    /// Asks both tasks to stop. Messages already queued are still written.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
        self.closed.send_replace(true);
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

/// Reads and dispatches messages until the connection fails or the session
/// is closed, then unbinds the session.
pub(crate) async fn run_reader<R>(session: Arc<PeerSession>, mut reader: FrameReader<R>, swarm: Arc<Swarm>)
where
    R: AsyncRead + Unpin,
{
    let mut closed = session.closed();
    let mut first = true;

    let result: Result<(), PeerError> = async {
        loop {
            if *closed.borrow_and_update() {
                return Ok(());
            }
            let message = tokio::select! {
                message = reader.receive_message() => message?,
                _ = closed.changed() => continue,
            };

            let keepalive = matches!(message, Message::KeepAlive);
            session.handle_message(message, first, &swarm).await?;
            if !keepalive {
                first = false;
            }
        }
    }
    .await;

    match result {
        Ok(()) | Err(PeerError::ConnectionClosed) => {
            debug!("{} disconnected", session.addr);
        }
        Err(e) if e.is_protocol_violation() => {
            warn!("{} violated the protocol: {}", session.addr, e);
        }
        Err(e) if e.is_local_storage_failure() => {
            warn!("storage failure while serving {}: {}", session.addr, e);
            swarm.report_storage_failure(&e);
        }
        Err(e) => {
            debug!("{} connection error: {}", session.addr, e);
        }
    }

    swarm.unbind(&session);
}

/// Drains the outbound queue onto the socket, substituting a keep-alive
/// whenever nothing was queued for `keepalive`.
pub(crate) async fn run_writer<W>(
    session: Arc<PeerSession>,
    mut writer: FrameWriter<W>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    keepalive: Duration,
    swarm: Arc<Swarm>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let item = match tokio::time::timeout(keepalive, queue.recv()).await {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(_) => Outbound::Send(Message::KeepAlive),
        };

        let message = match item {
            Outbound::Close => break,
            Outbound::Send(message) => message,
        };

        let upload = match &message {
            Message::Piece { index, begin, data } => {
                let block = BlockRequest::new(*index, *begin, data.len() as u32);
                if !session.pending_uploads.lock().remove(&block) {
                    trace!("{}: upload {}:{} cancelled", session.addr, index, begin);
                    continue;
                }
                Some(data.len() as u64)
            }
            _ => None,
        };

        if let Err(e) = writer.send_message(&message).await {
            debug!("{}: write failed: {}", session.addr, e);
            session.close();
            break;
        }

        if let Some(bytes) = upload {
            session.upload_rate.add(bytes);
            swarm.repository().stats().add_uploaded(bytes);
        }
    }

    let _ = writer.shutdown().await;
}
