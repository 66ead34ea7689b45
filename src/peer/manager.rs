use super::choking::{ChokingAlgorithm, ChokingDecision, PeerStats};
use super::error::PeerError;
use super::handshake::Handshake;
use super::message::Message;
use super::peer_id::PeerId;
use super::piece::BlockRequest;
use super::registry::PeerRegistry;
use super::session::{run_reader, run_writer, PeerSession};
use super::transport::PeerTransport;
use crate::config::SessionConfig;
use crate::storage::PieceRepository;
use crate::torrent::TorrentEvent;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// A peer as announced by a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerPeer {
    pub addr: SocketAddr,
    pub peer_id: Option<PeerId>,
}

/// Which side opens the handshake on a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// We dialed; the peer id must match when the tracker supplied one.
    Outbound(Option<PeerId>),
    Inbound,
}

impl TrackerPeer {
    pub fn new(addr: SocketAddr, peer_id: Option<PeerId>) -> Self {
        Self { addr, peer_id }
    }
}

/// State shared by the manager and every session task.
pub(crate) struct Swarm {
    info_hash: [u8; 20],
    local_id: PeerId,
    config: SessionConfig,
    repository: Arc<PieceRepository>,
    registry: PeerRegistry,
    events: mpsc::UnboundedSender<TorrentEvent>,
    half_open: Arc<Semaphore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopping: AtomicBool,
}

impl Swarm {
    pub(crate) fn repository(&self) -> &PieceRepository {
        &self.repository
    }

    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(tokio::spawn(future));
    }

    fn emit(&self, event: TorrentEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn report_storage_failure(&self, error: &PeerError) {
        self.emit(TorrentEvent::StorageFailure(error.to_string()));
    }

    /// Sends `cancel` for each `(peer, block)` to the matching connection.
    pub(crate) fn send_cancels(&self, cancels: Vec<(PeerId, BlockRequest)>) {
        for (peer, block) in cancels {
            if let Some(session) = self.registry.session(&peer) {
                trace!("cancelling {}:{} on {}", block.piece, block.offset, session.addr());
                session.cancel_blocks(&[block]);
            }
        }
    }

    /// Lets every idle session pick up work, e.g. after a piece was released.
    pub(crate) fn wake_idle(&self, except: Option<&PeerId>) {
        for session in self.registry.sessions() {
            if Some(&session.peer_id()) != except {
                session.fill_pipeline(&self.repository);
            }
        }
    }

    /// Follow-up of a verified piece: cancel redundant requests, announce the
    /// piece, drop interest where nothing is left and refill pipelines.
    pub(crate) async fn piece_completed(
        &self,
        piece: u32,
        source: &PeerId,
        displaced: Vec<(PeerId, Vec<BlockRequest>)>,
    ) {
        for (peer, blocks) in displaced {
            if let Some(session) = self.registry.session(&peer) {
                session.cancel_blocks(&blocks);
            }
        }

        for session in self.registry.sessions() {
            if &session.peer_id() != source {
                session.send(Message::Have { piece });
            }
        }
        self.emit(TorrentEvent::PieceCompleted(piece));

        match self.repository.finalize_if_complete().await {
            Ok(true) => {
                info!("download complete, now seeding");
                self.emit(TorrentEvent::DownloadComplete);
            }
            Ok(false) => {}
            Err(e) => {
                warn!("failed to finalize storage: {}", e);
                self.emit(TorrentEvent::StorageFailure(e.to_string()));
            }
        }

        for session in self.registry.sessions() {
            session.refresh_interest(&self.repository);
            session.fill_pipeline(&self.repository);
        }
    }

    /// Detaches a session from the repository and the registry. Safe to
    /// call any number of times.
    pub(crate) fn unbind(&self, session: &Arc<PeerSession>) {
        if !session.unbind(&self.repository) {
            return;
        }
        self.registry.disconnect(session);
        debug!("unbound {} ({})", session.addr(), session.peer_id());

        if !self.stopping.load(Ordering::Acquire) {
            self.wake_idle(Some(&session.peer_id()));
        }
    }
}

/// Connected peers of one torrent and the periodic choking pass.
///
/// The manager accepts inbound connections, dials peers handed over by a
/// tracker, binds a [`PeerSession`] to each handshaked connection and runs
/// the choker on a timer. It is the only component that changes whether we
/// choke a peer.
pub struct PeerManager {
    swarm: Arc<Swarm>,
    choker: Arc<Mutex<ChokingAlgorithm>>,
    choker_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerManager {
    pub fn new(
        info_hash: [u8; 20],
        local_id: PeerId,
        repository: Arc<PieceRepository>,
        config: SessionConfig,
        events: mpsc::UnboundedSender<TorrentEvent>,
    ) -> Self {
        let choker = ChokingAlgorithm::new(config.choking.clone());
        let swarm = Swarm {
            info_hash,
            local_id,
            registry: PeerRegistry::new(config.max_known_peers, config.max_connected_peers),
            half_open: Arc::new(Semaphore::new(config.max_half_open.max(1))),
            config,
            repository,
            events,
            tasks: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
        };

        Self {
            swarm: Arc::new(swarm),
            choker: Arc::new(Mutex::new(choker)),
            choker_task: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.swarm.registry
    }

    pub fn local_id(&self) -> PeerId {
        self.swarm.local_id
    }

    fn handshake(&self) -> Handshake {
        Handshake::new(self.swarm.info_hash, self.swarm.local_id)
    }

    /// Registers tracker peers and dials those not yet connected. Returns
    /// how many were accepted into the known-peer set.
    pub fn add_peers<I>(&self, peers: I) -> usize
    where
        I: IntoIterator<Item = TrackerPeer>,
    {
        let added = peers
            .into_iter()
            .filter(|p| self.swarm.registry.add(p.addr, p.peer_id).is_some())
            .count();
        self.connect_known();
        added
    }

    /// Starts one connection attempt per known, unconnected peer while
    /// connection slots remain.
    pub fn connect_known(&self) {
        if self.swarm.stopping.load(Ordering::Acquire) {
            return;
        }

        for record in self.swarm.registry.connect_candidates() {
            if !self.swarm.registry.has_capacity() {
                break;
            }
            if !record.begin_connect() {
                continue;
            }

            let swarm = self.swarm.clone();
            let ours = self.handshake();
            self.swarm.spawn(async move {
                let addr = record.addr();
                let expected = record.peer_id();

                let result = async {
                    let _permit = swarm
                        .half_open
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|_| PeerError::ConnectionClosed)?;

                    let stream = tokio::time::timeout(
                        swarm.config.connection_timeout,
                        TcpStream::connect(addr),
                    )
                    .await
                    .map_err(|_| PeerError::Timeout)??;

                    let mut transport = PeerTransport::new(stream);
                    let theirs = transport
                        .initiate(&ours, expected.as_ref(), swarm.config.handshake_timeout)
                        .await?;
                    Ok::<_, PeerError>((transport, theirs))
                }
                .await;

                match result {
                    Ok((transport, theirs)) => {
                        swarm.registry.promote(addr, theirs.peer_id);
                        bind(&swarm, transport, addr, theirs.peer_id);
                    }
                    Err(e) => debug!("connection to {} failed: {}", addr, e),
                }
                record.end_connect();
            });
        }
    }

    /// Handles an inbound TCP connection.
    pub fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        let swarm = self.swarm.clone();
        let ours = self.handshake();
        self.swarm.spawn(async move {
            if let Err(e) = attach_inbound(&swarm, stream, addr, ours).await {
                debug!("inbound connection from {} rejected: {}", addr, e);
            }
        });
    }

    /// Runs the handshake over an established stream and binds a session.
    ///
    /// `role` selects who speaks first. Returns `Ok(None)` when the
    /// handshake succeeded but the peer could not be taken right now
    /// (already connected, or no connection slot left).
    pub async fn attach<S>(
        &self,
        stream: S,
        addr: SocketAddr,
        role: ConnectionRole,
    ) -> Result<Option<Arc<PeerSession>>, PeerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ours = self.handshake();
        let mut transport = PeerTransport::new(stream);
        let limit = self.swarm.config.handshake_timeout;

        let theirs = match role {
            ConnectionRole::Outbound(expected) => {
                transport.initiate(&ours, expected.as_ref(), limit).await?
            }
            ConnectionRole::Inbound => transport.respond(&ours, limit).await?,
        };

        self.swarm.registry.promote(addr, theirs.peer_id);
        Ok(bind(&self.swarm, transport, addr, theirs.peer_id))
    }

    pub fn session(&self, peer_id: &PeerId) -> Option<Arc<PeerSession>> {
        self.swarm.registry.session(peer_id)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.swarm
            .registry
            .sessions()
            .iter()
            .map(|s| s.peer_id())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.swarm.registry.connected_count()
    }

    /// Disconnects a peer. A no-op if it is not connected.
    pub fn disconnect(&self, peer_id: &PeerId) {
        if let Some(session) = self.swarm.registry.session(peer_id) {
            self.swarm.unbind(&session);
        }
    }

    /// Sum of the current download and upload rates, in bytes per second.
    pub fn rates(&self) -> (f64, f64) {
        self.swarm
            .registry
            .sessions()
            .iter()
            .fold((0.0, 0.0), |(down, up), s| {
                (down + s.download_rate(), up + s.upload_rate())
            })
    }

    /// Runs one choking pass and applies it. The ranking key is the
    /// download rate while downloading and the upload rate once seeding.
    pub fn run_choking_pass(&self) -> ChokingDecision<PeerId> {
        run_choking_pass(&self.swarm, &self.choker)
    }

    /// Starts the periodic choking pass.
    pub fn start_choker(&self) {
        let mut task = self.choker_task.lock();
        if task.is_some() {
            return;
        }

        let swarm = self.swarm.clone();
        let choker = self.choker.clone();
        let period = self.swarm.config.choking.interval;
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if swarm.stopping.load(Ordering::Acquire) {
                    break;
                }
                run_choking_pass(&swarm, &choker);
            }
        }));
    }

    /// Stops the choker, unbinds every session and waits up to the grace
    /// period for peer tasks to finish before aborting the rest.
    pub async fn shutdown(&self) {
        if self.swarm.stopping.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(task) = self.choker_task.lock().take() {
            task.abort();
        }

        for session in self.swarm.registry.sessions() {
            self.swarm.unbind(&session);
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.swarm.tasks.lock());
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();

        if tokio::time::timeout(
            self.swarm.config.shutdown_grace,
            futures::future::join_all(tasks),
        )
        .await
        .is_err()
        {
            warn!("peer tasks did not stop within the grace period, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

fn run_choking_pass(swarm: &Swarm, choker: &Mutex<ChokingAlgorithm>) -> ChokingDecision<PeerId> {
    let sessions = swarm.registry.sessions();
    let stats: Vec<PeerStats<PeerId>> = sessions
        .iter()
        .map(|s| PeerStats {
            peer: s.peer_id(),
            download_rate: s.download_rate(),
            upload_rate: s.upload_rate(),
            interested: s.choking_state().peer_interested,
        })
        .collect();

    let seeding = swarm.repository.is_complete();
    let (decision, pass) = {
        let mut choker = choker.lock();
        let decision = choker.run_pass(&stats, seeding);
        (decision, choker.passes())
    };

    for session in &sessions {
        let id = session.peer_id();
        if decision.unchoked().any(|p| *p == id) {
            session.set_am_choking(false);
        } else {
            session.set_am_choking(true);
        }
    }

    if decision.reset_rates {
        for session in &sessions {
            session.reset_rates();
        }
    }

    debug!(
        "choking pass {} over {} peers: {} unchoked, optimistic {:?}",
        pass,
        sessions.len(),
        decision.unchoke.len(),
        decision.optimistic
    );
    decision
}

async fn attach_inbound(
    swarm: &Arc<Swarm>,
    stream: TcpStream,
    addr: SocketAddr,
    ours: Handshake,
) -> Result<(), PeerError> {
    if !swarm.registry.reserve(&addr) {
        return Err(PeerError::Protocol("known peer limit reached".into()));
    }

    let mut transport = PeerTransport::new(stream);
    let theirs = transport
        .respond(&ours, swarm.config.handshake_timeout)
        .await?;

    swarm.registry.promote(addr, theirs.peer_id);
    bind(swarm, transport, addr, theirs.peer_id);
    Ok(())
}

/// Binds a session to a handshaked connection and spawns its reader and
/// writer tasks. The first message sent is our bitfield when we hold any
/// piece.
fn bind<S>(
    swarm: &Arc<Swarm>,
    transport: PeerTransport<S>,
    addr: SocketAddr,
    peer_id: PeerId,
) -> Option<Arc<PeerSession>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if swarm.stopping.load(Ordering::Acquire) || peer_id == swarm.local_id {
        return None;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let session = Arc::new(PeerSession::new(addr, peer_id, tx));

    if !swarm.registry.connect(session.clone()) {
        debug!("not binding {} ({}): duplicate or no slot", addr, peer_id);
        return None;
    }

    swarm.repository.register_peer(peer_id);

    let completed = swarm.repository.completed_bitfield();
    if !completed.is_empty() {
        session.send(Message::Bitfield(completed.to_bytes()));
    }

    let (reader, writer) = transport.into_split();
    swarm.spawn(run_writer(
        session.clone(),
        writer,
        rx,
        swarm.config.keepalive_interval,
        swarm.clone(),
    ));
    swarm.spawn(run_reader(session.clone(), reader, swarm.clone()));

    info!("bound {} ({})", addr, peer_id);
    Some(session)
}
