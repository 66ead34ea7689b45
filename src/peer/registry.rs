use super::peer_id::PeerId;
use super::session::PeerSession;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// A peer we know of, connected or not.
///
/// Peers are first known by address (tracker list, inbound socket). The
/// handshake reveals their id, at which point the record is promoted and
/// also reachable by id.
#[derive(Debug)]
pub struct PeerRecord {
    addr: Mutex<SocketAddr>,
    peer_id: Mutex<Option<PeerId>>,
    connecting: AtomicBool,
    /// Set for addresses we can dial. Inbound peers only reveal an
    /// ephemeral port, so their records are dropped once they disconnect.
    dialable: AtomicBool,
}

impl PeerRecord {
    fn new(addr: SocketAddr, peer_id: Option<PeerId>, dialable: bool) -> Self {
        Self {
            addr: Mutex::new(addr),
            peer_id: Mutex::new(peer_id),
            connecting: AtomicBool::new(false),
            dialable: AtomicBool::new(dialable),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        *self.addr.lock()
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        *self.peer_id.lock()
    }

    /// Claims the record for a connection attempt. Returns false if an
    /// attempt is already running.
    pub fn begin_connect(&self) -> bool {
        !self.connecting.swap(true, Ordering::AcqRel)
    }

    pub fn end_connect(&self) {
        self.connecting.store(false, Ordering::Release);
    }

    pub fn is_dialable(&self) -> bool {
        self.dialable.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct KnownPeers {
    by_addr: HashMap<SocketAddr, Arc<PeerRecord>>,
    by_id: HashMap<PeerId, Arc<PeerRecord>>,
}

impl KnownPeers {
    /// Distinct records; a record may be reachable under several addresses.
    fn distinct(&self) -> Vec<Arc<PeerRecord>> {
        let mut records: Vec<Arc<PeerRecord>> = Vec::new();
        for record in self.by_addr.values().chain(self.by_id.values()) {
            if !records.iter().any(|r| Arc::ptr_eq(r, record)) {
                records.push(record.clone());
            }
        }
        records
    }

    /// Removes the record from both maps, aliases included.
    fn remove(&mut self, record: &Arc<PeerRecord>) {
        self.by_addr.retain(|_, r| !Arc::ptr_eq(r, record));
        self.by_id.retain(|_, r| !Arc::ptr_eq(r, record));
    }
}

/// Known and connected peers of one torrent.
pub struct PeerRegistry {
    known: Mutex<KnownPeers>,
    connected: DashMap<PeerId, Arc<PeerSession>>,
    max_known: usize,
    max_connected: usize,
}

impl PeerRegistry {
    pub fn new(max_known: usize, max_connected: usize) -> Self {
        Self {
            known: Mutex::new(KnownPeers::default()),
            connected: DashMap::new(),
            max_known,
            max_connected,
        }
    }

    /// Adds a peer discovered by address, with its id when the tracker
    /// supplied one. A peer already known under either key is merged rather
    /// than duplicated. Returns `None` if the known-peer limit is reached.
    pub fn add(&self, addr: SocketAddr, peer_id: Option<PeerId>) -> Option<Arc<PeerRecord>> {
        let mut known = self.known.lock();

        if let Some(record) = known.by_addr.get(&addr).cloned() {
            let record = match peer_id {
                Some(id) => Self::attach_id(&mut known, record, addr, id),
                None => record,
            };
            record.dialable.store(true, Ordering::Release);
            return Some(record);
        }

        if let Some(id) = peer_id {
            if let Some(record) = known.by_id.get(&id).cloned() {
                known.by_addr.insert(addr, record.clone());
                *record.addr.lock() = addr;
                record.dialable.store(true, Ordering::Release);
                return Some(record);
            }
        }

        if known.distinct().len() >= self.max_known {
            return None;
        }

        let record = Arc::new(PeerRecord::new(addr, peer_id, true));
        known.by_addr.insert(addr, record.clone());
        if let Some(id) = peer_id {
            known.by_id.insert(id, record.clone());
        }
        Some(record)
    }

    /// Records the id a handshake revealed for `addr`.
    ///
    /// If the id already belongs to another record, the address is folded
    /// into it so both keys lead to one record.
    pub fn promote(&self, addr: SocketAddr, peer_id: PeerId) -> Arc<PeerRecord> {
        let mut known = self.known.lock();

        if let Some(record) = known.by_addr.get(&addr).cloned() {
            return Self::attach_id(&mut known, record, addr, peer_id);
        }
        if let Some(record) = known.by_id.get(&peer_id).cloned() {
            known.by_addr.insert(addr, record.clone());
            return record;
        }

        let record = Arc::new(PeerRecord::new(addr, Some(peer_id), false));
        known.by_addr.insert(addr, record.clone());
        known.by_id.insert(peer_id, record.clone());
        record
    }

    /// Makes room for a peer connecting from `addr`. Succeeds at once if
    /// the address is known or the known set has room; otherwise one record
    /// that is neither connected nor being dialed is forgotten. Returns
    /// false when every known record is in use.
    pub fn reserve(&self, addr: &SocketAddr) -> bool {
        let mut known = self.known.lock();
        if known.by_addr.contains_key(addr) {
            return true;
        }

        let records = known.distinct();
        if records.len() < self.max_known {
            return true;
        }

        let idle = records.into_iter().find(|r| {
            !r.connecting.load(Ordering::Acquire)
                && !matches!(r.peer_id(), Some(id) if self.is_connected(&id))
        });
        match idle {
            Some(record) => {
                trace!("forgetting idle peer {} to make room", record.addr());
                known.remove(&record);
                true
            }
            None => false,
        }
    }

    /// Indexes `record` (found at `addr`) under `id` and returns the record
    /// both keys now lead to.
    fn attach_id(
        known: &mut KnownPeers,
        record: Arc<PeerRecord>,
        addr: SocketAddr,
        id: PeerId,
    ) -> Arc<PeerRecord> {
        match known.by_id.get(&id).cloned() {
            Some(existing) if !Arc::ptr_eq(&existing, &record) => {
                if record.is_dialable() && !existing.is_dialable() {
                    *existing.addr.lock() = addr;
                    existing.dialable.store(true, Ordering::Release);
                }
                known.by_addr.insert(addr, existing.clone());
                existing
            }
            Some(_) => record,
            None => {
                if let Some(previous) = record.peer_id.lock().replace(id) {
                    known.by_id.remove(&previous);
                }
                *record.addr.lock() = addr;
                known.by_id.insert(id, record.clone());
                record
            }
        }
    }

    pub fn lookup_addr(&self, addr: &SocketAddr) -> Option<Arc<PeerRecord>> {
        self.known.lock().by_addr.get(addr).cloned()
    }

    pub fn lookup_id(&self, peer_id: &PeerId) -> Option<Arc<PeerRecord>> {
        self.known.lock().by_id.get(peer_id).cloned()
    }

    pub fn known_count(&self) -> usize {
        self.known.lock().distinct().len()
    }

    pub fn is_known_full(&self) -> bool {
        self.known_count() >= self.max_known
    }

    /// Known peers that are neither connected nor being connected to.
    pub fn connect_candidates(&self) -> Vec<Arc<PeerRecord>> {
        let records = self.known.lock().distinct();
        records
            .into_iter()
            .filter(|r| !r.connecting.load(Ordering::Acquire))
            .filter(|r| !matches!(r.peer_id(), Some(id) if self.is_connected(&id)))
            .collect()
    }

    /// Registers a bound session. Refused when the peer id is already
    /// connected or the connection limit is reached.
    pub fn connect(&self, session: Arc<PeerSession>) -> bool {
        if self.connected.len() >= self.max_connected {
            return false;
        }
        match self.connected.entry(session.peer_id()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(session);
                true
            }
        }
    }

    /// Removes the session if it is still the one registered for its id.
    ///
    /// The peer's record keeps only its dialable address; records of peers
    /// we cannot dial back are forgotten.
    pub fn disconnect(&self, session: &Arc<PeerSession>) {
        let removed = self
            .connected
            .remove_if(&session.peer_id(), |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if !removed {
            return;
        }

        let mut known = self.known.lock();
        let Some(record) = known.by_id.get(&session.peer_id()).cloned() else {
            return;
        };
        if record.is_dialable() {
            let home = record.addr();
            known
                .by_addr
                .retain(|addr, r| *addr == home || !Arc::ptr_eq(r, &record));
        } else {
            known.remove(&record);
        }
    }

    pub fn session(&self, peer_id: &PeerId) -> Option<Arc<PeerSession>> {
        self.connected.get(peer_id).map(|s| s.clone())
    }

    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.connected.iter().map(|s| s.value().clone()).collect()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.connected.contains_key(peer_id)
    }

    pub fn has_capacity(&self) -> bool {
        self.connected.len() < self.max_connected
    }
}
