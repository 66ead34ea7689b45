use crate::config::ChokingConfig;
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng};
use std::cmp::Ordering;

/// The choke/interest flags of one connection, in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokingState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for ChokingState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// What the choking pass needs to know about one connected peer.
#[derive(Debug, Clone)]
pub struct PeerStats<K> {
    pub peer: K,
    pub download_rate: f64,
    pub upload_rate: f64,
    pub interested: bool,
}

/// Outcome of one pass: the full set of peers to unchoke and to choke.
#[derive(Debug, Clone, PartialEq)]
pub struct ChokingDecision<K> {
    /// Peers unchoked on rank, best first.
    pub unchoke: Vec<K>,
    /// Peer unchoked at random this pass, if any.
    pub optimistic: Option<K>,
    pub choke: Vec<K>,
    /// Rate accumulators should be reset after applying the decision.
    pub reset_rates: bool,
}

impl<K> ChokingDecision<K> {
    /// Every peer that ends the pass unchoked.
    pub fn unchoked(&self) -> impl Iterator<Item = &K> {
        self.unchoke.iter().chain(self.optimistic.iter())
    }
}

/// Tit-for-tat choker.
///
/// Each pass ranks peers by the rate they give us (download rate while
/// downloading, upload rate while seeding), unchokes the best interested
/// ones and chokes the rest. Every `optimistic_every` passes one otherwise
/// choked peer is unchoked at random, and every `rate_reset_every` passes
/// the rate windows restart. A pass never unchokes more than
/// `max_unchoked + 1` peers.
pub struct ChokingAlgorithm {
    config: ChokingConfig,
    passes: u64,
    rng: StdRng,
}

impl ChokingAlgorithm {
    pub fn new(config: ChokingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            config,
            passes: 0,
            rng,
        }
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn run_pass<K>(&mut self, peers: &[PeerStats<K>], seeding: bool) -> ChokingDecision<K>
    where
        K: Clone + Ord,
    {
        self.passes += 1;
        let optimistic_pass = is_nth(self.passes, self.config.optimistic_every);
        let reset_rates = is_nth(self.passes, self.config.rate_reset_every);

        let rate = |p: &PeerStats<K>| {
            if seeding {
                p.upload_rate
            } else {
                p.download_rate
            }
        };

        let mut ranked: Vec<&PeerStats<K>> = peers.iter().collect();
        ranked.sort_by(|a, b| {
            rate(b)
                .partial_cmp(&rate(a))
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.peer.cmp(&b.peer))
        });

        let mut unchoke = Vec::new();
        let mut remaining = Vec::new();
        for stats in ranked {
            if stats.interested && unchoke.len() < self.config.max_unchoked {
                unchoke.push(stats.peer.clone());
            } else {
                remaining.push(stats.peer.clone());
            }
        }

        let optimistic = if optimistic_pass && !remaining.is_empty() {
            let index = self.rng.random_range(0..remaining.len());
            Some(remaining.remove(index))
        } else {
            None
        };

        ChokingDecision {
            unchoke,
            optimistic,
            choke: remaining,
            reset_rates,
        }
    }
}

fn is_nth(pass: u64, every: u64) -> bool {
    every > 0 && pass % every == 0
}
