use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng};

/// Rarest-first piece picker.
///
/// Candidates are narrowed to those with the lowest availability count, the
/// first `max_pool` of them (by index) are kept, and one is drawn uniformly.
/// Drawing at random keeps peers that see the same availability from all
/// converging on one piece.
pub struct PieceSelector {
    rng: StdRng,
    max_pool: usize,
}

impl PieceSelector {
    pub fn new(max_pool: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            rng,
            max_pool: max_pool.max(1),
        }
    }

    /// Picks among `candidates` using `frequency[i]` as the rarity of piece `i`.
    pub fn pick<I>(&mut self, candidates: I, frequency: &[u32]) -> Option<u32>
    where
        I: IntoIterator<Item = usize>,
    {
        let mut rarest = u32::MAX;
        let mut pool: Vec<usize> = Vec::with_capacity(self.max_pool);

        for index in candidates {
            let freq = frequency.get(index).copied().unwrap_or(0);
            if freq < rarest {
                rarest = freq;
                pool.clear();
            }
            if freq == rarest && pool.len() < self.max_pool {
                pool.push(index);
            }
        }

        if pool.is_empty() {
            return None;
        }

        let chosen = pool[self.rng.random_range(0..pool.len())];
        Some(chosen as u32)
    }
}
