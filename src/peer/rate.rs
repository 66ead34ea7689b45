use parking_lot::Mutex;
use std::time::Instant;

#[derive(Debug)]
struct Window {
    bytes: u64,
    started: Instant,
    last: Instant,
}

/// Bytes transferred over a window that the choking pass resets
/// periodically, so the rate reflects recent behaviour only.
#[derive(Debug)]
pub struct RateAccumulator {
    window: Mutex<Window>,
}

impl RateAccumulator {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            window: Mutex::new(Window {
                bytes: 0,
                started: now,
                last: now,
            }),
        }
    }

    pub fn add(&self, bytes: u64) {
        let mut window = self.window.lock();
        window.bytes += bytes;
        window.last = Instant::now();
    }

    /// Bytes per second between the start of the window and the last
    /// transfer. Zero if nothing was transferred.
    pub fn rate(&self) -> f64 {
        let window = self.window.lock();
        if window.bytes == 0 {
            return 0.0;
        }
        let elapsed = window
            .last
            .duration_since(window.started)
            .as_secs_f64()
            .max(0.001);
        window.bytes as f64 / elapsed
    }

    pub fn reset(&self) {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.bytes = 0;
        window.started = now;
        window.last = now;
    }
}

impl Default for RateAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
