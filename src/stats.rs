//! Session-wide byte counters reported to the tracker.

use std::sync::atomic::{AtomicU64, Ordering};

/// Uploaded / downloaded / left counters shared by every peer session.
///
/// `downloaded` and `left` only move when a piece passes hash verification,
/// so they always describe verified data.
#[derive(Debug)]
pub struct TransferStats {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    left: AtomicU64,
}

/// A point-in-time copy of [`TransferStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferSnapshot {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

impl TransferStats {
    pub fn new(total_length: u64) -> Self {
        Self {
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            left: AtomicU64::new(total_length),
        }
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A piece was downloaded and verified.
    pub fn piece_downloaded(&self, length: u64) {
        self.downloaded.fetch_add(length, Ordering::Relaxed);
        self.piece_present(length);
    }

    /// A piece was found intact on disk.
    pub fn piece_present(&self, length: u64) {
        let _ = self
            .left
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| {
                Some(left.saturating_sub(length))
            });
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            left: self.left.load(Ordering::Relaxed),
        }
    }
}
