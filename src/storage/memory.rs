use super::error::StorageError;
use super::FileStorage;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Storage backed by a single in-memory buffer.
///
/// Used for tests and for seeding content that is already in memory.
pub struct MemoryStorage {
    data: RwLock<Vec<u8>>,
    completed: AtomicBool,
    closed: AtomicBool,
}

impl MemoryStorage {
    /// Zero-filled storage of `size` bytes.
    pub fn new(size: u64) -> Self {
        Self {
            data: RwLock::new(vec![0; size as usize]),
            completed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Storage pre-filled with `data`, e.g. the full content of a seed.
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            completed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    fn range(&self, offset: u64, length: usize) -> Result<std::ops::Range<usize>, StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        let size = self.data.read().len() as u64;
        match offset.checked_add(length as u64) {
            Some(end) if end <= size => Ok(offset as usize..end as usize),
            _ => Err(StorageError::InvalidRange {
                offset,
                length: length as u64,
            }),
        }
    }
}

#[async_trait]
impl FileStorage for MemoryStorage {
    async fn read(&self, offset: u64, length: usize) -> Result<Bytes, StorageError> {
        let range = self.range(offset, length)?;
        Ok(Bytes::copy_from_slice(&self.data.read()[range]))
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<usize, StorageError> {
        let range = self.range(offset, data.len())?;
        self.data.write()[range].copy_from_slice(data);
        Ok(data.len())
    }

    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    async fn complete(&self) -> Result<(), StorageError> {
        self.completed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
