use super::error::StorageError;
use super::file::{file_spans, FileEntry};
use super::FileStorage;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as TokioMutex;

/// Suffix of files that are still being downloaded.
pub const PART_EXTENSION: &str = "part";

fn validate_file_path(file_path: &Path) -> Result<(), StorageError> {
    for component in file_path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(file_path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

struct FileHandle {
    file: TokioMutex<File>,
    writable: bool,
}

/// Multi-file storage rooted at a directory.
///
/// While the download is in progress every file lives next to its final
/// location with a `.part` suffix. [`FileStorage::complete`] flushes and
/// renames them. A directory whose final files all exist and whose part
/// files are all gone is opened as already complete.
pub struct DiskStorage {
    base_path: PathBuf,
    files: Vec<FileEntry>,
    total_length: u64,
    handles: DashMap<usize, Arc<FileHandle>>,
    completed: AtomicBool,
    closed: AtomicBool,
}

impl DiskStorage {
    pub fn new(base_path: impl Into<PathBuf>, files: Vec<FileEntry>) -> Result<Self, StorageError> {
        for file in &files {
            validate_file_path(&file.path)?;
        }

        let base_path = base_path.into();
        let total_length = files.iter().map(|f| f.length).sum();
        let completed = !files.is_empty()
            && files.iter().all(|f| {
                let final_path = base_path.join(&f.path);
                final_path.exists() && !part_path(&final_path).exists()
            });

        Ok(Self {
            base_path,
            files,
            total_length,
            handles: DashMap::new(),
            completed: AtomicBool::new(completed),
            closed: AtomicBool::new(false),
        })
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Path the file currently lives at, `.part` included while incomplete.
    pub fn current_path(&self, file_index: usize) -> PathBuf {
        let final_path = self.base_path.join(&self.files[file_index].path);
        if self.completed.load(Ordering::Acquire) {
            final_path
        } else {
            part_path(&final_path)
        }
    }

    /// Creates every part file at its full length.
    pub async fn preallocate(&self) -> Result<(), StorageError> {
        if self.completed.load(Ordering::Acquire) {
            return Ok(());
        }

        for index in 0..self.files.len() {
            let path = self.current_path(index);
            ensure_parent_dirs(&path).await?;

            let f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .await?;

            f.set_len(self.files[index].length).await?;
        }

        Ok(())
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn check_range(&self, offset: u64, length: u64) -> Result<(), StorageError> {
        match offset.checked_add(length) {
            Some(end) if end <= self.total_length => Ok(()),
            _ => Err(StorageError::InvalidRange { offset, length }),
        }
    }

    async fn open_read(&self, file_index: usize) -> Result<Arc<FileHandle>, StorageError> {
        if let Some(handle) = self.handles.get(&file_index) {
            return Ok(handle.clone());
        }

        let path = self.current_path(file_index);
        let file = File::open(&path)
            .await
            .map_err(|_| StorageError::FileNotFound(path.display().to_string()))?;

        let handle = Arc::new(FileHandle {
            file: TokioMutex::new(file),
            writable: false,
        });
        self.handles.insert(file_index, handle.clone());
        Ok(handle)
    }

    async fn open_write(&self, file_index: usize) -> Result<Arc<FileHandle>, StorageError> {
        if let Some(handle) = self.handles.get(&file_index) {
            if handle.writable {
                return Ok(handle.clone());
            }
        }
        self.handles.remove(&file_index);

        let path = self.current_path(file_index);
        ensure_parent_dirs(&path).await?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;

        let handle = Arc::new(FileHandle {
            file: TokioMutex::new(file),
            writable: true,
        });
        self.handles.insert(file_index, handle.clone());
        Ok(handle)
    }

    async fn flush_all(&self) -> Result<(), StorageError> {
        let keys: Vec<usize> = self.handles.iter().map(|r| *r.key()).collect();
        for key in keys {
            if let Some((_, handle)) = self.handles.remove(&key) {
                if handle.writable {
                    let file = handle.file.lock().await;
                    file.sync_data().await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FileStorage for DiskStorage {
    async fn read(&self, offset: u64, length: usize) -> Result<Bytes, StorageError> {
        self.check_open()?;
        self.check_range(offset, length as u64)?;

        let mut data = Vec::with_capacity(length);
        for span in file_spans(&self.files, offset, length as u64) {
            let handle = self.open_read(span.file_index).await?;
            let mut file = handle.file.lock().await;
            file.seek(SeekFrom::Start(span.file_offset)).await?;

            let start = data.len();
            data.resize(start + span.length as usize, 0);
            file.read_exact(&mut data[start..]).await?;
        }

        Ok(Bytes::from(data))
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<usize, StorageError> {
        self.check_open()?;
        self.check_range(offset, data.len() as u64)?;

        let mut written = 0usize;
        for span in file_spans(&self.files, offset, data.len() as u64) {
            let handle = self.open_write(span.file_index).await?;
            let mut file = handle.file.lock().await;
            file.seek(SeekFrom::Start(span.file_offset)).await?;

            let chunk = &data[written..written + span.length as usize];
            file.write_all(chunk).await?;
            written += chunk.len();
        }

        Ok(written)
    }

    fn size(&self) -> u64 {
        self.total_length
    }

    async fn complete(&self) -> Result<(), StorageError> {
        self.check_open()?;
        if self.completed.load(Ordering::Acquire) {
            return Ok(());
        }

        self.flush_all().await?;

        for file in &self.files {
            let final_path = self.base_path.join(&file.path);
            let part = part_path(&final_path);

            // Zero-length files never receive a write.
            if !part.exists() {
                ensure_parent_dirs(&part).await?;
                File::create(&part).await?;
            }
            tokio::fs::rename(&part, &final_path).await?;
        }

        self.completed.store(true, Ordering::Release);
        tracing::info!("storage finalized at {}", self.base_path.display());
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.flush_all().await
    }
}

fn part_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(".");
    name.push(PART_EXTENSION);
    PathBuf::from(name)
}

async fn ensure_parent_dirs(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}
