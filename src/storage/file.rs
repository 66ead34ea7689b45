use std::path::PathBuf;

/// A file in the torrent, placed at `offset` within the concatenation of
/// all files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

/// Where a piece lives in the logical byte stream, and what it must hash to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceInfo {
    pub index: u32,
    pub hash: [u8; 20],
    pub offset: u64,
    pub length: u64,
}

/// The part of a byte range that falls inside one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
}

impl FileEntry {
    pub fn new(path: PathBuf, length: u64, offset: u64) -> Self {
        Self {
            path,
            length,
            offset,
        }
    }

    pub fn byte_range(&self) -> std::ops::Range<u64> {
        self.offset..self.offset + self.length
    }
}

impl PieceInfo {
    pub fn new(index: u32, hash: [u8; 20], offset: u64, length: u64) -> Self {
        Self {
            index,
            hash,
            offset,
            length,
        }
    }

    pub fn byte_range(&self) -> std::ops::Range<u64> {
        self.offset..self.offset + self.length
    }

    /// True if `[begin, begin + length)` lies inside the piece.
    pub fn contains_block(&self, begin: u32, length: u32) -> bool {
        length > 0 && begin as u64 + length as u64 <= self.length
    }
}

/// Splits the absolute range `[offset, offset + length)` into per-file spans,
/// in file order. Zero-length files never produce a span.
pub fn file_spans(files: &[FileEntry], offset: u64, length: u64) -> Vec<FileSpan> {
    let mut spans = Vec::new();
    let mut remaining = length;
    let mut current = offset;

    for (file_index, file) in files.iter().enumerate() {
        if remaining == 0 {
            break;
        }

        let file_end = file.offset + file.length;
        if current >= file.offset && current < file_end {
            let take = remaining.min(file_end - current);
            spans.push(FileSpan {
                file_index,
                file_offset: current - file.offset,
                length: take,
            });
            current += take;
            remaining -= take;
        }
    }

    spans
}
