use super::*;
use crate::config::SessionConfig;
use crate::peer::{Bitfield, BlockRequest, PeerId};
use crate::stats::TransferStats;
use sha1::{Digest, Sha1};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

const PIECE_LEN: u64 = 32768;
const BLOCK: u32 = 8192;
const CONTENT_LEN: usize = 3 * PIECE_LEN as usize - 1000;

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

fn pieces_for(data: &[u8]) -> Vec<PieceInfo> {
    data.chunks(PIECE_LEN as usize)
        .enumerate()
        .map(|(i, chunk)| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(Sha1::digest(chunk).as_slice());
            PieceInfo::new(i as u32, hash, i as u64 * PIECE_LEN, chunk.len() as u64)
        })
        .collect()
}

fn test_config() -> SessionConfig {
    SessionConfig::default()
        .with_block_size(BLOCK)
        .with_selection_seed(11)
}

struct Setup {
    repository: PieceRepository,
    storage: Arc<MemoryStorage>,
    data: Vec<u8>,
}

fn setup(config: SessionConfig) -> Setup {
    let data = content(CONTENT_LEN);
    let storage = Arc::new(MemoryStorage::new(data.len() as u64));
    let stats = Arc::new(TransferStats::new(data.len() as u64));
    let repository = PieceRepository::new(pieces_for(&data), storage.clone(), stats, &config);
    Setup {
        repository,
        storage,
        data,
    }
}

fn peer_with(repository: &PieceRepository, pieces: &[usize]) -> PeerId {
    let peer = PeerId::generate();
    repository.register_peer(peer);
    let mut bits = Bitfield::new(repository.piece_count());
    for &p in pieces {
        bits.set(p);
    }
    repository.apply_availability(&peer, &bits, true);
    peer
}

fn piece_bytes(data: &[u8], piece: u32) -> &[u8] {
    let start = piece as usize * PIECE_LEN as usize;
    let end = (start + PIECE_LEN as usize).min(data.len());
    &data[start..end]
}

/// Requests and delivers every block of the peer's current piece.
async fn download_current(repository: &PieceRepository, peer: &PeerId, data: &[u8]) -> WriteOutcome {
    let piece = repository.current_piece(peer).expect("piece selected");
    let bytes = piece_bytes(data, piece);
    loop {
        let blocks = repository.next_block_requests(peer);
        assert!(!blocks.is_empty(), "ran out of blocks before completion");
        for block in blocks {
            assert!(repository.mark_block_acked(peer, block.piece, block.offset));
            let chunk = &bytes[block.offset as usize..block.end() as usize];
            let outcome = repository
                .write_block(block.piece, block.offset, chunk)
                .await
                .unwrap();
            if let WriteOutcome::Completed { .. } = outcome {
                return outcome;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// File layout
// ---------------------------------------------------------------------------

#[test]
fn test_file_spans() {
    let files = vec![
        FileEntry::new(PathBuf::from("a"), 1000, 0),
        FileEntry::new(PathBuf::from("empty"), 0, 1000),
        FileEntry::new(PathBuf::from("b"), 500, 1000),
    ];

    assert_eq!(
        file_spans(&files, 900, 200),
        vec![
            FileSpan {
                file_index: 0,
                file_offset: 900,
                length: 100
            },
            FileSpan {
                file_index: 2,
                file_offset: 0,
                length: 100
            },
        ]
    );
    assert_eq!(file_spans(&files, 1200, 50).len(), 1);
    assert_eq!(files[2].byte_range(), 1000..1500);
}

#[test]
fn test_piece_info_contains_block() {
    let info = PieceInfo::new(0, [0u8; 20], 0, 1000);
    assert!(info.contains_block(0, 1000));
    assert!(info.contains_block(999, 1));
    assert!(!info.contains_block(999, 2));
    assert!(!info.contains_block(0, 0));
    assert_eq!(info.byte_range(), 0..1000);
}

// ---------------------------------------------------------------------------
// Disk storage
// ---------------------------------------------------------------------------

fn disk_files() -> Vec<FileEntry> {
    vec![
        FileEntry::new(PathBuf::from("a.bin"), 1000, 0),
        FileEntry::new(PathBuf::from("empty.bin"), 0, 1000),
        FileEntry::new(PathBuf::from("dir/b.bin"), 500, 1000),
    ]
}

#[tokio::test]
async fn test_disk_storage_spans_files_and_finalizes() {
    let temp = TempDir::new().unwrap();
    let storage = DiskStorage::new(temp.path(), disk_files()).unwrap();
    assert_eq!(storage.size(), 1500);
    assert!(!storage.is_complete());

    storage.preallocate().await.unwrap();
    let part = temp.path().join("a.bin.part");
    assert_eq!(tokio::fs::metadata(&part).await.unwrap().len(), 1000);

    let chunk: Vec<u8> = (0..200).map(|i| i as u8).collect();
    assert_eq!(storage.write(900, &chunk).await.unwrap(), 200);
    assert_eq!(storage.read(900, 200).await.unwrap().as_ref(), &chunk[..]);

    storage.complete().await.unwrap();
    assert!(storage.is_complete());
    assert!(!part.exists());
    assert!(temp.path().join("a.bin").exists());
    assert!(temp.path().join("empty.bin").exists());
    assert!(temp.path().join("dir/b.bin").exists());
    assert_eq!(storage.current_path(0), temp.path().join("a.bin"));

    assert_eq!(storage.read(900, 200).await.unwrap().as_ref(), &chunk[..]);

    let reopened = DiskStorage::new(temp.path(), disk_files()).unwrap();
    assert!(reopened.is_complete());
    assert_eq!(reopened.read(1000, 100).await.unwrap().as_ref(), &chunk[100..]);
}

#[tokio::test]
async fn test_disk_storage_rejects_bad_ranges_and_paths() {
    let temp = TempDir::new().unwrap();
    assert!(matches!(
        DiskStorage::new(
            temp.path(),
            vec![FileEntry::new(PathBuf::from("../evil"), 10, 0)]
        ),
        Err(StorageError::PathTraversal(_))
    ));

    let storage = DiskStorage::new(temp.path(), disk_files()).unwrap();
    assert!(matches!(
        storage.write(1400, &[0u8; 200]).await,
        Err(StorageError::InvalidRange { .. })
    ));
    assert!(matches!(
        storage.read(0, 10).await,
        Err(StorageError::FileNotFound(_))
    ));

    storage.close().await.unwrap();
    storage.close().await.unwrap();
    assert!(matches!(
        storage.write(0, &[1]).await,
        Err(StorageError::Closed)
    ));
}

// ---------------------------------------------------------------------------
// Memory storage
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_memory_storage() {
    let storage = MemoryStorage::new(100);
    storage.write(10, b"hello").await.unwrap();
    assert_eq!(storage.read(10, 5).await.unwrap().as_ref(), b"hello");
    assert_eq!(&storage.contents()[10..15], b"hello");

    assert!(matches!(
        storage.read(98, 5).await,
        Err(StorageError::InvalidRange { .. })
    ));

    storage.complete().await.unwrap();
    assert!(storage.is_complete());
    storage.close().await.unwrap();
    assert!(matches!(storage.read(0, 1).await, Err(StorageError::Closed)));
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

#[test]
fn test_selector_prefers_rarest() {
    let mut selector = PieceSelector::new(40, Some(1));
    let frequency = [3, 1, 2, 1, 5];
    for _ in 0..20 {
        let picked = selector.pick(0..5, &frequency).unwrap();
        assert!(picked == 1 || picked == 3);
    }
    assert_eq!(selector.pick(std::iter::empty(), &frequency), None);
}

#[test]
fn test_selector_pool_cap_and_seed() {
    let mut capped = PieceSelector::new(1, None);
    assert_eq!(capped.pick(vec![4, 2, 0], &[1, 1, 1, 1, 1]), Some(4));

    let frequency = [0u32; 64];
    let mut a = PieceSelector::new(40, Some(99));
    let mut b = PieceSelector::new(40, Some(99));
    for _ in 0..10 {
        let picked = a.pick(0..64, &frequency);
        assert_eq!(picked, b.pick(0..64, &frequency));
        assert!(picked.unwrap() < 40);
    }
}

// ---------------------------------------------------------------------------
// Repository: availability and selection
// ---------------------------------------------------------------------------

#[test]
fn test_availability_counts_transitions_only() {
    let s = setup(test_config());
    let repo = &s.repository;

    let a = peer_with(repo, &[0, 1]);
    let b = peer_with(repo, &[1, 2]);
    assert_eq!(repo.frequency(0), 1);
    assert_eq!(repo.frequency(1), 2);
    assert_eq!(repo.frequency(2), 1);

    let mut again = Bitfield::new(3);
    again.set(1);
    assert_eq!(repo.apply_availability(&a, &again, true), 0);
    assert_eq!(repo.frequency(1), 2);

    assert!(repo.set_peer_has_piece(&a, 2, true).unwrap());
    assert!(!repo.set_peer_has_piece(&a, 2, true).unwrap());
    assert_eq!(repo.frequency(2), 2);
    assert!(repo.set_peer_has_piece(&a, 9, true).is_err());

    assert_eq!(repo.apply_availability(&b, &again, false), 1);
    assert_eq!(repo.frequency(1), 1);

    repo.unregister_peer(&a);
    repo.unregister_peer(&a);
    assert_eq!(repo.frequency(0), 0);
    assert_eq!(repo.frequency(1), 0);
    assert_eq!(repo.frequency(2), 1);
    assert!(!repo.peer_has_piece(&a, 0));
}

#[test]
fn test_select_rarest_first() {
    let s = setup(test_config());
    let repo = &s.repository;

    let a = peer_with(repo, &[0, 1, 2]);
    peer_with(repo, &[0, 2]);
    peer_with(repo, &[0]);

    assert_eq!(repo.select_next_piece(&a).unwrap(), Some(1));
    assert!(repo.is_in_flight(1));
    assert_eq!(repo.current_piece(&a), Some(1));
    assert!(matches!(
        repo.select_next_piece(&a),
        Err(RepositoryError::AlreadyDownloading)
    ));
}

#[test]
fn test_in_flight_pieces_excluded_before_endgame() {
    let s = setup(test_config());
    let repo = &s.repository;

    let a = peer_with(repo, &[0]);
    let b = peer_with(repo, &[0]);
    let unknown = PeerId::generate();

    assert_eq!(repo.select_next_piece(&a).unwrap(), Some(0));
    assert_eq!(repo.select_next_piece(&b).unwrap(), None);
    assert_eq!(repo.select_next_piece(&unknown).unwrap(), None);
    assert_eq!(repo.in_flight_count(), 1);
}

#[test]
fn test_request_queue_is_bounded() {
    let s = setup(test_config().with_request_queue_len(3));
    let repo = &s.repository;
    let a = peer_with(repo, &[2]);

    repo.select_next_piece(&a).unwrap();
    let first = repo.next_block_requests(&a);
    assert_eq!(
        first,
        vec![
            BlockRequest::new(2, 0, BLOCK),
            BlockRequest::new(2, BLOCK, BLOCK),
            BlockRequest::new(2, 2 * BLOCK, BLOCK),
        ]
    );
    assert!(repo.next_block_requests(&a).is_empty());

    assert!(repo.mark_block_acked(&a, 2, 0));
    assert!(!repo.mark_block_acked(&a, 2, 0));
    assert!(!repo.mark_block_acked(&a, 1, BLOCK));

    let last_len = (CONTENT_LEN as u64 - 2 * PIECE_LEN) as u32 - 3 * BLOCK;
    assert_eq!(
        repo.next_block_requests(&a),
        vec![BlockRequest::new(2, 3 * BLOCK, last_len)]
    );
    assert!(repo.next_block_requests(&a).is_empty());
}

// ---------------------------------------------------------------------------
// Repository: writes and verification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_complete_piece_is_verified_and_stored() {
    let s = setup(test_config());
    let repo = &s.repository;
    let a = peer_with(repo, &[1]);

    repo.select_next_piece(&a).unwrap();
    let outcome = download_current(repo, &a, &s.data).await;
    assert_eq!(outcome, WriteOutcome::Completed { displaced: vec![] });

    assert!(repo.is_piece_complete(1));
    assert!(!repo.is_in_flight(1));
    assert_eq!(repo.current_piece(&a), None);
    assert_eq!(repo.completed_count(), 1);
    assert!(repo.completed_bitfield().has(1));

    let start = PIECE_LEN as usize;
    assert_eq!(
        &s.storage.contents()[start..start + PIECE_LEN as usize],
        piece_bytes(&s.data, 1)
    );

    let snapshot = repo.stats().snapshot();
    assert_eq!(snapshot.downloaded, PIECE_LEN);
    assert_eq!(snapshot.left, CONTENT_LEN as u64 - PIECE_LEN);

    let block = repo.read_block(1, BLOCK, 100).await.unwrap();
    assert_eq!(block.as_ref(), &piece_bytes(&s.data, 1)[BLOCK as usize..BLOCK as usize + 100]);

    assert_eq!(
        repo.write_block(1, 0, &[0u8; 10]).await.unwrap(),
        WriteOutcome::Duplicate
    );
    assert_eq!(repo.downloadable_count(&a), 0);
    assert!(!repo.is_piece_downloadable(1));
}

#[tokio::test]
async fn test_corrupt_piece_returns_to_pool() {
    let s = setup(test_config());
    let repo = &s.repository;
    let a = peer_with(repo, &[0]);

    repo.select_next_piece(&a).unwrap();
    let blocks = repo.next_block_requests(&a);
    let mut result = Ok(WriteOutcome::Accepted);
    for block in blocks {
        repo.mark_block_acked(&a, block.piece, block.offset);
        result = repo
            .write_block(block.piece, block.offset, &vec![0xee; block.length as usize])
            .await;
    }

    assert!(matches!(result, Err(RepositoryError::PieceCorrupt(0))));
    assert!(!repo.is_piece_complete(0));
    assert!(!repo.is_in_flight(0));
    assert_eq!(repo.current_piece(&a), None);
    assert_eq!(repo.stats().snapshot().downloaded, 0);

    assert_eq!(repo.select_next_piece(&a).unwrap(), Some(0));
    assert_eq!(repo.next_block_requests(&a)[0], BlockRequest::new(0, 0, BLOCK));
    let outcome = {
        let bytes = piece_bytes(&s.data, 0);
        let mut outcome = WriteOutcome::Accepted;
        for offset in (0..PIECE_LEN as u32).step_by(BLOCK as usize) {
            let chunk = &bytes[offset as usize..(offset + BLOCK) as usize];
            outcome = repo.write_block(0, offset, chunk).await.unwrap();
        }
        outcome
    };
    assert!(matches!(outcome, WriteOutcome::Completed { .. }));
}

#[tokio::test]
async fn test_write_without_selection_is_rejected() {
    let s = setup(test_config());
    let repo = &s.repository;

    assert!(matches!(
        repo.write_block(0, 0, &[1u8; 16]).await,
        Err(RepositoryError::NoOpenBuffer(0))
    ));
    assert!(matches!(
        repo.write_block(7, 0, &[1u8; 16]).await,
        Err(RepositoryError::InvalidPieceIndex(7))
    ));
    assert!(matches!(
        repo.read_block(0, 0, 16).await,
        Err(RepositoryError::NotOnDisk(0))
    ));
}

#[tokio::test]
async fn test_cancel_by_last_holder_releases_buffer() {
    let s = setup(test_config());
    let repo = &s.repository;
    let a = peer_with(repo, &[0]);

    repo.select_next_piece(&a).unwrap();
    let blocks = repo.next_block_requests(&a);
    repo.mark_block_acked(&a, 0, 0);
    let first = &piece_bytes(&s.data, 0)[..BLOCK as usize];
    assert_eq!(
        repo.write_block(0, 0, first).await.unwrap(),
        WriteOutcome::Accepted
    );
    assert!(repo.check_piece_has_block(0, 0));

    let cancelled = repo.cancel_all(&a);
    assert_eq!(cancelled, blocks[1..].to_vec());
    assert!(repo.cancel_all(&a).is_empty());
    assert!(!repo.is_in_flight(0));
    assert!(!repo.check_piece_has_block(0, 0));

    assert_eq!(repo.select_next_piece(&a).unwrap(), Some(0));
    assert_eq!(repo.next_block_requests(&a)[0], BlockRequest::new(0, 0, BLOCK));
}

#[tokio::test]
async fn test_unregister_returns_in_flight_blocks() {
    let s = setup(test_config());
    let repo = &s.repository;
    let a = peer_with(repo, &[0, 1, 2]);

    repo.select_next_piece(&a).unwrap();
    let blocks = repo.next_block_requests(&a);
    assert_eq!(repo.unregister_peer(&a), blocks);
    assert_eq!(repo.in_flight_count(), 0);
    assert!(repo.unregister_peer(&a).is_empty());
}

// ---------------------------------------------------------------------------
// Repository: endgame
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_endgame_allows_shared_pieces_and_first_writer_wins() {
    let s = setup(test_config().with_endgame_threshold(0.0));
    let repo = &s.repository;
    assert!(repo.has_reached_endgame());

    let a = peer_with(repo, &[0]);
    let b = peer_with(repo, &[0]);

    assert_eq!(repo.select_next_piece(&a).unwrap(), Some(0));
    assert_eq!(repo.select_next_piece(&b).unwrap(), Some(0));
    let from_a = repo.next_block_requests(&a);
    let from_b = repo.next_block_requests(&b);
    assert_eq!(from_a, from_b);

    let bytes = piece_bytes(&s.data, 0);
    let first = &bytes[..BLOCK as usize];

    assert!(repo.mark_block_acked(&a, 0, 0));
    assert_eq!(
        repo.write_block(0, 0, first).await.unwrap(),
        WriteOutcome::Accepted
    );
    assert_eq!(
        repo.take_redundant_requests(0, 0, &a),
        vec![(b, BlockRequest::new(0, 0, BLOCK))]
    );
    assert!(!repo.mark_block_acked(&b, 0, 0));
    assert!(repo.check_piece_has_block(0, 0));
    assert_eq!(
        repo.write_block(0, 0, first).await.unwrap(),
        WriteOutcome::Duplicate
    );

    repo.cancel_all(&a);
    assert!(repo.is_in_flight(0));
    assert!(repo.check_piece_has_block(0, 0));

    let mut outcome = WriteOutcome::Accepted;
    for block in &from_b[1..] {
        assert!(repo.mark_block_acked(&b, 0, block.offset));
        let chunk = &bytes[block.offset as usize..block.end() as usize];
        outcome = repo.write_block(0, block.offset, chunk).await.unwrap();
    }
    assert_eq!(outcome, WriteOutcome::Completed { displaced: vec![] });
    assert!(repo.is_piece_complete(0));
}

#[tokio::test]
async fn test_concurrent_final_writes_complete_once() {
    let s = setup(test_config().with_endgame_threshold(0.0));
    let repo = &s.repository;

    let a = peer_with(repo, &[0]);
    let b = peer_with(repo, &[0]);
    repo.select_next_piece(&a).unwrap();
    repo.select_next_piece(&b).unwrap();
    let blocks = repo.next_block_requests(&a);
    repo.next_block_requests(&b);
    assert_eq!(blocks.len(), 4);

    let bytes = piece_bytes(&s.data, 0);
    let (last, rest) = blocks.split_last().unwrap();
    for block in rest {
        let chunk = &bytes[block.offset as usize..block.end() as usize];
        assert_eq!(
            repo.write_block(0, block.offset, chunk).await.unwrap(),
            WriteOutcome::Accepted
        );
    }

    let chunk = &bytes[last.offset as usize..last.end() as usize];
    let (from_a, from_b) = tokio::join!(
        repo.write_block(0, last.offset, chunk),
        repo.write_block(0, last.offset, chunk),
    );
    let outcomes = [from_a.unwrap(), from_b.unwrap()];

    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, WriteOutcome::Completed { .. }))
        .count();
    assert_eq!(completed, 1);
    assert!(outcomes.contains(&WriteOutcome::Duplicate));
    assert!(repo.is_piece_complete(0));
    assert!(!repo.is_in_flight(0));
    assert_eq!(repo.stats().snapshot().downloaded, PIECE_LEN);
    assert_eq!(s.storage.contents()[..PIECE_LEN as usize], *bytes);
}

#[tokio::test]
async fn test_completion_displaces_other_holders() {
    let s = setup(test_config().with_endgame_threshold(0.0));
    let repo = &s.repository;

    let a = peer_with(repo, &[1]);
    let b = peer_with(repo, &[1]);
    repo.select_next_piece(&a).unwrap();
    repo.select_next_piece(&b).unwrap();
    let from_b = repo.next_block_requests(&b);

    let outcome = download_current(repo, &a, &s.data).await;
    assert_eq!(
        outcome,
        WriteOutcome::Completed {
            displaced: vec![(b, from_b)]
        }
    );
    assert_eq!(repo.current_piece(&b), None);
    assert_eq!(repo.select_next_piece(&b).unwrap(), None);
}

#[test]
fn test_endgame_threshold() {
    let s = setup(test_config());
    assert!(!s.repository.has_reached_endgame());
    let s = setup(test_config().with_endgame_threshold(1.0));
    assert!(!s.repository.has_reached_endgame());
}

// ---------------------------------------------------------------------------
// Repository: resume and finalization
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_check_on_disk_and_finalize() {
    let data = content(CONTENT_LEN);
    let mut stored = data.clone();
    stored[PIECE_LEN as usize + 5] ^= 0xff;

    let storage = Arc::new(MemoryStorage::with_data(stored));
    let stats = Arc::new(TransferStats::new(data.len() as u64));
    let repo = PieceRepository::new(pieces_for(&data), storage.clone(), stats, &test_config());

    assert!(repo.check_on_disk(0).await.unwrap());
    assert!(!repo.check_on_disk(1).await.unwrap());
    assert!(repo.check_on_disk(2).await.unwrap());
    assert!(repo.check_on_disk(0).await.unwrap());

    assert_eq!(repo.completed_count(), 2);
    let snapshot = repo.stats().snapshot();
    assert_eq!(snapshot.downloaded, 0);
    assert_eq!(snapshot.left, PIECE_LEN);

    assert!(!repo.finalize_if_complete().await.unwrap());

    let a = peer_with(&repo, &[0, 1, 2]);
    assert_eq!(repo.downloadable_count(&a), 1);
    assert_eq!(repo.select_next_piece(&a).unwrap(), Some(1));
    download_current(&repo, &a, &data).await;

    assert!(repo.is_complete());
    assert!(repo.finalize_if_complete().await.unwrap());
    assert!(!repo.finalize_if_complete().await.unwrap());
    assert!(storage.is_complete());
    assert_eq!(storage.contents(), data);
}

#[tokio::test]
async fn test_storage_failure_is_reported_and_piece_released() {
    let s = setup(test_config());
    let repo = &s.repository;
    let a = peer_with(repo, &[0]);

    repo.select_next_piece(&a).unwrap();
    s.storage.close().await.unwrap();

    let bytes = piece_bytes(&s.data, 0);
    let mut result = Ok(WriteOutcome::Accepted);
    for offset in (0..PIECE_LEN as u32).step_by(BLOCK as usize) {
        let chunk = &bytes[offset as usize..(offset + BLOCK) as usize];
        result = repo.write_block(0, offset, chunk).await;
    }

    let err = result.unwrap_err();
    assert!(err.is_storage_failure());
    assert!(!repo.is_in_flight(0));
    assert!(!repo.is_piece_complete(0));
    assert_eq!(repo.current_piece(&a), None);
}
