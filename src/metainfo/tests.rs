use super::*;

fn files(lengths: &[u64]) -> Vec<(PathBuf, u64)> {
    lengths
        .iter()
        .enumerate()
        .map(|(i, &len)| (PathBuf::from(format!("file{}.bin", i)), len))
        .collect()
}

#[test]
fn test_new_assigns_offsets_and_pieces() {
    let metainfo = Metainfo::new([1u8; 20], "multi", 1000, vec![[0u8; 20]; 3], files(&[1200, 0, 1300]))
        .unwrap();

    assert_eq!(metainfo.total_length(), 2500);
    let offsets: Vec<u64> = metainfo.files().iter().map(|f| f.offset).collect();
    assert_eq!(offsets, vec![0, 1200, 1200]);

    let pieces = metainfo.pieces();
    assert_eq!(pieces.len(), 3);
    assert_eq!(pieces[1].offset, 1000);
    assert_eq!(pieces[1].length, 1000);
    assert_eq!(pieces[2].length, 500);
    assert_eq!(metainfo.piece_size(3), None);
    assert_eq!(metainfo.piece_hash(2), Some(&[0u8; 20]));
}

#[test]
fn test_single_file() {
    let metainfo = Metainfo::single_file([2u8; 20], "movie.mkv", 16384, vec![[0u8; 20]], 16384).unwrap();
    assert_eq!(metainfo.name(), "movie.mkv");
    assert_eq!(metainfo.files()[0].path, PathBuf::from("movie.mkv"));
    assert_eq!(metainfo.piece_count(), 1);
    assert_eq!(metainfo.info_hash_hex(), "02".repeat(20));
}

#[test]
fn test_validation() {
    assert_eq!(
        Metainfo::new([0u8; 20], "x", 0, vec![], files(&[10])),
        Err(MetainfoError::InvalidPieceLength(0))
    );
    assert_eq!(
        Metainfo::new([0u8; 20], "x", 100, vec![], files(&[0])),
        Err(MetainfoError::Empty)
    );
    assert_eq!(
        Metainfo::new([0u8; 20], "x", 100, vec![[0u8; 20]; 2], files(&[250])),
        Err(MetainfoError::PieceCountMismatch {
            expected: 3,
            actual: 2
        })
    );
    assert!(matches!(
        Metainfo::new([0u8; 20], "x", 100, vec![[0u8; 20]], vec![(PathBuf::new(), 10)]),
        Err(MetainfoError::InvalidPath(_))
    ));
}
