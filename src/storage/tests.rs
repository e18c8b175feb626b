use super::*;
use sha1::{Digest, Sha1};
use std::path::PathBuf;
use tempfile::TempDir;

fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn single_file_storage(temp: &TempDir, piece_length: u64, content: &[Vec<u8>]) -> TorrentStorage {
    let total: u64 = content.iter().map(|p| p.len() as u64).sum();
    let hashes = content.iter().map(|p| sha1_of(p)).collect();
    let files = vec![FileEntry::new(PathBuf::from("test.dat"), total, 0)];
    TorrentStorage::new(
        temp.path().to_path_buf(),
        files,
        piece_length,
        total,
        hashes,
    )
    .expect("storage creation")
}

#[tokio::test]
async fn test_write_then_read_piece() {
    let temp = TempDir::new().unwrap();
    let content = vec![vec![0xAAu8; 16384], vec![0xBBu8; 16384]];
    let storage = single_file_storage(&temp, 16384, &content);

    storage.write_piece(0, &content[0]).await.unwrap();
    storage.write_piece(1, &content[1]).await.unwrap();

    assert_eq!(storage.read_piece(0).await.unwrap().as_ref(), &content[0]);
    assert_eq!(storage.read_piece(1).await.unwrap().as_ref(), &content[1]);
}

#[tokio::test]
async fn test_read_block_within_piece() {
    let temp = TempDir::new().unwrap();
    let content = vec![(0..32768u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>()];
    let storage = single_file_storage(&temp, 32768, &content);

    storage.write_piece(0, &content[0]).await.unwrap();

    let block = storage.read_block(0, 16384, 16384).await.unwrap();
    assert_eq!(block.as_ref(), &content[0][16384..]);
}

#[tokio::test]
async fn test_block_bounds_checked() {
    let temp = TempDir::new().unwrap();
    let content = vec![vec![0u8; 16384]];
    let storage = single_file_storage(&temp, 16384, &content);

    assert!(matches!(
        storage.read_block(0, 16000, 1000).await,
        Err(StorageError::InvalidBlock { .. })
    ));
    assert!(matches!(
        storage.read_piece(5).await,
        Err(StorageError::InvalidPiece(5))
    ));
}

#[tokio::test]
async fn test_piece_spans_multiple_files() {
    let temp = TempDir::new().unwrap();
    let files = vec![
        FileEntry::new(PathBuf::from("a.dat"), 10_000, 0),
        FileEntry::new(PathBuf::from("b.dat"), 10_000, 10_000),
    ];
    let piece0: Vec<u8> = (0..16384u32).map(|i| (i % 256) as u8).collect();
    let piece1: Vec<u8> = (0..3616u32).map(|i| (i % 256) as u8).collect();
    let storage = TorrentStorage::new(
        temp.path().to_path_buf(),
        files,
        16384,
        20_000,
        vec![sha1_of(&piece0), sha1_of(&piece1)],
    )
    .unwrap();

    let spans = storage.piece_spans(0).unwrap();
    assert_eq!(spans.len(), 2, "piece 0 must straddle both files");

    storage.write_piece(0, &piece0).await.unwrap();
    storage.write_piece(1, &piece1).await.unwrap();
    assert_eq!(storage.read_piece(0).await.unwrap().as_ref(), &piece0);
    assert_eq!(storage.read_piece(1).await.unwrap().as_ref(), &piece1);

    assert!(storage.verify_piece(0).await.unwrap());
    assert!(storage.verify_piece(1).await.unwrap());
}

#[tokio::test]
async fn test_verify_detects_corruption() {
    let temp = TempDir::new().unwrap();
    let content = vec![vec![0x11u8; 16384]];
    let storage = single_file_storage(&temp, 16384, &content);

    storage.write_piece(0, &content[0]).await.unwrap();
    assert!(storage.verify_piece(0).await.unwrap());

    // Corrupt one byte on disk behind the storage's back.
    storage.flush().await;
    let path = temp.path().join("test.dat");
    let mut raw = std::fs::read(&path).unwrap();
    raw[100] ^= 0xFF;
    std::fs::write(&path, raw).unwrap();

    assert!(!storage.verify_piece(0).await.unwrap());
}

#[tokio::test]
async fn test_verify_missing_file_is_false_not_error() {
    let temp = TempDir::new().unwrap();
    let content = vec![vec![0x22u8; 16384]];
    let storage = single_file_storage(&temp, 16384, &content);

    let results = storage.verify_all().await.unwrap();
    assert_eq!(results, vec![false]);
}

#[tokio::test]
async fn test_path_traversal_rejected() {
    let temp = TempDir::new().unwrap();
    let files = vec![FileEntry::new(PathBuf::from("../evil.dat"), 100, 0)];
    assert!(matches!(
        TorrentStorage::new(temp.path().to_path_buf(), files, 100, 100, vec![[0u8; 20]]),
        Err(StorageError::PathTraversal(_))
    ));
}

#[tokio::test]
async fn test_verify_all_after_full_write() {
    let temp = TempDir::new().unwrap();
    let content = vec![vec![0x01u8; 16384], vec![0x02u8; 16384], vec![0x03u8; 100]];
    let storage = single_file_storage(&temp, 16384, &content);

    for (i, piece) in content.iter().enumerate() {
        storage.write_piece(i as u32, piece).await.unwrap();
    }
    storage.flush().await;

    assert_eq!(storage.verify_all().await.unwrap(), vec![true, true, true]);
}
