use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use sha1::{Digest, Sha1};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as TokioMutex;

use super::error::StorageError;
use super::file::{spans_for_range, FileEntry, FileSpan};

struct OpenHandle {
    file: TokioMutex<File>,
    writable: bool,
}

/// Block-addressed storage over the torrent's files.
///
/// Handles are opened lazily and cached; files come into existence sparse
/// on first write. The piece hash list is kept so completed pieces can be
/// re-verified against the disk at resume time.
pub struct TorrentStorage {
    root: PathBuf,
    files: Vec<FileEntry>,
    piece_length: u64,
    total_length: u64,
    piece_hashes: Vec<[u8; 20]>,
    handles: DashMap<usize, Arc<OpenHandle>>,
}

impl TorrentStorage {
    pub fn new(
        root: PathBuf,
        files: Vec<FileEntry>,
        piece_length: u64,
        total_length: u64,
        piece_hashes: Vec<[u8; 20]>,
    ) -> Result<Self, StorageError> {
        for file in &files {
            validate_relative(&file.path)?;
        }
        Ok(Self {
            root,
            files,
            piece_length,
            total_length,
            piece_hashes,
            handles: DashMap::new(),
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_size(&self, index: u32) -> u64 {
        let count = self.piece_hashes.len() as u64;
        if count == 0 {
            0
        } else if u64::from(index) + 1 < count {
            self.piece_length
        } else {
            self.total_length - (count - 1) * self.piece_length
        }
    }

    /// Bytes currently on disk across all files, for diagnostics.
    pub async fn size_on_disk(&self) -> u64 {
        let mut total = 0u64;
        for file in &self.files {
            if let Ok(meta) = tokio::fs::metadata(self.root.join(&file.path)).await {
                total += meta.len();
            }
        }
        total
    }

    /// Reads a whole piece from disk.
    pub async fn read_piece(&self, index: u32) -> Result<Bytes, StorageError> {
        let length = self.checked_piece(index)?;
        self.read_range(u64::from(index) * self.piece_length, length)
            .await
    }

    /// Reads one block of a piece.
    pub async fn read_block(
        &self,
        piece: u32,
        offset: u32,
        length: u32,
    ) -> Result<Bytes, StorageError> {
        let piece_len = self.checked_piece(piece)?;
        if u64::from(offset) + u64::from(length) > piece_len {
            return Err(StorageError::InvalidBlock {
                piece,
                offset,
                length,
            });
        }
        self.read_range(
            u64::from(piece) * self.piece_length + u64::from(offset),
            u64::from(length),
        )
        .await
    }

    /// Writes a verified piece. The caller guarantees the data passed
    /// hash verification; nothing unverified is ever handed here.
    pub async fn write_piece(&self, index: u32, data: &[u8]) -> Result<(), StorageError> {
        let length = self.checked_piece(index)?;
        if data.len() as u64 != length {
            return Err(StorageError::InvalidBlock {
                piece: index,
                offset: 0,
                length: data.len() as u32,
            });
        }
        self.write_range(u64::from(index) * self.piece_length, data)
            .await
    }

    /// Re-verifies one piece against the bytes on disk. Missing files
    /// simply fail verification.
    pub async fn verify_piece(&self, index: u32) -> Result<bool, StorageError> {
        let expected = *self
            .piece_hashes
            .get(index as usize)
            .ok_or(StorageError::InvalidPiece(index))?;
        let data = match self.read_piece(index).await {
            Ok(data) => data,
            Err(StorageError::Io(_)) => return Ok(false),
            Err(other) => return Err(other),
        };

        let matches = tokio::task::spawn_blocking(move || {
            let mut hasher = Sha1::new();
            hasher.update(&data);
            let digest: [u8; 20] = hasher.finalize().into();
            digest == expected
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;
        Ok(matches)
    }

    /// Verifies every piece, in bounded batches. Returns one flag per
    /// piece.
    pub async fn verify_all(&self) -> Result<Vec<bool>, StorageError> {
        const BATCH: usize = 32;
        const BATCH_TIMEOUT: Duration = Duration::from_secs(120);

        let count = self.piece_hashes.len();
        let mut results = vec![false; count];

        for start in (0..count).step_by(BATCH) {
            let end = (start + BATCH).min(count);
            let batch = (start..end).map(|i| self.verify_piece(i as u32));
            let outcomes =
                match tokio::time::timeout(BATCH_TIMEOUT, futures::future::join_all(batch)).await {
                    Ok(outcomes) => outcomes,
                    Err(_) => {
                        tracing::warn!(start, end, "verification batch timed out");
                        continue;
                    }
                };
            for (i, outcome) in outcomes.into_iter().enumerate() {
                results[start + i] = outcome.unwrap_or(false);
            }
        }

        Ok(results)
    }

    /// Syncs every writable handle; the barrier before resume snapshots
    /// and shutdown.
    pub async fn flush(&self) {
        let keys: Vec<usize> = self.handles.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, handle)) = self.handles.remove(&key) {
                if handle.writable {
                    let file = handle.file.lock().await;
                    if let Err(error) = file.sync_data().await {
                        tracing::warn!(%error, "sync failed during flush");
                    }
                }
            }
        }
    }

    fn checked_piece(&self, index: u32) -> Result<u64, StorageError> {
        if (index as usize) < self.piece_hashes.len() {
            Ok(self.piece_size(index))
        } else {
            Err(StorageError::InvalidPiece(index))
        }
    }

    async fn read_range(&self, start: u64, length: u64) -> Result<Bytes, StorageError> {
        let mut out = Vec::with_capacity(length as usize);
        for span in spans_for_range(&self.files, start, length) {
            let handle = self.handle(span.file_index, false).await?;
            let mut file = handle.file.lock().await;
            file.seek(SeekFrom::Start(span.file_offset)).await?;
            let mut buf = vec![0u8; span.length as usize];
            file.read_exact(&mut buf).await?;
            out.extend_from_slice(&buf);
        }
        Ok(Bytes::from(out))
    }

    async fn write_range(&self, start: u64, data: &[u8]) -> Result<(), StorageError> {
        let mut consumed = 0usize;
        for span in spans_for_range(&self.files, start, data.len() as u64) {
            let handle = self.handle(span.file_index, true).await?;
            let mut file = handle.file.lock().await;
            file.seek(SeekFrom::Start(span.file_offset)).await?;
            file.write_all(&data[consumed..consumed + span.length as usize])
                .await?;
            consumed += span.length as usize;
        }
        Ok(())
    }

    async fn handle(&self, file_index: usize, write: bool) -> Result<Arc<OpenHandle>, StorageError> {
        if let Some(handle) = self.handles.get(&file_index) {
            if handle.writable || !write {
                return Ok(handle.clone());
            }
            drop(handle);
            self.handles.remove(&file_index);
        }

        let path = self.root.join(&self.files[file_index].path);
        let file = if write {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            // Sparse creation: the file appears at full logical size only
            // as pieces land in it.
            OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .await?
        } else {
            File::open(&path).await?
        };

        let handle = Arc::new(OpenHandle {
            file: TokioMutex::new(file),
            writable: write,
        });
        self.handles.insert(file_index, handle.clone());
        Ok(handle)
    }

    /// Spans a piece maps onto, exposed for tests.
    pub fn piece_spans(&self, index: u32) -> Result<Vec<FileSpan>, StorageError> {
        let length = self.checked_piece(index)?;
        Ok(spans_for_range(
            &self.files,
            u64::from(index) * self.piece_length,
            length,
        ))
    }
}

fn validate_relative(path: &Path) -> Result<(), StorageError> {
    for component in path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}
